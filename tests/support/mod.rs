#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use grapple::{Command, EventStatus, Pid, Process, Signal};

/// Timeout for a single event-pump call. Tests loop the pump against a
/// deadline instead of betting on one long wait.
pub const PUMP_TIMEOUT: Duration = Duration::from_millis(500);

fn which(candidates: &[&str]) -> String {
    candidates
        .iter()
        .find(|path| Path::new(path).exists())
        .unwrap_or_else(|| panic!("none of {candidates:?} exists"))
        .to_string()
}

/// A target that parks long enough for the test to poke at it.
pub fn sleep_command(seconds: &str) -> Command {
    let path = which(&["/bin/sleep", "/usr/bin/sleep"]);
    Command::new(vec![path, seconds.to_string()]).expect("NUL-free argv")
}

/// A target that exits immediately.
pub fn true_command() -> Command {
    let path = which(&["/bin/true", "/usr/bin/true"]);
    Command::new(vec![path]).expect("NUL-free argv")
}

/// Pumps events (always resuming) until `pred` holds or `total` elapses.
pub fn pump_until(
    process: &mut Process<'_>,
    total: Duration,
    mut pred: impl FnMut(&Process<'_>) -> bool,
) -> grapple::Result<bool> {
    let deadline = Instant::now() + total;

    loop {
        if pred(process) {
            return Ok(true);
        }

        if Instant::now() >= deadline {
            return Ok(false);
        }

        process.next_debug_event(PUMP_TIMEOUT, |_| EventStatus::Continue)?;
    }
}

/// Pumps until at least one event is delivered, leaving its thread stopped.
/// Returns how many events arrived.
pub fn pump_one_stop(process: &mut Process<'_>, total: Duration) -> grapple::Result<usize> {
    let deadline = Instant::now() + total;
    let mut delivered = 0usize;

    while delivered == 0 && Instant::now() < deadline {
        process.next_debug_event(PUMP_TIMEOUT, |_| {
            delivered += 1;
            EventStatus::Stop
        })?;
    }

    Ok(delivered)
}

/// Best-effort teardown of a spawned target.
pub fn kill_and_reap(pid: Pid) {
    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
    let _ = nix::sys::wait::waitpid(pid, None);
}
