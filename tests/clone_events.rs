use std::time::{Duration, Instant};

use anyhow::Result;
use ntest::timeout;

use grapple::{Command, Debugger, EventStatus};

mod support;
use support::*;

/// Target body for `tracks_clone_created_threads`: re-invoked as a traced
/// child, it fans out a few short-lived threads. Filtered out of normal runs.
#[test]
#[ignore]
fn clone_helper() {
    let workers: Vec<_> = (0..3)
        .map(|_| std::thread::spawn(|| std::thread::sleep(Duration::from_millis(400))))
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
#[timeout(60000)]
fn tracks_clone_created_threads() -> Result<()> {
    let exe = std::env::current_exe()?;
    let exe = exe.to_str().expect("test binary path is valid UTF-8");

    let cmd = Command::new(vec![
        exe.to_string(),
        "--ignored".to_string(),
        "--exact".to_string(),
        "clone_helper".to_string(),
        "--test-threads=1".to_string(),
    ])?;

    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&cmd)?;
    let pid = process.pid();

    process.resume()?;

    // Every clone event must land its tid in the thread map within the same
    // pump call, so sampling the map between calls observes the fan-out.
    let mut most_threads = process.threads().len();
    let deadline = Instant::now() + Duration::from_secs(30);

    while Instant::now() < deadline {
        process.next_debug_event(PUMP_TIMEOUT, |_| EventStatus::Continue)?;
        most_threads = most_threads.max(process.threads().len());

        if process.threads().is_empty() {
            break;
        }
    }

    assert!(
        process.threads().is_empty(),
        "helper never ran to completion"
    );
    assert!(
        most_threads >= 4,
        "expected the leader plus three clones, saw at most {most_threads}"
    );

    drop(process);
    kill_and_reap(pid);

    Ok(())
}
