use std::time::Duration;

use anyhow::Result;
use ntest::timeout;

use grapple::{Command, Debugger, Error};

mod support;
use support::*;

#[test]
#[timeout(30000)]
fn spawned_child_stops_at_exec_then_runs_to_exit() -> Result<()> {
    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&true_command())?;
    let pid = process.pid();

    assert_eq!(process.threads().len(), 1);

    let leader = process.find_thread(pid).expect("leader thread is tracked");
    assert!(leader.is_stopped());
    assert_eq!(leader.stop_status(), libc::SIGTRAP);

    process.resume()?;

    let exited = pump_until(&mut process, Duration::from_secs(10), |p| {
        p.threads().is_empty()
    })?;
    assert!(exited, "child never reported its exit");
    assert!(process.active_thread().is_none());

    Ok(())
}

#[test]
#[timeout(30000)]
fn spawn_of_missing_binary_reports_the_exec_failure() -> Result<()> {
    let debugger = Debugger::new()?;
    let cmd = Command::new(vec!["/grapple-does-not-exist"])?;

    let err = debugger
        .spawn(&cmd)
        .map(|_| ())
        .expect_err("spawn of a missing binary must fail");

    match err {
        Error::ChildAborted { message, .. } => {
            assert!(message.contains("exec"), "unexpected message: {message}");
        }
        other => panic!("expected ChildAborted, got {other}"),
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn spawn_honors_the_working_directory() -> Result<()> {
    let debugger = Debugger::new()?;
    let cmd = sleep_command("5").current_dir("/")?;

    let process = debugger.spawn(&cmd)?;
    let pid = process.pid();

    let cwd = std::fs::read_link(format!("/proc/{pid}/cwd"))?;
    assert_eq!(cwd, std::path::PathBuf::from("/"));

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn attach_adopts_every_thread_of_a_child() -> Result<()> {
    use std::process::Command as StdCommand;

    // An untraced child first; attach afterwards.
    let mut child = StdCommand::new("sleep").arg("5").spawn()?;
    let pid = grapple::Pid::from_raw(child.id() as i32);

    // Give it a moment to finish exec.
    std::thread::sleep(Duration::from_millis(200));

    let debugger = Debugger::new()?;
    {
        let process = debugger.attach(pid)?;

        assert!(!process.threads().is_empty());
        let leader = process.find_thread(pid).expect("leader thread is tracked");
        assert!(leader.is_stopped());
        assert!(process.active_thread().is_some());
    }

    // Detached on drop; the sleeper is still alive and killable.
    child.kill()?;
    child.wait()?;

    Ok(())
}
