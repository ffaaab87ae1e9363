use std::os::unix::fs::FileExt;
use std::time::Duration;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;

use grapple::{Debugger, RegisterId};

mod support;
use support::*;

/// Reads target memory without going through the debugger, so planted trap
/// bytes are visible.
fn raw_read(pid: grapple::Pid, address: u64, n: usize) -> Result<Vec<u8>> {
    let mem = std::fs::File::open(format!("/proc/{pid}/mem"))?;
    let mut buf = vec![0u8; n];
    mem.read_exact_at(&mut buf, address)?;
    Ok(buf)
}

#[test]
#[timeout(30000)]
fn memory_reads_mask_planted_breakpoints() -> Result<()> {
    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let ip = process
        .find_thread(pid)
        .expect("leader thread is tracked")
        .get_instruction_pointer()?;

    let mut original = [0u8; 4];
    assert_eq!(process.read_memory(ip, &mut original)?, 4);

    process.add_breakpoint(ip)?;

    // The engine view is unchanged; the raw view shows the trap byte.
    let mut masked = [0u8; 4];
    assert_eq!(process.read_memory(ip, &mut masked)?, 4);
    assert_eq!(masked, original);
    assert_eq!(raw_read(pid, ip, 1)?, vec![0xcc]);

    let bp = process.find_breakpoint(ip).expect("breakpoint is registered");
    assert_eq!(bp.old_bytes(), &original[..1]);
    assert_eq!(bp.new_bytes(), &[0xcc]);

    process.remove_breakpoint(ip)?;
    assert_eq!(raw_read(pid, ip, 4)?, original);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn breakpoint_hit_rewinds_ip_and_counts() -> Result<()> {
    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let ip = process
        .find_thread(pid)
        .expect("leader thread is tracked")
        .get_instruction_pointer()?;

    process.add_breakpoint(ip)?;
    process.resume()?;

    let delivered = pump_one_stop(&mut process, Duration::from_secs(5))?;
    assert_eq!(delivered, 1);

    let active = process.active_thread().expect("a stop promoted a thread");
    assert!(active.is_stopped());
    assert_eq!(active.get_instruction_pointer()?, ip);

    let mut ctx = active.get_context()?;
    assert_eq!(ctx.get(RegisterId::Xip).read::<u64>(), ip);

    let bp = process.find_breakpoint(ip).expect("breakpoint is registered");
    assert_eq!(bp.hit_count(), 1);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn stop_request_halts_a_running_target() -> Result<()> {
    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    process.resume()?;
    process.stop()?;

    let delivered = pump_one_stop(&mut process, Duration::from_secs(5))?;
    assert!(delivered >= 1, "stop request never produced a stop event");

    let active = process.active_thread().expect("the stop promoted a thread");
    assert_eq!(active.state(), grapple::RunState::Stopped);
    assert!(active.is_stopped());
    assert_eq!(active.stop_status(), libc::SIGSTOP);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn teardown_restores_original_bytes() -> Result<()> {
    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let ip = process
        .find_thread(pid)
        .expect("leader thread is tracked")
        .get_instruction_pointer()?;

    let mut original = [0u8; 2];
    assert_eq!(process.read_memory(ip, &mut original)?, 2);

    process.add_breakpoint(ip)?;
    process.add_breakpoint(ip + 1)?;
    assert_eq!(raw_read(pid, ip, 2)?, vec![0xcc, 0xcc]);

    // Dropping the process restores every breakpoint before detaching.
    drop(process);

    assert_eq!(raw_read(pid, ip, 2)?, original);

    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn breakpoint_in_unmapped_memory_is_rejected() -> Result<()> {
    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let err = process.add_breakpoint(0x10).expect_err("unmapped address");
    assert!(matches!(err, grapple::Error::ShortTransfer { .. }));
    assert!(process.find_breakpoint(0x10).is_none());

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn disabled_breakpoints_do_not_mask_reads() -> Result<()> {
    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let ip = process
        .find_thread(pid)
        .expect("leader thread is tracked")
        .get_instruction_pointer()?;

    let mut original = [0u8; 1];
    process.read_memory(ip, &mut original)?;

    process.add_breakpoint(ip)?;
    process.disable_breakpoint(ip)?;

    // Enable/disable is a write barrier: the target bytes are back.
    assert_eq!(raw_read(pid, ip, 1)?, original);
    assert!(!process
        .find_breakpoint(ip)
        .expect("breakpoint stays registered")
        .is_enabled());

    // Toggling twice is idempotent.
    process.disable_breakpoint(ip)?;
    process.enable_breakpoint(ip)?;
    process.enable_breakpoint(ip)?;
    assert_eq!(raw_read(pid, ip, 1)?, vec![0xcc]);

    let mut masked = [0u8; 1];
    process.read_memory(ip, &mut masked)?;
    assert_eq!(masked, original);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}
