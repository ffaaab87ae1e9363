use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;

use grapple::proc::enumerate_regions;
use grapple::Debugger;

mod support;
use support::*;

#[test]
#[timeout(30000)]
fn memory_writes_read_back() -> Result<()> {
    let debugger = Debugger::new()?;
    let process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let region = enumerate_regions(pid)
        .into_iter()
        .find(|r| r.is_readable() && r.is_writable())
        .expect("a writable region exists at the exec stop");
    let address = region.start();

    let mut saved = [0u8; 8];
    assert_eq!(process.read_memory(address, &mut saved)?, 8);

    let pattern = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
    assert_eq!(process.write_memory(address, &pattern)?, 8);

    let mut readback = [0u8; 8];
    assert_eq!(process.read_memory(address, &mut readback)?, 8);
    assert_eq!(readback, pattern);

    // Leave the target the way we found it.
    assert_eq!(process.write_memory(address, &saved)?, 8);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn zero_length_reads_are_free() -> Result<()> {
    let debugger = Debugger::new()?;
    let process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    assert_eq!(process.read_memory(0, &mut [])?, 0);
    assert_eq!(process.write_memory(0, &[])?, 0);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn reads_from_a_dead_target_return_nothing() -> Result<()> {
    let debugger = Debugger::new()?;
    let process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    kill_and_reap(pid);

    // The target is gone; the caller finds out via a wait notification, not
    // an I/O error.
    let mut buf = [0u8; 16];
    assert_eq!(process.read_memory(0x1000, &mut buf)?, 0);

    Ok(())
}
