use std::time::Duration;

use anyhow::Result;
use ntest::timeout;

use grapple::proc::{enumerate_processes, enumerate_regions, enumerate_threads, hash_regions};
use grapple::{Debugger, Pid};

mod support;
use support::*;

#[test]
fn thread_enumeration_sees_the_calling_process() -> Result<()> {
    let pid = nix::unistd::getpid();

    let threads = enumerate_threads(pid)?;
    assert!(threads.contains(&pid), "leader tid missing from {threads:?}");

    Ok(())
}

#[test]
fn process_enumeration_sees_the_calling_process() -> Result<()> {
    let pid = nix::unistd::getpid();

    let processes = enumerate_processes()?;
    assert!(processes.contains(&pid));

    Ok(())
}

#[test]
fn region_enumeration_parses_own_maps() {
    let pid = nix::unistd::getpid();

    let regions = enumerate_regions(pid);
    assert!(!regions.is_empty());

    // The text mapping of this very test binary must be present.
    assert!(regions.iter().any(|r| r.is_readable() && r.is_executable()));
    assert!(regions.iter().any(|r| r.is_stack()));

    for region in &regions {
        assert!(region.start() < region.end());
    }
}

#[test]
fn region_hash_is_stable_while_the_map_is() {
    let pid = nix::unistd::getpid();

    // Warm up the allocator so hashing itself does not grow the map.
    let _ = hash_regions(pid);

    let first = hash_regions(pid);
    let second = hash_regions(pid);
    assert_eq!(first, second);
    assert_ne!(first, 0);
}

#[test]
fn region_hash_of_a_missing_process_is_zero() {
    // Nothing plausible lives at this pid.
    assert_eq!(hash_regions(Pid::from_raw(i32::MAX - 1)), 0);
}

#[test]
#[timeout(30000)]
fn aslr_suppression_makes_spawns_reproducible() -> Result<()> {
    let debugger = Debugger::new()?;

    let spawn_and_hash = |debugger: &Debugger| -> Result<u64> {
        let process = debugger.spawn(&sleep_command("5"))?;
        let pid = process.pid();
        let hash = hash_regions(pid);
        drop(process);
        kill_and_reap(pid);
        Ok(hash)
    };

    let first = spawn_and_hash(&debugger)?;
    let second = spawn_and_hash(&debugger)?;

    assert_ne!(first, 0);
    assert_eq!(first, second);

    Ok(())
}

#[test]
#[timeout(30000)]
fn sleeping_child_keeps_a_stable_map() -> Result<()> {
    use std::process::Command as StdCommand;

    let mut child = StdCommand::new("sleep").arg("2").spawn()?;
    let pid = Pid::from_raw(child.id() as i32);

    // Let the exec settle before fingerprinting.
    std::thread::sleep(Duration::from_millis(300));

    let first = hash_regions(pid);
    let second = hash_regions(pid);
    assert_eq!(first, second);

    child.kill()?;
    child.wait()?;

    Ok(())
}
