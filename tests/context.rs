use std::time::Duration;

use anyhow::Result;
use ntest::timeout;

use grapple::{Debugger, RegisterId};

mod support;
use support::*;

#[test]
#[timeout(30000)]
fn context_roundtrips_bitwise() -> Result<()> {
    let debugger = Debugger::new()?;
    let process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let thread = process.find_thread(pid).expect("leader thread is tracked");

    let ctx = thread.get_context()?;
    thread.set_context(&ctx)?;
    let reread = thread.get_context()?;

    assert!(ctx == reread, "context changed across a write-back");

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn register_edits_reach_the_target() -> Result<()> {
    let debugger = Debugger::new()?;
    let process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let thread = process.find_thread(pid).expect("leader thread is tracked");

    let mut ctx = thread.get_context()?;
    let rax = ctx.get(RegisterId::Rax).read::<u64>();
    ctx.get(RegisterId::Rax).write(rax ^ 1);
    thread.set_context(&ctx)?;

    let mut reread = thread.get_context()?;
    assert_eq!(reread.get(RegisterId::Rax).read::<u64>(), rax ^ 1);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn instruction_pointer_shortcuts_match_the_context() -> Result<()> {
    let debugger = Debugger::new()?;
    let process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let thread = process.find_thread(pid).expect("leader thread is tracked");

    let ip = thread.get_instruction_pointer()?;
    let mut ctx = thread.get_context()?;
    assert_eq!(ctx.get(RegisterId::Xip).read::<u64>(), ip);
    assert_eq!(ctx.get(RegisterId::Rip).read::<u64>(), ip);

    thread.set_instruction_pointer(ip)?;
    assert_eq!(thread.get_instruction_pointer()?, ip);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn extended_state_flags_form_a_prefix() -> Result<()> {
    let debugger = Debugger::new()?;
    let process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let thread = process.find_thread(pid).expect("leader thread is tracked");
    let ctx = thread.get_context()?;

    let simd = &ctx.extended_state().simd;
    assert!(simd.sse_filled);
    if simd.avx_filled {
        assert!(simd.sse_filled);
    }
    if simd.zmm_filled {
        assert!(simd.avx_filled);
    }

    // A fresh image still has the architectural MXCSR reset value.
    assert_eq!(simd.mxcsr, 0x1f80);

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn simd_registers_copy_within_a_context() -> Result<()> {
    let debugger = Debugger::new()?;
    let process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    let thread = process.find_thread(pid).expect("leader thread is tracked");
    let mut ctx = thread.get_context()?;

    ctx.get(RegisterId::Ymm7)
        .write(0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00_u128);
    assert!(ctx.copy_register(RegisterId::Ymm0, RegisterId::Ymm7));

    let ymm0 = ctx.get(RegisterId::Ymm0).bytes().to_vec();
    let ymm7 = ctx.get(RegisterId::Ymm7).bytes().to_vec();
    assert_eq!(ymm0, ymm7);

    // Mismatched widths refuse to copy.
    assert!(!ctx.copy_register(RegisterId::Xmm0, RegisterId::Ymm7));

    drop(process);
    kill_and_reap(pid);

    Ok(())
}

#[test]
#[timeout(30000)]
fn report_walks_every_thread() -> Result<()> {
    let debugger = Debugger::new()?;
    let mut process = debugger.spawn(&sleep_command("5"))?;
    let pid = process.pid();

    // Purely diagnostic; must not disturb the stop state.
    process.report();

    let thread = process.find_thread(pid).expect("leader thread is tracked");
    assert!(thread.is_stopped());

    process.resume()?;
    let _ = process.next_debug_event(Duration::from_millis(100), |_| {
        grapple::EventStatus::Continue
    })?;

    drop(process);
    kill_and_reap(pid);

    Ok(())
}
