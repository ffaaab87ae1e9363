//! A Linux x86/x86-64 process debugger engine built on `ptrace(2)`.
//!
//! Grapple attaches to (or spawns) a target process, tracks every thread of
//! that process as it is created and destroyed, mediates execution, reads and
//! writes the target's memory and CPU state, installs software breakpoints,
//! and surfaces debug events to a caller-supplied callback.
//!
//! The tracer blocks SIGCHLD for the lifetime of a [`Debugger`] and parks in
//! `sigtimedwait` until a tracee changes state, then drains every pending
//! `wait(2)` notification in one pass. Memory reads are masked against the
//! breakpoint registry, so callers always observe the target's true
//! instruction bytes even while traps are planted. A [`Context`] captures the
//! full architectural state of a stopped thread, including the x87/SSE/AVX/
//! AVX-512 extended state in a normalized layout that works the same whether
//! the target is 32- or 64-bit.

#[macro_use]
pub mod error;

pub mod breakpoint;
pub mod cmd;
pub mod context;
pub mod debugger;
pub mod event;
pub mod proc;
pub mod process;
pub mod thread;
pub mod x86;

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use breakpoint::{Breakpoint, BreakpointKind, MAX_BREAKPOINT_SIZE, MIN_BREAKPOINT_SIZE};

#[doc(inline)]
pub use cmd::{Command, OsEnv};

#[doc(inline)]
pub use context::{Context, RegisterId, RegisterRef};

#[doc(inline)]
pub use debugger::Debugger;

#[doc(inline)]
pub use event::{Event, EventKind, EventStatus, Siginfo};

#[doc(inline)]
pub use process::{Memory, Process};

#[doc(inline)]
pub use thread::{RunState, Thread};
