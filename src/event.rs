//! Debug events delivered by the event pump, and the callback's verdict.

use nix::unistd::Pid;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

/// What a wait-status notification amounted to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// The task exited normally.
    Exited,
    /// The task was terminated by a signal.
    Terminated,
    /// The task stopped (trap, signal delivery, or breakpoint).
    Stopped,
    /// A wait status outside the recognized protocol.
    Unknown,
}

/// One debug event, derived from a single wait-status notification.
#[derive(Clone, Copy)]
pub struct Event {
    /// Signal details from `PTRACE_GETSIGINFO`, when the query succeeded.
    pub siginfo: Option<Siginfo>,
    /// The traced process this event belongs to.
    pub pid: Pid,
    /// The task that produced the notification.
    pub tid: Pid,
    /// The raw wait-status word.
    pub status: i32,
    pub kind: EventKind,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("status", &self.status)
            .field("kind", &self.kind)
            .field("signo", &self.siginfo.map(|si| si.si_signo))
            .finish()
    }
}

/// The callback's direction to the event pump.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventStatus {
    /// Leave the thread stopped; the caller will instigate the next event.
    Stop,
    /// The event has been addressed; continue as normal.
    Continue,
    /// The event has been addressed; single-step the thread.
    ContinueStep,
    /// The event was a breakpoint that should be ignored.
    ContinueBreakpoint,
    /// Pass the event back to the thread unmodified and continue.
    ExceptionNotHandled,
    /// Pass the event to the next handler.
    NextHandler,
}
