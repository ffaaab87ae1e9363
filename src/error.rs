use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;

pub type Result<T> = std::result::Result<T, Error>;

/// Return an [`Error::Internal`] from the enclosing function.
///
/// Reserved for protocol states the kernel should never produce; hitting one
/// means our bookkeeping and the tracee have disagreed.
macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not attach to tracee = {pid}")]
    Attach { pid: Pid, source: nix::Error },

    /// The tracee vanished (ESRCH) mid-request.
    #[error("tracee = {pid} died")]
    TraceeDied { pid: Pid, source: nix::Error },

    /// A platform call failed; `op` names the syscall or ptrace request.
    #[error("{op} failed")]
    Os { op: &'static str, source: nix::Error },

    /// A memory transfer moved fewer bytes than the operation requires.
    #[error("short transfer at {address:#x}: {transferred} of {requested} bytes")]
    ShortTransfer {
        address: u64,
        requested: usize,
        transferred: usize,
    },

    #[error("child {pid} unexpectedly exited with code {code}")]
    ChildExited { pid: Pid, code: i32 },

    #[error("child {pid} was unexpectedly killed by signal {signal}")]
    ChildSignaled { pid: Pid, signal: i32 },

    #[error("child {pid} aborted before exec: {message}")]
    ChildAborted { pid: Pid, message: String },

    #[error("child {pid} was not stopped by SIGTRAP, but by signal {signal}")]
    ChildNotTrapped { pid: Pid, signal: i32 },

    #[error("input/output error")]
    InputOutput(#[from] io::Error),

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` when the underlying cause is the tracee disappearing.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

impl From<nix::Error> for Error {
    fn from(source: nix::Error) -> Self {
        Error::Os {
            op: "syscall",
            source,
        }
    }
}

/// Maps ESRCH results onto [`Error::TraceeDied`] so callers can distinguish a
/// vanished tracee from a genuine request failure.
pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, pid: Pid, op: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self, pid: Pid, op: &'static str) -> Result<T> {
        self.map_err(|source| match source {
            Errno::ESRCH => Error::TraceeDied { pid, source },
            _ => Error::Os { op, source },
        })
    }
}
