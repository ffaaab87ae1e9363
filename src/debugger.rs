//! The tracer-wide entry point: SIGCHLD discipline and Process creation.

use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::unistd::{chdir, fork, ForkResult, Pid};
use tracing::{debug, info};

use crate::cmd::{Command, NullTerminatedPointerArray};
use crate::error::{Error, Result};
use crate::process::Process;
use crate::thread::AttachMode;

/// Size of the shared page a spawned child reports startup failures through.
const SPAWN_PAGE_SIZE: usize = 4096;

/// The process-wide debugger handle.
///
/// Construction blocks SIGCHLD and remembers the previous signal mask; the
/// event pump depends on consuming the signal synchronously via
/// `sigtimedwait` instead of an async handler. Dropping the debugger restores
/// the prior mask.
pub struct Debugger {
    prev_mask: SigSet,
    disable_aslr: bool,
    disable_lazy_binding: bool,
}

impl Debugger {
    pub fn new() -> Result<Self> {
        let mut chld = SigSet::empty();
        chld.add(Signal::SIGCHLD);

        let mut prev_mask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&chld), Some(&mut prev_mask)).map_err(
            |source| Error::Os {
                op: "sigprocmask",
                source,
            },
        )?;

        Ok(Self {
            prev_mask,
            disable_aslr: true,
            disable_lazy_binding: true,
        })
    }

    /// Controls address-space randomization for future spawns. Default: on
    /// (ASLR disabled).
    pub fn set_disable_aslr(&mut self, value: bool) {
        self.disable_aslr = value;
    }

    /// Controls lazy PLT binding for future spawns. Default: on (lazy
    /// binding disabled, `LD_BIND_NOW=1`).
    pub fn set_disable_lazy_binding(&mut self, value: bool) {
        self.disable_lazy_binding = value;
    }

    /// Attaches to the running process `pid` and every thread it has.
    pub fn attach(&self, pid: Pid) -> Result<Process<'_>> {
        Process::new(pid, AttachMode::Attach)
    }

    /// Forks and execs `cmd` under tracing, returning the process stopped at
    /// its exec trap.
    ///
    /// The child applies the spawn configuration (ASLR and lazy-binding
    /// suppression), requests trace-me, optionally changes directory, and
    /// execs. A failure before exec is reported through a shared page and
    /// surfaces here as a structured error.
    pub fn spawn(&self, cmd: &Command) -> Result<Process<'_>> {
        let mut env = cmd.env_snapshot();
        if self.disable_lazy_binding {
            env.set("LD_BIND_NOW", "1")
                .expect("static key and value are NUL-free");
        }

        let page = SharedPage::new()?;

        // Everything the child needs must be marshalled before the fork; the
        // child must not allocate.
        let argv = NullTerminatedPointerArray::new(cmd.argv());
        let env_vec = env.as_vec();
        let envp = NullTerminatedPointerArray::new(&env_vec);

        let fork_result = unsafe { fork() }.map_err(|source| Error::Os {
            op: "fork",
            source,
        })?;

        match fork_result {
            ForkResult::Child => self.exec_child(cmd, &argv, &envp, &page),
            ForkResult::Parent { child } => self.supervise_spawn(child, &page),
        }
    }

    /// Child side of [`spawn`](Self::spawn). Never returns: it either execs
    /// or aborts with a message in the shared page.
    fn exec_child(
        &self,
        cmd: &Command,
        argv: &NullTerminatedPointerArray<'_>,
        envp: &NullTerminatedPointerArray<'_>,
        page: &SharedPage,
    ) -> ! {
        if self.disable_aslr {
            let disabled = personality::get()
                .and_then(|persona| personality::set(persona | Persona::ADDR_NO_RANDOMIZE));
            if let Err(errno) = disabled {
                page.fail("failed to disable ASLR", errno);
            }
        }

        if let Err(errno) = ptrace::traceme() {
            page.fail("failed to enable tracing", errno);
        }

        if let Some(cwd) = cmd.cwd() {
            if let Err(errno) = chdir(cwd.as_c_str()) {
                page.fail("failed to change working directory", errno);
            }
        }

        unsafe {
            libc::execve(argv[0], argv.as_ptr(), envp.as_ptr());
        }

        // Only reachable when the exec itself failed.
        page.fail("failed to exec", Errno::last());
    }

    /// Parent side of [`spawn`](Self::spawn): adopt the child and verify it
    /// reached its exec trap.
    fn supervise_spawn(&self, child: Pid, page: &SharedPage) -> Result<Process<'_>> {
        info!(%child, "debugging new process");

        let process = Process::new(child, AttachMode::NoAttach)?;

        {
            let thread = process.find_thread(child).ok_or_else(|| {
                Error::Internal(format!("no leader thread for spawned process {child}"))
            })?;

            if thread.is_exited() {
                return Err(Error::ChildExited {
                    pid: child,
                    code: thread.exit_status(),
                });
            }

            if thread.is_signaled() {
                return Err(Error::ChildSignaled {
                    pid: child,
                    signal: thread.signal_status(),
                });
            }

            if thread.is_stopped() && thread.stop_status() == libc::SIGABRT {
                return Err(Error::ChildAborted {
                    pid: child,
                    message: page.message(),
                });
            }

            if !thread.is_stopped() || thread.stop_status() != libc::SIGTRAP {
                return Err(Error::ChildNotTrapped {
                    pid: child,
                    signal: thread.stop_status(),
                });
            }
        }

        Ok(process)
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        if let Err(errno) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.prev_mask), None) {
            debug!(%errno, "could not restore signal mask");
        }
    }
}

/// Anonymous shared page relaying a startup failure message from the forked
/// child to the parent. Unmapped on every parent-side exit path.
struct SharedPage {
    ptr: NonNull<libc::c_void>,
}

impl SharedPage {
    fn new() -> Result<Self> {
        let length = NonZeroUsize::new(SPAWN_PAGE_SIZE).expect("nonzero page size");

        // The kernel hands the mapping back zero-filled.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|source| Error::Os {
            op: "mmap",
            source,
        })?;

        Ok(Self { ptr })
    }

    /// The message the child left behind, if any.
    fn message(&self) -> String {
        // SAFETY: the mapping is SPAWN_PAGE_SIZE bytes and lives until drop.
        let bytes: &[u8] =
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast(), SPAWN_PAGE_SIZE) };

        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }

    /// Child-side: record `what` plus the OS error and abort. Formats into
    /// the fixed page, so no allocation happens post-fork.
    fn fail(&self, what: &str, errno: Errno) -> ! {
        // SAFETY: in the child the page has a single user; the parent only
        // reads it after the child stopped or died.
        let buf: &mut [u8] = unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), SPAWN_PAGE_SIZE)
        };

        let mut writer = PageWriter { buf, pos: 0 };
        let _ = write!(writer, "{what}: {errno}");

        std::process::abort();
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        // SAFETY: `ptr` is an owned mapping of SPAWN_PAGE_SIZE bytes.
        if let Err(errno) = unsafe { munmap(self.ptr, SPAWN_PAGE_SIZE) } {
            debug!(%errno, "could not unmap spawn page");
        }
    }
}

/// `fmt::Write` over a fixed byte buffer, always leaving a trailing NUL.
struct PageWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl std::fmt::Write for PageWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let available = self.buf.len().saturating_sub(self.pos + 1);
        let n = available.min(s.len());

        self.buf[self.pos..self.pos + n].copy_from_slice(&s.as_bytes()[..n]);
        self.pos += n;

        Ok(())
    }
}
