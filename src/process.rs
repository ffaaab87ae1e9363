//! A traced process: its thread and breakpoint registries, memory I/O, and
//! the debug-event pump that reconciles kernel notifications with them.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::os::unix::fs::FileExt;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::breakpoint::{
    Breakpoint, BreakpointKind, MAX_BREAKPOINT_SIZE, MIN_BREAKPOINT_SIZE,
};
use crate::context::RegisterId;
use crate::debugger::Debugger;
use crate::error::{Error, Result, ResultExt};
use crate::event::{Event, EventKind, EventStatus};
use crate::proc;
use crate::thread::{AttachMode, RunState, Thread};

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

/// Parks the calling thread for up to `timeout` awaiting a SIGCHLD.
///
/// Returns whether one arrived. The signal stays blocked so it can only be
/// consumed here, synchronously.
fn wait_for_sigchld(timeout: Duration) -> Result<bool> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);

    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).map_err(|source| Error::Os {
        op: "sigprocmask",
        source,
    })?;

    let ts = duration_to_timespec(timeout);
    let mut info = MaybeUninit::<libc::siginfo_t>::uninit();

    let res = unsafe { libc::sigtimedwait(mask.as_ref(), info.as_mut_ptr(), &ts) };
    if res == -1 {
        return match Errno::last() {
            Errno::EAGAIN | Errno::EINTR => Ok(false),
            source => Err(Error::Os {
                op: "sigtimedwait",
                source,
            }),
        };
    }

    Ok(res == libc::SIGCHLD)
}

fn is_clone_event(wstatus: i32) -> bool {
    wstatus >> 8 == libc::SIGTRAP | (libc::PTRACE_EVENT_CLONE << 8)
}

fn is_exit_trace_event(wstatus: i32) -> bool {
    wstatus >> 8 == libc::SIGTRAP | (libc::PTRACE_EVENT_EXIT << 8)
}

fn is_trap_event(wstatus: i32) -> bool {
    libc::WIFSTOPPED(wstatus) && libc::WSTOPSIG(wstatus) == libc::SIGTRAP
}

/// Memory access to a traced process.
///
/// Prefers positional I/O on `/proc/<pid>/mem`; falls back to the word-sized
/// `PTRACE_PEEKDATA`/`PTRACE_POKEDATA` requests when the file could not be
/// opened. A target that vanished mid-transfer reads or writes as zero bytes
/// rather than failing; the caller learns of the death from a later wait
/// notification.
pub struct Memory {
    pid: Pid,
    file: Option<std::fs::File>,
}

impl Memory {
    fn open(pid: Pid) -> Self {
        let path = format!("/proc/{pid}/mem");
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(%pid, %err, "could not open {path}, using ptrace transfers");
                None
            }
        };

        Self { pid, file }
    }

    /// Reads up to `buf.len()` bytes at the target virtual address `address`.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        match &self.file {
            Some(file) => match file.read_at(buf, address) {
                Ok(n) => Ok(n),
                Err(err) if err.raw_os_error() == Some(Errno::ESRCH as i32) => Ok(0),
                Err(err) => Err(err.into()),
            },
            None => self.read_ptrace(address, buf),
        }
    }

    /// Writes up to `buf.len()` bytes at the target virtual address `address`.
    pub fn write(&self, address: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        match &self.file {
            Some(file) => match file.write_at(buf, address) {
                Ok(n) => Ok(n),
                Err(err) if err.raw_os_error() == Some(Errno::ESRCH as i32) => Ok(0),
                Err(err) => Err(err.into()),
            },
            None => self.write_ptrace(address, buf),
        }
    }

    fn read_ptrace(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;

        while total < buf.len() {
            Errno::clear();
            let word = unsafe {
                libc::ptrace(
                    libc::PTRACE_PEEKDATA,
                    self.pid.as_raw(),
                    (address + total as u64) as libc::c_ulong,
                    0 as libc::c_ulong,
                )
            };
            if word == -1 && Errno::last_raw() != 0 {
                if Errno::last() == Errno::ESRCH {
                    return Ok(0);
                }
                break;
            }

            let bytes = word.to_ne_bytes();
            let count = bytes.len().min(buf.len() - total);
            buf[total..total + count].copy_from_slice(&bytes[..count]);
            total += count;
        }

        Ok(total)
    }

    fn write_ptrace(&self, address: u64, buf: &[u8]) -> Result<usize> {
        const WORD: usize = std::mem::size_of::<libc::c_long>();

        let mut total = 0;

        while total < buf.len() {
            let count = WORD.min(buf.len() - total);
            let mut data = [0u8; WORD];
            data[..count].copy_from_slice(&buf[total..total + count]);

            if count < WORD {
                // Partial tail: merge with the bytes already in the target.
                Errno::clear();
                let word = unsafe {
                    libc::ptrace(
                        libc::PTRACE_PEEKDATA,
                        self.pid.as_raw(),
                        (address + total as u64) as libc::c_ulong,
                        0 as libc::c_ulong,
                    )
                };
                if word == -1 && Errno::last_raw() != 0 {
                    if Errno::last() == Errno::ESRCH {
                        return Ok(0);
                    }
                    return Err(Error::Os {
                        op: "ptrace(PTRACE_PEEKDATA)",
                        source: Errno::last(),
                    });
                }
                data[count..].copy_from_slice(&word.to_ne_bytes()[count..]);
            }

            let word = libc::c_long::from_ne_bytes(data);
            let res = unsafe {
                libc::ptrace(
                    libc::PTRACE_POKEDATA,
                    self.pid.as_raw(),
                    (address + total as u64) as libc::c_ulong,
                    word,
                )
            };
            if let Err(errno) = Errno::result(res) {
                if errno == Errno::ESRCH {
                    return Ok(0);
                }
                return Err(Error::Os {
                    op: "ptrace(PTRACE_POKEDATA)",
                    source: errno,
                });
            }

            total += count;
        }

        Ok(total)
    }
}

/// A traced process: the thread map, the breakpoint registry, and the debug
/// event pump.
///
/// The lifetime ties a process to the [`Debugger`] that produced it; the pump
/// relies on the SIGCHLD discipline the debugger maintains.
pub struct Process<'dbg> {
    pid: Pid,
    mem: Memory,
    threads: BTreeMap<Pid, Thread>,
    breakpoints: BTreeMap<u64, Breakpoint>,
    /// The thread that reported the most recent interesting stop; the default
    /// target of `step` and `stop`. Always a key of `threads` when set.
    active: Option<Pid>,
    /// Wait statuses dequeued for tids not (yet) in the thread map. A clone
    /// child's initial stop can arrive before the parent's clone event; it
    /// must be kept, because the kernel never re-reports a consumed stop.
    pending_stops: BTreeMap<Pid, i32>,
    _debugger: PhantomData<&'dbg Debugger>,
}

impl<'dbg> Process<'dbg> {
    pub(crate) fn new(pid: Pid, mode: AttachMode) -> Result<Self> {
        let mut threads = BTreeMap::new();
        let mut active = None;

        match mode {
            AttachMode::Attach => {
                // New threads can spawn while we walk the task list; keep
                // rescanning until a pass attaches nothing.
                loop {
                    let mut inserted = false;

                    for tid in proc::enumerate_threads(pid)? {
                        if threads.contains_key(&tid) {
                            continue;
                        }

                        let thread = match Thread::new(pid, tid, AttachMode::Attach, true) {
                            Ok(thread) => thread,
                            Err(Error::Attach {
                                source: nix::Error::ESRCH,
                                ..
                            }) => {
                                // The task exited between enumeration and
                                // attach.
                                continue;
                            }
                            Err(err) => return Err(err),
                        };

                        info!(%pid, %tid, "attached to thread");
                        threads.insert(tid, thread);

                        if active.is_none() {
                            active = Some(tid);
                        }

                        inserted = true;
                    }

                    if !inserted {
                        break;
                    }
                }
            }
            AttachMode::NoAttach => {
                // The initial trace-me stop already happened; just adopt the
                // leader.
                threads.insert(pid, Thread::new(pid, pid, AttachMode::NoAttach, true)?);
            }
        }

        let mem = Memory::open(pid);

        Ok(Self {
            pid,
            mem,
            threads,
            breakpoints: BTreeMap::new(),
            active,
            pending_stops: BTreeMap::new(),
            _debugger: PhantomData,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The thread map, keyed by tid.
    pub fn threads(&self) -> &BTreeMap<Pid, Thread> {
        &self.threads
    }

    pub fn find_thread(&self, tid: Pid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn active_thread(&self) -> Option<&Thread> {
        self.active.and_then(|tid| self.threads.get(&tid))
    }

    /// Memory access that bypasses breakpoint masking. Prefer
    /// [`read_memory`](Self::read_memory), which does not.
    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    /// Reads target memory, with the bytes of any enabled breakpoint replaced
    /// by the original instruction bytes. Disassembly built on top of this
    /// never sees a planted trap.
    pub fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.mem.read(address, buf)?;
        if n > 0 {
            self.filter_breakpoints(address, &mut buf[..n]);
        }
        Ok(n)
    }

    /// Writes target memory.
    pub fn write_memory(&self, address: u64, buf: &[u8]) -> Result<usize> {
        self.mem.write(address, buf)
    }

    /// Overwrites any breakpoint bytes inside `buf` with the shadowed
    /// original bytes.
    fn filter_breakpoints(&self, address: u64, buf: &mut [u8]) {
        for (&bp_address, bp) in &self.breakpoints {
            if !bp.is_enabled() {
                continue;
            }

            if bp_address >= address && bp_address < address + buf.len() as u64 {
                let offset = (bp_address - address) as usize;
                for (i, byte) in bp.old_bytes().iter().enumerate() {
                    if offset + i < buf.len() {
                        buf[offset + i] = *byte;
                    }
                }
            }
        }
    }

    /// Resumes every stopped thread.
    pub fn resume(&mut self) -> Result<()> {
        for thread in self.threads.values_mut() {
            if thread.state() == RunState::Stopped {
                thread.resume()?;
            }
        }

        Ok(())
    }

    /// Single-steps the active thread, and only that thread. With no active
    /// thread, any stopped thread is elected first.
    pub fn step(&mut self) -> Result<()> {
        if self.active.is_none() {
            self.active = self
                .threads
                .iter()
                .find(|(_, thread)| thread.state() == RunState::Stopped)
                .map(|(tid, _)| *tid);
        }

        let tid = self.active.expect("step() requires a stopped thread");
        self.threads
            .get_mut(&tid)
            .expect("active thread is tracked")
            .step()
    }

    /// Stops the active thread, or any running thread when none is active.
    /// Stopping one thread is enough to stop the process: the event pump
    /// observes the stop and, in all-stop mode, halts the rest.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(tid) = self.active {
            return self
                .threads
                .get(&tid)
                .expect("active thread is tracked")
                .stop();
        }

        if let Some(thread) = self
            .threads
            .values()
            .find(|thread| thread.state() == RunState::Running)
        {
            return thread.stop();
        }

        Ok(())
    }

    /// Terminates the traced process.
    pub fn kill(&self) -> Result<()> {
        ptrace::kill(self.pid).died_if_esrch(self.pid, "ptrace(PTRACE_KILL)")
    }

    /// Restores every breakpoint's original bytes, then detaches from every
    /// thread. Failures are logged; the teardown continues regardless.
    pub fn detach(&mut self) {
        let addresses: Vec<u64> = self.breakpoints.keys().copied().collect();
        for address in addresses {
            if let Err(err) = self.remove_breakpoint(address) {
                warn!(address = format_args!("{address:#x}"), %err, "could not restore breakpoint bytes");
            }
        }

        self.threads.clear();
        self.pending_stops.clear();
        self.active = None;
    }

    /// Installs an enabled breakpoint of the default kind at `address`.
    pub fn add_breakpoint(&mut self, address: u64) -> Result<()> {
        self.add_breakpoint_with_kind(address, BreakpointKind::Automatic)
    }

    /// Installs an enabled breakpoint of the given kind at `address`.
    ///
    /// On failure the registry is left unchanged. The original bytes are read
    /// through the masked path, so overlapping breakpoints never shadow one
    /// another's replacement bytes.
    pub fn add_breakpoint_with_kind(&mut self, address: u64, kind: BreakpointKind) -> Result<()> {
        let mut bp = Breakpoint::new(address, kind);
        let size = bp.size();

        let mut original = [0u8; MAX_BREAKPOINT_SIZE];
        let read = self.read_memory(address, &mut original[..size])?;
        if read != size {
            return Err(Error::ShortTransfer {
                address,
                requested: size,
                transferred: read,
            });
        }

        let written = self.mem.write(address, bp.new_bytes())?;
        if written != size {
            return Err(Error::ShortTransfer {
                address,
                requested: size,
                transferred: written,
            });
        }

        bp.old_bytes = original;
        bp.enabled = true;
        self.breakpoints.insert(address, bp);

        debug!(address = format_args!("{address:#x}"), ?kind, "breakpoint installed");

        Ok(())
    }

    /// Removes the breakpoint at `address`, restoring the original bytes.
    pub fn remove_breakpoint(&mut self, address: u64) -> Result<()> {
        let Some(bp) = self.breakpoints.remove(&address) else {
            return Err(Error::Internal(format!(
                "no breakpoint at {address:#x}"
            )));
        };

        if bp.is_enabled() {
            let written = self.mem.write(address, bp.old_bytes())?;
            if written != bp.size() {
                return Err(Error::ShortTransfer {
                    address,
                    requested: bp.size(),
                    transferred: written,
                });
            }
        }

        Ok(())
    }

    /// Re-arms a disabled breakpoint. No-op when already enabled.
    pub fn enable_breakpoint(&mut self, address: u64) -> Result<()> {
        let (size, replacement) = match self.breakpoints.get(&address) {
            None => {
                return Err(Error::Internal(format!("no breakpoint at {address:#x}")));
            }
            Some(bp) if bp.is_enabled() => return Ok(()),
            Some(bp) => {
                let mut replacement = [0u8; MAX_BREAKPOINT_SIZE];
                replacement[..bp.size()].copy_from_slice(bp.new_bytes());
                (bp.size(), replacement)
            }
        };

        let mut original = [0u8; MAX_BREAKPOINT_SIZE];
        let read = self.read_memory(address, &mut original[..size])?;
        if read != size {
            return Err(Error::ShortTransfer {
                address,
                requested: size,
                transferred: read,
            });
        }

        let written = self.mem.write(address, &replacement[..size])?;
        if written != size {
            return Err(Error::ShortTransfer {
                address,
                requested: size,
                transferred: written,
            });
        }

        let bp = self.breakpoints.get_mut(&address).expect("probed above");
        bp.old_bytes = original;
        bp.enabled = true;

        Ok(())
    }

    /// Restores the original bytes of an enabled breakpoint while keeping it
    /// registered. No-op when already disabled.
    pub fn disable_breakpoint(&mut self, address: u64) -> Result<()> {
        let (size, original) = match self.breakpoints.get(&address) {
            None => {
                return Err(Error::Internal(format!("no breakpoint at {address:#x}")));
            }
            Some(bp) if !bp.is_enabled() => return Ok(()),
            Some(bp) => {
                let mut original = [0u8; MAX_BREAKPOINT_SIZE];
                original[..bp.size()].copy_from_slice(bp.old_bytes());
                (bp.size(), original)
            }
        };

        let written = self.mem.write(address, &original[..size])?;
        if written != size {
            return Err(Error::ShortTransfer {
                address,
                requested: size,
                transferred: written,
            });
        }

        self.breakpoints.get_mut(&address).expect("probed above").enabled = false;

        Ok(())
    }

    /// The breakpoint starting exactly at `address`, if any.
    pub fn find_breakpoint(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    /// The breakpoint whose trap instruction *ends* at `address`.
    ///
    /// Executing a planted trap advances the instruction pointer past the
    /// replacement bytes, so a stop at `ip` belongs to a breakpoint whose
    /// size equals the rewind distance back to its start.
    pub fn search_breakpoint(&self, address: u64) -> Option<&Breakpoint> {
        for distance in MIN_BREAKPOINT_SIZE..=MAX_BREAKPOINT_SIZE {
            if let Some(bp) = self.find_breakpoint(address.wrapping_sub(distance as u64)) {
                if bp.size() == distance {
                    return Some(bp);
                }
            }
        }

        None
    }

    /// Waits up to `timeout` for debug events, then drains and dispatches
    /// every pending notification, invoking `callback` per delivered event.
    ///
    /// Returns `false` when the wait timed out with nothing to process. A
    /// single call can deliver multiple events.
    pub fn next_debug_event<F>(&mut self, timeout: Duration, mut callback: F) -> Result<bool>
    where
        F: FnMut(&Event) -> EventStatus,
    {
        let signalled = wait_for_sigchld(timeout)?;

        // Drain even after a timeout: in a tracer with other threads, the
        // SIGCHLD can be consumed elsewhere while notifications queue up.
        let processed = self.drain_wait_statuses(&mut callback)?;

        Ok(signalled || processed > 0)
    }

    fn drain_wait_statuses<F>(&mut self, callback: &mut F) -> Result<usize>
    where
        F: FnMut(&Event) -> EventStatus,
    {
        let mut first_stop = true;
        let mut processed = 0usize;

        loop {
            let mut wstatus = 0;
            // __WNOTHREAD keeps the drain from consuming notifications that
            // belong to tracees of the process's other threads.
            let res = unsafe {
                libc::waitpid(
                    -1,
                    &mut wstatus,
                    libc::__WALL | libc::WNOHANG | libc::__WNOTHREAD,
                )
            };

            let tid = match Errno::result(res) {
                Ok(0) => break,
                Ok(raw) => Pid::from_raw(raw),
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(Error::Os {
                        op: "waitpid",
                        source,
                    })
                }
            };

            processed += 1;
            trace!(%tid, wstatus, "wait notification");

            if !self.threads.contains_key(&tid) {
                // Either a racing descendant we will never track, or a clone
                // child whose announcement has not been processed yet.
                debug!(%tid, wstatus, "event for untraced thread, buffering");
                self.pending_stops.insert(tid, wstatus);
                continue;
            }

            self.threads
                .get_mut(&tid)
                .expect("tracked thread")
                .mark_stopped(wstatus);

            if libc::WIFEXITED(wstatus) {
                info!(%tid, code = libc::WEXITSTATUS(wstatus), "thread exited");
                self.threads.remove(&tid);

                // If the active thread just exited, elect any survivor.
                if self.active == Some(tid) {
                    self.active = self.threads.keys().next().copied();
                }

                // The thread is gone; the verdict cannot redirect it.
                let event = Event {
                    siginfo: None,
                    pid: self.pid,
                    tid,
                    status: wstatus,
                    kind: EventKind::Exited,
                };
                let _ = callback(&event);
                continue;
            }

            if libc::WIFCONTINUED(wstatus) {
                continue;
            }

            if libc::WIFSIGNALED(wstatus) {
                if first_stop {
                    self.active = Some(tid);
                    first_stop = false;
                }

                let event = Event {
                    siginfo: None,
                    pid: self.pid,
                    tid,
                    status: wstatus,
                    kind: EventKind::Terminated,
                };
                let _ = callback(&event);
                continue;
            }

            if libc::WIFSTOPPED(wstatus) {
                if first_stop {
                    self.active = Some(tid);
                    first_stop = false;
                }

                let mut event = Event {
                    siginfo: None,
                    pid: self.pid,
                    tid,
                    status: wstatus,
                    kind: EventKind::Stopped,
                };

                if is_trap_event(wstatus) {
                    match ptrace::getsiginfo(tid) {
                        Ok(info) => event.siginfo = Some(info),
                        Err(errno) => debug!(%tid, %errno, "PTRACE_GETSIGINFO failed"),
                    }

                    if is_exit_trace_event(wstatus) {
                        // The thread is about to exit; the exit status itself
                        // arrives as a separate notification. Until then this
                        // is a normal trap.
                    } else if is_clone_event(wstatus) {
                        self.track_clone_child(tid);
                    } else {
                        // Single-step completion, a stop request, or a
                        // breakpoint.
                        self.reconcile_breakpoint(tid);
                    }
                } else {
                    // A stop that did not advance the instruction pointer can
                    // still sit on a breakpoint (e.g. hlt/cli kinds); no
                    // rewind needed then.
                    match self.threads.get(&tid).expect("tracked thread").get_instruction_pointer()
                    {
                        Ok(ip) => {
                            if let Some(bp) = self.breakpoints.get_mut(&ip) {
                                debug!(%tid, address = format_args!("{ip:#x}"), "breakpoint hit without trap");
                                bp.hit();
                            }
                        }
                        Err(err) => debug!(%tid, %err, "could not read instruction pointer"),
                    }
                }

                let verdict = callback(&event);
                self.apply_event_status(tid, verdict);
                continue;
            }

            // Not a state the wait protocol defines; hand it to the caller
            // as-is and keep draining.
            warn!(%tid, wstatus, "unrecognized wait status");
            let event = Event {
                siginfo: None,
                pid: self.pid,
                tid,
                status: wstatus,
                kind: EventKind::Unknown,
            };
            let _ = callback(&event);
        }

        Ok(processed)
    }

    /// Adopts the thread announced by a clone event and sets it running.
    /// Attach is unnecessary: the new task inherits tracing from its parent.
    fn track_clone_child(&mut self, tid: Pid) {
        let message = match ptrace::getevent(tid) {
            Ok(message) => message,
            Err(errno) => {
                debug!(%tid, %errno, "PTRACE_GETEVENTMSG failed");
                return;
            }
        };

        let new_tid = Pid::from_raw(message as libc::pid_t);
        info!(%tid, %new_tid, "tracking clone child");

        // The child's initial stop may have been dequeued before the parent's
        // clone event; adopt from the buffered status then, since a blocking
        // wait would never see that stop again.
        let adopted = match self.pending_stops.remove(&new_tid) {
            Some(wstatus) if libc::WIFEXITED(wstatus) || libc::WIFSIGNALED(wstatus) => {
                debug!(%new_tid, wstatus, "clone child died before adoption");
                return;
            }
            Some(wstatus) => Thread::from_observed_stop(self.pid, new_tid, wstatus, true),
            None => Thread::new(self.pid, new_tid, AttachMode::NoAttach, true),
        };

        match adopted {
            Ok(mut thread) => {
                thread.mark_stopped(0);
                if let Err(err) = thread.resume() {
                    debug!(%new_tid, %err, "could not resume clone child");
                }
                self.threads.insert(new_tid, thread);
            }
            Err(err) => debug!(%new_tid, %err, "could not adopt clone child"),
        }
    }

    /// On a generic trap, checks whether the stop location ends a planted
    /// breakpoint; if so rewinds the instruction pointer over the trap bytes
    /// and records the hit.
    fn reconcile_breakpoint(&mut self, tid: Pid) {
        let thread = self.threads.get(&tid).expect("tracked thread");

        let mut ctx = match thread.get_context() {
            Ok(ctx) => ctx,
            Err(err) => {
                debug!(%tid, %err, "could not fetch context");
                return;
            }
        };

        let ip = ctx.get(RegisterId::Xip).read::<u64>();
        trace!(%tid, ip = format_args!("{ip:#x}"), "trap stop");

        let Some((address, size)) = self
            .search_breakpoint(ip)
            .map(|bp| (bp.address(), bp.size()))
        else {
            return;
        };

        debug!(%tid, address = format_args!("{address:#x}"), "breakpoint hit");

        let mut ip_ref = ctx.get(RegisterId::Xip);
        ip_ref -= size as u64;

        if let Err(err) = self
            .threads
            .get(&tid)
            .expect("tracked thread")
            .set_context(&ctx)
        {
            debug!(%tid, %err, "could not rewind instruction pointer");
            return;
        }

        self.breakpoints
            .get_mut(&address)
            .expect("searched breakpoint is registered")
            .hit();
    }

    fn apply_event_status(&mut self, tid: Pid, verdict: EventStatus) {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return;
        };

        if thread.state() != RunState::Stopped {
            return;
        }

        let restarted = match verdict {
            EventStatus::Stop => return,
            EventStatus::ContinueStep => thread.step(),
            _ => thread.resume(),
        };

        if let Err(err) = restarted {
            debug!(%tid, %err, "could not restart thread after event");
        }
    }

    /// Prints the run state, decoded wait status, and full context of every
    /// thread. Purely diagnostic.
    pub fn report(&self) {
        for thread in self.threads.values() {
            match thread.state() {
                RunState::Running => println!("Thread: {} [RUNNING]", thread.tid()),
                RunState::Stopped => {
                    if thread.is_exited() {
                        println!("Thread: {} [EXITED] [{}]", thread.tid(), thread.exit_status());
                    }

                    if thread.is_signaled() {
                        println!(
                            "Thread: {} [SIGNALED] [{}]",
                            thread.tid(),
                            thread.signal_status()
                        );
                    }

                    if thread.is_stopped() {
                        println!(
                            "Thread: {} [STOPPED] [{}]",
                            thread.tid(),
                            thread.stop_status()
                        );
                    }

                    if thread.is_continued() {
                        println!("Thread: {} [CONTINUED]", thread.tid());
                    }

                    match thread.get_context() {
                        Ok(mut ctx) => ctx.dump(),
                        Err(err) => warn!(tid = %thread.tid(), %err, "could not fetch context"),
                    }
                }
            }
        }
    }
}

impl Drop for Process<'_> {
    fn drop(&mut self) {
        self.detach();
    }
}
