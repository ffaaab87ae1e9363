//! One traced task and the ptrace requests that drive it.

use std::marker::PhantomData;
use std::mem::MaybeUninit;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, trace};

use crate::context::{Context, GpState};
use crate::error::{Error, Result, ResultExt};
use crate::x86::{self, Regs64, XSaveArea, NT_PRSTATUS, NT_X86_XSTATE, XSAVE_BUFFER_SIZE};

#[cfg(target_arch = "x86")]
use crate::context::RegisterId;
#[cfg(target_arch = "x86")]
use crate::x86::Regs32;

/// Whether a thread may currently accept ptrace requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    Running,
    Stopped,
}

/// How a [`Thread`] takes ownership of a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AttachMode {
    /// Issue `PTRACE_ATTACH` and await the attach-stop.
    Attach,
    /// The task is already a tracee (trace-me child or fresh clone); only
    /// await its pending stop.
    NoAttach,
}

/// One traced task.
///
/// The wait-status accessors and the context operations require the thread to
/// be `Stopped`; `stop` and `kill` require `Running`. Violations are
/// programming errors and abort.
pub struct Thread {
    pid: Pid,
    tid: Pid,
    wstatus: i32,
    state: RunState,
    is_64_bit: bool,
    attached: bool,

    // A ptrace attachment belongs to the tracer thread that created it;
    // requests from any other thread fail with ESRCH.
    _not_send: PhantomData<*const ()>,
}

impl Thread {
    pub(crate) fn new(
        pid: Pid,
        tid: Pid,
        mode: AttachMode,
        kill_on_tracer_exit: bool,
    ) -> Result<Self> {
        if mode == AttachMode::Attach {
            ptrace::attach(tid).map_err(|source| Error::Attach { pid: tid, source })?;
        }

        let mut thread = Self::bare(pid, tid);

        thread.wait()?;
        thread.finish_adoption(kill_on_tracer_exit)?;

        Ok(thread)
    }

    /// Adopts a task whose initial stop was already consumed by the event
    /// pump. The kernel does not re-report a dequeued stop, so waiting here
    /// would block forever.
    pub(crate) fn from_observed_stop(
        pid: Pid,
        tid: Pid,
        wstatus: i32,
        kill_on_tracer_exit: bool,
    ) -> Result<Self> {
        let mut thread = Self::bare(pid, tid);

        thread.mark_stopped(wstatus);
        thread.finish_adoption(kill_on_tracer_exit)?;

        Ok(thread)
    }

    fn bare(pid: Pid, tid: Pid) -> Self {
        Self {
            pid,
            tid,
            wstatus: 0,
            state: RunState::Running,
            is_64_bit: cfg!(target_arch = "x86_64"),
            attached: true,
            _not_send: PhantomData,
        }
    }

    fn finish_adoption(&mut self, kill_on_tracer_exit: bool) -> Result<()> {
        let mut options =
            Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEEXIT;
        if kill_on_tracer_exit {
            options |= Options::PTRACE_O_EXITKILL;
        }

        // A child that died before its first real stop (e.g. aborted pre-exec)
        // cannot take options; the caller inspects the wait status and reports.
        if let Err(errno) = ptrace::setoptions(self.tid, options) {
            debug!(tid = %self.tid, %errno, "PTRACE_SETOPTIONS failed");
        }

        if libc::WIFSTOPPED(self.wstatus) {
            self.is_64_bit = self.detect_64_bit()?;
        }

        Ok(())
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_64_bit(&self) -> bool {
        self.is_64_bit
    }

    /// The raw wait-status word from the most recent stop.
    pub fn wait_status(&self) -> i32 {
        assert_eq!(self.state, RunState::Stopped, "wait_status() on a running thread");
        self.wstatus
    }

    pub(crate) fn mark_stopped(&mut self, wstatus: i32) {
        self.wstatus = wstatus;
        self.state = RunState::Stopped;
    }

    /// Distinguishes a 32-bit from a 64-bit task by the length of the
    /// general-purpose regset the kernel reports back.
    fn detect_64_bit(&self) -> Result<bool> {
        assert_eq!(self.state, RunState::Stopped);

        let mut regs = MaybeUninit::<Regs64>::uninit();
        let mut iov = libc::iovec {
            iov_base: regs.as_mut_ptr().cast(),
            iov_len: std::mem::size_of::<Regs64>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.tid.as_raw(),
                NT_PRSTATUS,
                &mut iov,
            )
        };
        Errno::result(res).died_if_esrch(self.tid, "ptrace(PTRACE_GETREGSET)")?;

        match iov.iov_len {
            68 => Ok(false),
            216 => Ok(true),
            len => internal_error!(format!("unknown register set length: {len}")),
        }
    }

    /// Blocks until this task delivers a wait-status change.
    pub fn wait(&mut self) -> Result<()> {
        assert_eq!(self.state, RunState::Running, "wait() on a stopped thread");

        let mut wstatus = 0;
        loop {
            let res = unsafe {
                libc::waitpid(
                    self.tid.as_raw(),
                    &mut wstatus,
                    libc::__WALL | libc::__WNOTHREAD,
                )
            };
            match Errno::result(res) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno).died_if_esrch(self.tid, "waitpid"),
            }
        }

        self.mark_stopped(wstatus);

        Ok(())
    }

    /// Detaches from the task. No-op when already detached.
    pub fn detach(&mut self) {
        if self.attached {
            if let Err(errno) = ptrace::detach(self.tid, None) {
                trace!(tid = %self.tid, %errno, "PTRACE_DETACH failed");
            }
            self.attached = false;
        }
    }

    /// Single-steps the task. A debug event follows when it stops again.
    pub fn step(&mut self) -> Result<()> {
        assert_eq!(self.state, RunState::Stopped, "step() on a running thread");

        ptrace::step(self.tid, None).died_if_esrch(self.tid, "ptrace(PTRACE_SINGLESTEP)")?;
        self.state = RunState::Running;

        Ok(())
    }

    /// Resumes the task.
    pub fn resume(&mut self) -> Result<()> {
        assert_eq!(self.state, RunState::Stopped, "resume() on a running thread");

        ptrace::cont(self.tid, None).died_if_esrch(self.tid, "ptrace(PTRACE_CONT)")?;
        self.state = RunState::Running;

        Ok(())
    }

    /// Asks the task to stop. The stop is observed by a later debug event.
    pub fn stop(&self) -> Result<()> {
        assert_eq!(self.state, RunState::Running, "stop() on a stopped thread");
        self.tgkill(Signal::SIGSTOP)
    }

    /// Terminates the task.
    pub fn kill(&self) -> Result<()> {
        assert_eq!(self.state, RunState::Running, "kill() on a stopped thread");
        self.tgkill(Signal::SIGKILL)
    }

    fn tgkill(&self, signal: Signal) -> Result<()> {
        let res = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                libc::c_long::from(self.pid.as_raw()),
                libc::c_long::from(self.tid.as_raw()),
                signal as libc::c_long,
            )
        };

        Errno::result(res)
            .map(drop)
            .died_if_esrch(self.tid, "tgkill")
    }

    pub fn is_exited(&self) -> bool {
        assert_eq!(self.state, RunState::Stopped, "is_exited() on a running thread");
        libc::WIFEXITED(self.wstatus)
    }

    pub fn is_signaled(&self) -> bool {
        assert_eq!(self.state, RunState::Stopped, "is_signaled() on a running thread");
        libc::WIFSIGNALED(self.wstatus)
    }

    pub fn is_stopped(&self) -> bool {
        assert_eq!(self.state, RunState::Stopped, "is_stopped() on a running thread");
        libc::WIFSTOPPED(self.wstatus)
    }

    pub fn is_continued(&self) -> bool {
        assert_eq!(self.state, RunState::Stopped, "is_continued() on a running thread");
        libc::WIFCONTINUED(self.wstatus)
    }

    pub fn exit_status(&self) -> i32 {
        assert_eq!(self.state, RunState::Stopped, "exit_status() on a running thread");
        libc::WEXITSTATUS(self.wstatus)
    }

    pub fn signal_status(&self) -> i32 {
        assert_eq!(self.state, RunState::Stopped, "signal_status() on a running thread");
        libc::WTERMSIG(self.wstatus)
    }

    pub fn stop_status(&self) -> i32 {
        assert_eq!(self.state, RunState::Stopped, "stop_status() on a running thread");
        libc::WSTOPSIG(self.wstatus)
    }

    /// Captures the full architectural state of the stopped task.
    pub fn get_context(&self) -> Result<Context> {
        assert_eq!(self.state, RunState::Stopped, "get_context() on a running thread");

        let mut ctx = Context::new(self.is_64_bit);

        self.get_registers(&mut ctx)?;
        self.get_xstate(&mut ctx)?;
        self.get_debug_registers(&mut ctx)?;
        self.get_segment_bases(&mut ctx)?;

        Ok(ctx)
    }

    /// Writes a (possibly modified) context back into the stopped task.
    pub fn set_context(&self, ctx: &Context) -> Result<()> {
        assert_eq!(self.state, RunState::Stopped, "set_context() on a running thread");

        self.set_registers(ctx)?;
        self.set_xstate(ctx)?;
        self.set_debug_registers(ctx)?;

        Ok(())
    }

    // On a 64-bit build PTRACE_GETREGS reports the 64-bit layout no matter the
    // tracee's bitness, which conveniently normalizes a 32-bit target's
    // registers into the 64-bit slots.
    #[cfg(target_arch = "x86_64")]
    fn get_registers(&self, ctx: &mut Context) -> Result<()> {
        let GpState::Bits64(regs) = &mut ctx.gp else {
            internal_error!("64-bit tracer context without 64-bit storage");
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGS,
                self.tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                regs as *mut Regs64,
            )
        };
        Errno::result(res)
            .map(drop)
            .died_if_esrch(self.tid, "ptrace(PTRACE_GETREGS)")
    }

    #[cfg(target_arch = "x86")]
    fn get_registers(&self, ctx: &mut Context) -> Result<()> {
        let mut iov = match &mut ctx.gp {
            GpState::Bits64(regs) => libc::iovec {
                iov_base: (regs as *mut Regs64).cast(),
                iov_len: std::mem::size_of::<Regs64>(),
            },
            GpState::Bits32(gp) => libc::iovec {
                iov_base: (&mut gp.regs as *mut Regs32).cast(),
                iov_len: std::mem::size_of::<Regs32>(),
            },
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.tid.as_raw(),
                NT_PRSTATUS,
                &mut iov,
            )
        };
        Errno::result(res)
            .map(drop)
            .died_if_esrch(self.tid, "ptrace(PTRACE_GETREGSET)")
    }

    #[cfg(target_arch = "x86_64")]
    fn set_registers(&self, ctx: &Context) -> Result<()> {
        let GpState::Bits64(regs) = &ctx.gp else {
            internal_error!("64-bit tracer context without 64-bit storage");
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGS,
                self.tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                regs as *const Regs64,
            )
        };
        Errno::result(res)
            .map(drop)
            .died_if_esrch(self.tid, "ptrace(PTRACE_SETREGS)")
    }

    #[cfg(target_arch = "x86")]
    fn set_registers(&self, ctx: &Context) -> Result<()> {
        let mut iov = match &ctx.gp {
            GpState::Bits64(regs) => libc::iovec {
                iov_base: (regs as *const Regs64 as *mut Regs64).cast(),
                iov_len: std::mem::size_of::<Regs64>(),
            },
            GpState::Bits32(gp) => libc::iovec {
                iov_base: (&gp.regs as *const Regs32 as *mut Regs32).cast(),
                iov_len: std::mem::size_of::<Regs32>(),
            },
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.tid.as_raw(),
                NT_PRSTATUS,
                &mut iov,
            )
        };
        Errno::result(res)
            .map(drop)
            .died_if_esrch(self.tid, "ptrace(PTRACE_SETREGSET)")
    }

    fn get_xstate(&self, ctx: &mut Context) -> Result<()> {
        let mut iov = libc::iovec {
            iov_base: (ctx.xsave.as_mut() as *mut XSaveArea).cast(),
            iov_len: XSAVE_BUFFER_SIZE,
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.tid.as_raw(),
                NT_X86_XSTATE,
                &mut iov,
            )
        };

        #[cfg(target_arch = "x86")]
        if res == -1 && Errno::last() != Errno::ESRCH {
            // Pre-XSAVE kernel; fall back to the fxsave image (x87 + SSE, no
            // AVX and above).
            return self.get_xstate_fpx(ctx);
        }

        Errno::result(res).died_if_esrch(self.tid, "ptrace(PTRACE_GETREGSET, NT_X86_XSTATE)")?;

        // The kernel reports the machine's true user-xstate size back; a
        // write-back must use exactly that many bytes.
        ctx.xsave_len = iov.iov_len;
        ctx.load_xsave();

        Ok(())
    }

    fn set_xstate(&self, ctx: &Context) -> Result<()> {
        let mut area = ctx.encoded_xsave();
        let mut iov = libc::iovec {
            iov_base: (&mut area as *mut XSaveArea).cast(),
            iov_len: ctx.xsave_len,
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.tid.as_raw(),
                NT_X86_XSTATE,
                &mut iov,
            )
        };
        Errno::result(res)
            .map(drop)
            .died_if_esrch(self.tid, "ptrace(PTRACE_SETREGSET, NT_X86_XSTATE)")
    }

    #[cfg(target_arch = "x86")]
    fn get_xstate_fpx(&self, ctx: &mut Context) -> Result<()> {
        // Layout of user_fpxregs_struct in sys/user.h.
        #[repr(C)]
        struct FpxRegs {
            cwd: u16,
            swd: u16,
            twd: u16,
            fop: u16,
            fip: u32,
            fcs: u32,
            foo: u32,
            fos: u32,
            mxcsr: u32,
            reserved: u32,
            st_space: [u8; 128],
            xmm_space: [u8; 128],
            padding: [u8; 224],
        }

        const PTRACE_GETFPXREGS: libc::c_uint = 18;

        let mut regs = MaybeUninit::<FpxRegs>::uninit();
        let res = unsafe {
            libc::ptrace(
                PTRACE_GETFPXREGS,
                self.tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                regs.as_mut_ptr(),
            )
        };
        Errno::result(res).died_if_esrch(self.tid, "ptrace(PTRACE_GETFPXREGS)")?;
        let regs = unsafe { regs.assume_init() };

        let x87 = &mut ctx.xstate.x87;
        for (i, st) in x87.registers.iter_mut().enumerate() {
            st.bytes.copy_from_slice(&regs.st_space[i * 16..(i + 1) * 16]);
        }
        x87.control_word = regs.cwd;
        x87.status_word = regs.swd;
        x87.tag_word = regs.twd;
        x87.opcode = regs.fop;
        x87.inst_ptr = u64::from(regs.fip);
        x87.data_ptr = u64::from(regs.foo);
        x87.inst_ptr_selector = regs.fcs as u16;
        x87.data_ptr_selector = regs.fos as u16;
        x87.filled = true;

        let simd = &mut ctx.xstate.simd;
        simd.registers = [crate::context::SimdRegister::ZERO; 32];
        for (i, slot) in simd.registers.iter_mut().take(8).enumerate() {
            slot.bytes[..16].copy_from_slice(&regs.xmm_space[i * 16..(i + 1) * 16]);
        }
        simd.mxcsr = regs.mxcsr;
        simd.mxcsr_mask = 0;
        simd.sse_filled = true;
        simd.avx_filled = false;
        simd.zmm_filled = false;

        Ok(())
    }

    fn get_debug_registers(&self, ctx: &mut Context) -> Result<()> {
        // Only reachable one slot at a time, through the virtual `user` area.
        // A 32-bit build reads truncated values for a 64-bit target; the
        // kernel interface offers nothing better there.
        for (i, slot) in ctx.dr.iter_mut().enumerate() {
            *slot = self.peek_user(x86::debugreg_user_offset(i))? as u64;
        }

        Ok(())
    }

    fn set_debug_registers(&self, ctx: &Context) -> Result<()> {
        // DR4 and DR5 are reserved aliases the kernel refuses to write.
        for i in [0, 1, 2, 3, 6, 7] {
            self.poke_user(x86::debugreg_user_offset(i), ctx.dr[i] as libc::c_ulong)?;
        }

        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn get_segment_bases(&self, _ctx: &mut Context) -> Result<()> {
        // FS_BASE and GS_BASE are part of the 64-bit register dump.
        Ok(())
    }

    #[cfg(target_arch = "x86")]
    fn get_segment_bases(&self, ctx: &mut Context) -> Result<()> {
        if ctx.is_64_bit() {
            return Ok(());
        }

        let fs_base = self.get_segment_base(ctx, RegisterId::Fs)?;
        let gs_base = self.get_segment_base(ctx, RegisterId::Gs)?;

        let GpState::Bits32(gp) = &mut ctx.gp else {
            internal_error!("32-bit target context without 32-bit storage");
        };
        gp.fs_base = fs_base;
        gp.gs_base = gs_base;

        Ok(())
    }

    /// Resolves a segment selector to its descriptor base address. A null
    /// selector or one that picks from the LDT resolves to 0.
    #[cfg(target_arch = "x86")]
    fn get_segment_base(&self, ctx: &mut Context, reg: RegisterId) -> Result<u32> {
        const PTRACE_GET_THREAD_AREA: libc::c_uint = 25;
        const LDT_ENTRY_SIZE: u16 = 8;

        // Matches struct user_desc in asm/ldt.h.
        #[repr(C)]
        struct UserDesc {
            entry_number: u32,
            base_addr: u32,
            limit: u32,
            flags: u32,
        }

        let selector = ctx.get(reg).read::<u16>();
        if selector == 0 {
            return Ok(0);
        }

        // Bit 2 set means the selector picks a descriptor from the LDT.
        let from_gdt = selector & 0x04 == 0;
        if !from_gdt {
            return Ok(0);
        }

        let mut desc = MaybeUninit::<UserDesc>::uninit();
        let res = unsafe {
            libc::ptrace(
                PTRACE_GET_THREAD_AREA,
                self.tid.as_raw(),
                libc::c_ulong::from(selector / LDT_ENTRY_SIZE),
                desc.as_mut_ptr(),
            )
        };
        Errno::result(res).died_if_esrch(self.tid, "ptrace(PTRACE_GET_THREAD_AREA)")?;

        Ok(unsafe { desc.assume_init() }.base_addr)
    }

    /// Reads the instruction pointer without a full context fetch.
    pub fn get_instruction_pointer(&self) -> Result<u64> {
        assert_eq!(
            self.state,
            RunState::Stopped,
            "get_instruction_pointer() on a running thread"
        );

        #[cfg(target_arch = "x86")]
        if self.is_64_bit {
            // PEEKUSER returns a 32-bit word here and would truncate RIP.
            let regs = self.read_regs64()?;
            return Ok(regs.rip);
        }

        Ok(self.peek_user(x86::ip_user_offset())? as u64)
    }

    /// Writes the instruction pointer without a full context store.
    pub fn set_instruction_pointer(&self, ip: u64) -> Result<()> {
        assert_eq!(
            self.state,
            RunState::Stopped,
            "set_instruction_pointer() on a running thread"
        );

        #[cfg(target_arch = "x86")]
        if self.is_64_bit {
            let mut regs = self.read_regs64()?;
            regs.rip = ip;
            return self.write_regs64(&regs);
        }

        self.poke_user(x86::ip_user_offset(), ip as libc::c_ulong)
    }

    #[cfg(target_arch = "x86")]
    fn read_regs64(&self) -> Result<Regs64> {
        let mut regs = MaybeUninit::<Regs64>::uninit();
        let mut iov = libc::iovec {
            iov_base: regs.as_mut_ptr().cast(),
            iov_len: std::mem::size_of::<Regs64>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.tid.as_raw(),
                NT_PRSTATUS,
                &mut iov,
            )
        };
        Errno::result(res).died_if_esrch(self.tid, "ptrace(PTRACE_GETREGSET)")?;

        Ok(unsafe { regs.assume_init() })
    }

    #[cfg(target_arch = "x86")]
    fn write_regs64(&self, regs: &Regs64) -> Result<()> {
        let mut iov = libc::iovec {
            iov_base: (regs as *const Regs64 as *mut Regs64).cast(),
            iov_len: std::mem::size_of::<Regs64>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.tid.as_raw(),
                NT_PRSTATUS,
                &mut iov,
            )
        };
        Errno::result(res)
            .map(drop)
            .died_if_esrch(self.tid, "ptrace(PTRACE_SETREGSET)")
    }

    fn peek_user(&self, offset: u64) -> Result<libc::c_ulong> {
        // The kernel interprets `offset` itself; it is never dereferenced as
        // a tracer-side pointer.
        Errno::clear();
        let data = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                self.tid.as_raw(),
                offset as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };

        if data == -1 && Errno::last_raw() != 0 {
            return Err(Errno::last()).died_if_esrch(self.tid, "ptrace(PTRACE_PEEKUSER)");
        }

        Ok(data as libc::c_ulong)
    }

    fn poke_user(&self, offset: u64, data: libc::c_ulong) -> Result<()> {
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                self.tid.as_raw(),
                offset as libc::c_ulong,
                data,
            )
        };

        Errno::result(res)
            .map(drop)
            .died_if_esrch(self.tid, "ptrace(PTRACE_POKEUSER)")
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("state", &self.state)
            .field("is_64_bit", &self.is_64_bit)
            .finish_non_exhaustive()
    }
}
