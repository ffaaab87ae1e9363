//! The per-thread CPU snapshot and the typed register views into it.
//!
//! A [`Context`] carries one of two general-purpose layouts (the kernel's
//! 32-bit or 64-bit `user_regs_struct`), the eight debug-register slots, and a
//! normalized extended-state record that is independent of which XSAVE
//! features the target CPU actually reported. Registers are addressed through
//! [`RegisterId`] and surfaced as [`RegisterRef`] byte views borrowing from
//! the context storage.

use tracing::warn;

use crate::x86::{
    Regs32, Regs64, XSaveArea, MXCSR_DEFAULT, XFEATURE_AVX, XFEATURE_AVX512, XFEATURE_SSE,
    XFEATURE_X87, XSAVE_HI16_ZMM_OFFSET, XSAVE_YMM_HI128_OFFSET, XSAVE_ZMM_HI256_OFFSET,
};

/// Symbolic register identifiers.
///
/// Covers every addressable width of the general-purpose file, the segment
/// selectors and bases, the debug registers, the x87/MMX/SSE/AVX/AVX-512
/// state, and the width-generic aliases (`Xax`, `Xip`, ...) that resolve to
/// the 32- or 64-bit variant depending on the context layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum RegisterId {
    Invalid,

    OrigEax,

    Gs,
    Fs,
    Es,
    Ds,
    Cs,
    Ss,
    FsBase,
    GsBase,

    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr4,
    Dr5,
    Dr6,
    Dr7,

    Eflags,
    Rflags,

    Eax,
    Ax,
    Ah,
    Al,
    Ebx,
    Bx,
    Bh,
    Bl,
    Ecx,
    Cx,
    Ch,
    Cl,
    Edx,
    Dx,
    Dh,
    Dl,
    Edi,
    Di,
    Esi,
    Si,
    Ebp,
    Bp,
    Esp,
    Sp,
    Eip,

    OrigRax,
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Sil,
    Rdi,
    Dil,
    Rbp,
    Bpl,
    Rsp,
    Spl,
    Rip,
    R8,
    R8d,
    R8w,
    R8b,
    R9,
    R9d,
    R9w,
    R9b,
    R10,
    R10d,
    R10w,
    R10b,
    R11,
    R11d,
    R11w,
    R11b,
    R12,
    R12d,
    R12w,
    R12b,
    R13,
    R13d,
    R13w,
    R13b,
    R14,
    R14d,
    R14w,
    R14b,
    R15,
    R15d,
    R15w,
    R15b,

    St0,
    St1,
    St2,
    St3,
    St4,
    St5,
    St6,
    St7,

    /// x87 control word.
    Cwd,
    /// x87 status word.
    Swd,
    /// x87 tag word.
    Ftw,
    /// Last x87 instruction opcode.
    Fop,
    /// Last x87 instruction pointer.
    Fip,
    /// Last x87 operand pointer.
    Fdp,
    /// SSE control and status register.
    Mxcsr,
    /// Writable bit mask of MXCSR.
    MxcsrMask,

    Mm0,
    Mm1,
    Mm2,
    Mm3,
    Mm4,
    Mm5,
    Mm6,
    Mm7,

    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
    Ymm0,
    Ymm1,
    Ymm2,
    Ymm3,
    Ymm4,
    Ymm5,
    Ymm6,
    Ymm7,
    Ymm8,
    Ymm9,
    Ymm10,
    Ymm11,
    Ymm12,
    Ymm13,
    Ymm14,
    Ymm15,
    Zmm0,
    Zmm1,
    Zmm2,
    Zmm3,
    Zmm4,
    Zmm5,
    Zmm6,
    Zmm7,
    Zmm8,
    Zmm9,
    Zmm10,
    Zmm11,
    Zmm12,
    Zmm13,
    Zmm14,
    Zmm15,

    // Width-generic aliases.
    Xax,
    Xcx,
    Xdx,
    Xsi,
    Xdi,
    Xip,
    Xsp,
    Xflags,
}

/// Integer types a register slice can be read as or assigned from.
pub trait RegisterValue: sealed::Sealed + Copy {
    #[doc(hidden)]
    fn from_reg_bytes(bytes: &[u8]) -> Self;

    #[doc(hidden)]
    fn write_reg_bytes(self, dst: &mut [u8]);
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! int_register_value {
    ($($int: ty),* $(,)?) => {$(
        impl sealed::Sealed for $int {}

        impl RegisterValue for $int {
            fn from_reg_bytes(bytes: &[u8]) -> Self {
                // Zero-extend the register into the integer being read.
                let mut raw = [0u8; std::mem::size_of::<$int>()];
                let n = raw.len().min(bytes.len());
                raw[..n].copy_from_slice(&bytes[..n]);
                <$int>::from_le_bytes(raw)
            }

            fn write_reg_bytes(self, dst: &mut [u8]) {
                // Zero-extend the value into the register slot.
                dst.fill(0);
                let raw = self.to_le_bytes();
                let n = raw.len().min(dst.len());
                dst[..n].copy_from_slice(&raw[..n]);
            }
        }
    )*};
}

int_register_value!(u8, u16, u32, u64, u128);

/// A borrowed byte view of one register slice inside a [`Context`].
///
/// A ref is *invalid* (zero-sized) when the context does not carry the
/// requested register for its current layout; probe with
/// [`RegisterRef::is_valid`].
#[derive(Debug)]
pub struct RegisterRef<'a> {
    name: &'static str,
    data: &'a mut [u8],
}

impl<'a> RegisterRef<'a> {
    fn new(name: &'static str, data: &'a mut [u8]) -> Self {
        Self { name, data }
    }

    fn invalid() -> Self {
        Self {
            name: "",
            data: &mut [],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        self.data
    }

    /// Reads the register as `T`, zero-extending when the register is
    /// narrower than `T` and truncating to the low bytes when it is wider.
    pub fn read<T: RegisterValue>(&self) -> T {
        T::from_reg_bytes(self.data)
    }

    /// Assigns `value`, zero-extending it into the register slot.
    pub fn write<T: RegisterValue>(&mut self, value: T) {
        value.write_reg_bytes(self.data);
    }

    fn apply_wrapping(&mut self, delta: u64, negate: bool) {
        let width = self.size();
        assert!(
            matches!(width, 1 | 2 | 4 | 8),
            "register arithmetic on {width}-byte register {}",
            self.name
        );

        let value = self.read::<u64>();
        let value = if negate {
            value.wrapping_sub(delta)
        } else {
            value.wrapping_add(delta)
        };

        // Writing back truncates to the register width, which also makes the
        // wrap-around behave per-width.
        self.write(value);
    }
}

impl PartialEq for RegisterRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl std::ops::AddAssign<u64> for RegisterRef<'_> {
    fn add_assign(&mut self, delta: u64) {
        self.apply_wrapping(delta, false);
    }
}

impl std::ops::SubAssign<u64> for RegisterRef<'_> {
    fn sub_assign(&mut self, delta: u64) {
        self.apply_wrapping(delta, true);
    }
}

/// One x87 register; 16 bytes of storage for the 80-bit value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct X87Register {
    pub bytes: [u8; 16],
}

impl X87Register {
    pub const ZERO: Self = Self { bytes: [0; 16] };
}

impl Default for X87Register {
    fn default() -> Self {
        Self::ZERO
    }
}

/// One SIMD register slot. Always 64 bytes so a full ZMM value fits; an XMM
/// or YMM value occupies the low bytes and the remainder stays zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SimdRegister {
    pub bytes: [u8; 64],
}

impl SimdRegister {
    pub const ZERO: Self = Self { bytes: [0; 64] };
}

impl Default for SimdRegister {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Normalized x87 state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct X87State {
    pub registers: [X87Register; 8],
    pub inst_ptr: u64,
    pub data_ptr: u64,
    pub inst_ptr_selector: u16,
    pub data_ptr_selector: u16,
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u16,
    pub opcode: u16,
    /// Whether the target actually reported x87 state.
    pub filled: bool,
}

impl Default for X87State {
    fn default() -> Self {
        Self {
            registers: [X87Register::ZERO; 8],
            inst_ptr: 0,
            data_ptr: 0,
            inst_ptr_selector: 0,
            data_ptr_selector: 0,
            control_word: 0,
            status_word: 0,
            tag_word: 0,
            opcode: 0,
            filled: false,
        }
    }
}

/// Normalized SIMD state.
///
/// The fill flags form a prefix: `avx_filled` implies `sse_filled`, and
/// `zmm_filled` implies `avx_filled`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimdState {
    /// XMM0-15 / YMM0-15 / ZMM0-31, widest-first storage.
    pub registers: [SimdRegister; 32],
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub sse_filled: bool,
    pub avx_filled: bool,
    pub zmm_filled: bool,
}

impl Default for SimdState {
    fn default() -> Self {
        Self {
            registers: [SimdRegister::ZERO; 32],
            mxcsr: 0,
            mxcsr_mask: 0,
            sse_filled: false,
            avx_filled: false,
            zmm_filled: false,
        }
    }
}

/// Normalized extended state shared by both context layouts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExtendedState {
    pub x87: X87State,
    pub simd: SimdState,
}

/// 32-bit general-purpose storage plus the LDT-resolved segment bases, which
/// the 32-bit register dump does not carry on its own.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Gp32 {
    pub regs: Regs32,
    pub fs_base: u32,
    pub gs_base: u32,
}

/// The general-purpose layout a context was captured into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GpState {
    Bits32(Gp32),
    Bits64(Regs64),
}

/// The complete architectural state of one stopped thread.
pub struct Context {
    pub(crate) gp: GpState,
    pub(crate) dr: [u64; 8],
    pub(crate) xstate: ExtendedState,
    /// Raw XSAVE image as fetched; preserved so a store writes back the
    /// portions we do not model.
    pub(crate) xsave: Box<XSaveArea>,
    /// The user-xstate size the kernel reported on fetch. A store must pass
    /// exactly this many bytes back.
    pub(crate) xsave_len: usize,
    pub(crate) is_64_bit: bool,
}

fn bytes_of_mut<T>(value: &mut T) -> &mut [u8] {
    // SAFETY: only ever applied to plain-old-data register fields, for which
    // any byte pattern is a valid value.
    unsafe { std::slice::from_raw_parts_mut(value as *mut T as *mut u8, std::mem::size_of::<T>()) }
}

fn reg<'a, T>(name: &'static str, field: &'a mut T) -> RegisterRef<'a> {
    RegisterRef::new(name, bytes_of_mut(field))
}

fn reg_at<'a, T>(
    name: &'static str,
    field: &'a mut T,
    size: usize,
    offset: usize,
) -> RegisterRef<'a> {
    let bytes = bytes_of_mut(field);
    RegisterRef::new(name, &mut bytes[offset..offset + size])
}

impl Context {
    /// Creates an empty context for a target of the given bitness.
    ///
    /// On a 64-bit build the storage layout is always the 64-bit one: the
    /// kernel normalizes a 32-bit target's registers into 64-bit slots when
    /// fetched with `PTRACE_GETREGS`. A 32-bit build picks the layout that
    /// matches the target.
    pub fn new(is_64_bit: bool) -> Self {
        #[cfg(target_arch = "x86_64")]
        let gp = GpState::Bits64(Regs64::default());

        #[cfg(target_arch = "x86")]
        let gp = if is_64_bit {
            GpState::Bits64(Regs64::default())
        } else {
            GpState::Bits32(Gp32::default())
        };

        Self {
            gp,
            dr: [0; 8],
            xstate: ExtendedState::default(),
            xsave: Box::new(XSaveArea::zeroed()),
            xsave_len: crate::x86::XSAVE_SIZE,
            is_64_bit,
        }
    }

    /// Bitness of the thread this context was captured from.
    pub fn is_64_bit(&self) -> bool {
        self.is_64_bit
    }

    pub fn gp(&self) -> &GpState {
        &self.gp
    }

    pub fn extended_state(&self) -> &ExtendedState {
        &self.xstate
    }

    pub fn extended_state_mut(&mut self) -> &mut ExtendedState {
        &mut self.xstate
    }

    pub fn debug_registers(&self) -> &[u64; 8] {
        &self.dr
    }

    /// Returns a view of the given register, or an invalid ref when the
    /// current layout does not carry it.
    pub fn get(&mut self, id: RegisterId) -> RegisterRef<'_> {
        match &mut self.gp {
            GpState::Bits64(gp) => Self::get_64(gp, &mut self.dr, &mut self.xstate, id),
            GpState::Bits32(gp) => Self::get_32(gp, &mut self.dr, &mut self.xstate, id),
        }
    }

    /// Copies the value of `src` into `dst`. Both registers must be valid and
    /// the same size; returns whether the copy happened.
    pub fn copy_register(&mut self, dst: RegisterId, src: RegisterId) -> bool {
        let mut buf = [0u8; 64];

        let len = {
            let src = self.get(src);
            if !src.is_valid() {
                return false;
            }
            buf[..src.size()].copy_from_slice(src.bytes());
            src.size()
        };

        let dst = self.get(dst);
        if !dst.is_valid() || dst.size() != len {
            return false;
        }
        dst.data.copy_from_slice(&buf[..len]);

        true
    }

    #[rustfmt::skip]
    fn get_64<'a>(
        gp: &'a mut Regs64,
        dr: &'a mut [u64; 8],
        xs: &'a mut ExtendedState,
        id: RegisterId,
    ) -> RegisterRef<'a> {
        use RegisterId::*;

        match id {
            // Segment registers.
            Cs     => reg("cs", &mut gp.cs),
            Ds     => reg("ds", &mut gp.ds),
            Es     => reg("es", &mut gp.es),
            Fs     => reg("fs", &mut gp.fs),
            Gs     => reg("gs", &mut gp.gs),
            Ss     => reg("ss", &mut gp.ss),
            FsBase => reg("fs_base", &mut gp.fs_base),
            GsBase => reg("gs_base", &mut gp.gs_base),

            // Width-generic aliases.
            Xax    => reg("rax", &mut gp.rax),
            Xcx    => reg("rcx", &mut gp.rcx),
            Xdx    => reg("rdx", &mut gp.rdx),
            Xsi    => reg("rsi", &mut gp.rsi),
            Xdi    => reg("rdi", &mut gp.rdi),
            Xip    => reg("rip", &mut gp.rip),
            Xsp    => reg("rsp", &mut gp.rsp),
            Xflags => reg("rflags", &mut gp.rflags),

            // 64-bit GP registers.
            R15     => reg("r15", &mut gp.r15),
            R14     => reg("r14", &mut gp.r14),
            R13     => reg("r13", &mut gp.r13),
            R12     => reg("r12", &mut gp.r12),
            Rbp     => reg("rbp", &mut gp.rbp),
            Rbx     => reg("rbx", &mut gp.rbx),
            R11     => reg("r11", &mut gp.r11),
            R10     => reg("r10", &mut gp.r10),
            R9      => reg("r9", &mut gp.r9),
            R8      => reg("r8", &mut gp.r8),
            Rax     => reg("rax", &mut gp.rax),
            Rcx     => reg("rcx", &mut gp.rcx),
            Rdx     => reg("rdx", &mut gp.rdx),
            Rsi     => reg("rsi", &mut gp.rsi),
            Rdi     => reg("rdi", &mut gp.rdi),
            Rip     => reg("rip", &mut gp.rip),
            Rsp     => reg("rsp", &mut gp.rsp),
            Rflags  => reg("rflags", &mut gp.rflags),
            OrigRax => reg("orig_rax", &mut gp.orig_rax),

            // 32-bit views.
            Eax     => reg_at("eax", &mut gp.rax, 4, 0),
            Ebx     => reg_at("ebx", &mut gp.rbx, 4, 0),
            Ecx     => reg_at("ecx", &mut gp.rcx, 4, 0),
            Edx     => reg_at("edx", &mut gp.rdx, 4, 0),
            Esi     => reg_at("esi", &mut gp.rsi, 4, 0),
            Edi     => reg_at("edi", &mut gp.rdi, 4, 0),
            Eip     => reg_at("eip", &mut gp.rip, 4, 0),
            Esp     => reg_at("esp", &mut gp.rsp, 4, 0),
            Ebp     => reg_at("ebp", &mut gp.rbp, 4, 0),
            R8d     => reg_at("r8d", &mut gp.r8, 4, 0),
            R9d     => reg_at("r9d", &mut gp.r9, 4, 0),
            R10d    => reg_at("r10d", &mut gp.r10, 4, 0),
            R11d    => reg_at("r11d", &mut gp.r11, 4, 0),
            R12d    => reg_at("r12d", &mut gp.r12, 4, 0),
            R13d    => reg_at("r13d", &mut gp.r13, 4, 0),
            R14d    => reg_at("r14d", &mut gp.r14, 4, 0),
            R15d    => reg_at("r15d", &mut gp.r15, 4, 0),
            Eflags  => reg_at("eflags", &mut gp.rflags, 4, 0),
            OrigEax => reg_at("orig_eax", &mut gp.orig_rax, 4, 0),

            // 16-bit views.
            Ax   => reg_at("ax", &mut gp.rax, 2, 0),
            Bx   => reg_at("bx", &mut gp.rbx, 2, 0),
            Cx   => reg_at("cx", &mut gp.rcx, 2, 0),
            Dx   => reg_at("dx", &mut gp.rdx, 2, 0),
            Si   => reg_at("si", &mut gp.rsi, 2, 0),
            Di   => reg_at("di", &mut gp.rdi, 2, 0),
            Bp   => reg_at("bp", &mut gp.rbp, 2, 0),
            Sp   => reg_at("sp", &mut gp.rsp, 2, 0),
            R8w  => reg_at("r8w", &mut gp.r8, 2, 0),
            R9w  => reg_at("r9w", &mut gp.r9, 2, 0),
            R10w => reg_at("r10w", &mut gp.r10, 2, 0),
            R11w => reg_at("r11w", &mut gp.r11, 2, 0),
            R12w => reg_at("r12w", &mut gp.r12, 2, 0),
            R13w => reg_at("r13w", &mut gp.r13, 2, 0),
            R14w => reg_at("r14w", &mut gp.r14, 2, 0),
            R15w => reg_at("r15w", &mut gp.r15, 2, 0),

            // 8-bit views; the x86 high-byte registers sit at offset 1.
            Al   => reg_at("al", &mut gp.rax, 1, 0),
            Bl   => reg_at("bl", &mut gp.rbx, 1, 0),
            Cl   => reg_at("cl", &mut gp.rcx, 1, 0),
            Dl   => reg_at("dl", &mut gp.rdx, 1, 0),
            Ah   => reg_at("ah", &mut gp.rax, 1, 1),
            Bh   => reg_at("bh", &mut gp.rbx, 1, 1),
            Ch   => reg_at("ch", &mut gp.rcx, 1, 1),
            Dh   => reg_at("dh", &mut gp.rdx, 1, 1),
            Sil  => reg_at("sil", &mut gp.rsi, 1, 0),
            Dil  => reg_at("dil", &mut gp.rdi, 1, 0),
            Bpl  => reg_at("bpl", &mut gp.rbp, 1, 0),
            Spl  => reg_at("spl", &mut gp.rsp, 1, 0),
            R8b  => reg_at("r8b", &mut gp.r8, 1, 0),
            R9b  => reg_at("r9b", &mut gp.r9, 1, 0),
            R10b => reg_at("r10b", &mut gp.r10, 1, 0),
            R11b => reg_at("r11b", &mut gp.r11, 1, 0),
            R12b => reg_at("r12b", &mut gp.r12, 1, 0),
            R13b => reg_at("r13b", &mut gp.r13, 1, 0),
            R14b => reg_at("r14b", &mut gp.r14, 1, 0),
            R15b => reg_at("r15b", &mut gp.r15, 1, 0),

            // Debug registers.
            Dr0 => reg("dr0", &mut dr[0]),
            Dr1 => reg("dr1", &mut dr[1]),
            Dr2 => reg("dr2", &mut dr[2]),
            Dr3 => reg("dr3", &mut dr[3]),
            Dr4 => reg("dr4", &mut dr[4]),
            Dr5 => reg("dr5", &mut dr[5]),
            Dr6 => reg("dr6", &mut dr[6]),
            Dr7 => reg("dr7", &mut dr[7]),

            _ => Self::get_extended(xs, id),
        }
    }

    #[rustfmt::skip]
    fn get_32<'a>(
        gp: &'a mut Gp32,
        dr: &'a mut [u64; 8],
        xs: &'a mut ExtendedState,
        id: RegisterId,
    ) -> RegisterRef<'a> {
        use RegisterId::*;

        match id {
            Eax     => reg("eax", &mut gp.regs.eax),
            Ebx     => reg("ebx", &mut gp.regs.ebx),
            Ecx     => reg("ecx", &mut gp.regs.ecx),
            Edx     => reg("edx", &mut gp.regs.edx),
            Esi     => reg("esi", &mut gp.regs.esi),
            Edi     => reg("edi", &mut gp.regs.edi),
            OrigEax => reg("orig_eax", &mut gp.regs.orig_eax),
            Eip     => reg("eip", &mut gp.regs.eip),
            Cs      => reg("cs", &mut gp.regs.cs),
            Eflags  => reg("eflags", &mut gp.regs.eflags),
            Esp     => reg("esp", &mut gp.regs.esp),
            Ebp     => reg("ebp", &mut gp.regs.ebp),
            Ss      => reg("ss", &mut gp.regs.ss),
            Ds      => reg("ds", &mut gp.regs.ds),
            Es      => reg("es", &mut gp.regs.es),
            Fs      => reg("fs", &mut gp.regs.fs),
            Gs      => reg("gs", &mut gp.regs.gs),
            FsBase  => reg("fs_base", &mut gp.fs_base),
            GsBase  => reg("gs_base", &mut gp.gs_base),

            // Debug registers.
            Dr0 => reg("dr0", &mut dr[0]),
            Dr1 => reg("dr1", &mut dr[1]),
            Dr2 => reg("dr2", &mut dr[2]),
            Dr3 => reg("dr3", &mut dr[3]),
            Dr4 => reg("dr4", &mut dr[4]),
            Dr5 => reg("dr5", &mut dr[5]),
            Dr6 => reg("dr6", &mut dr[6]),
            Dr7 => reg("dr7", &mut dr[7]),

            // Width-generic aliases.
            Xax    => reg("eax", &mut gp.regs.eax),
            Xcx    => reg("ecx", &mut gp.regs.ecx),
            Xdx    => reg("edx", &mut gp.regs.edx),
            Xsi    => reg("esi", &mut gp.regs.esi),
            Xdi    => reg("edi", &mut gp.regs.edi),
            Xip    => reg("eip", &mut gp.regs.eip),
            Xsp    => reg("esp", &mut gp.regs.esp),
            Xflags => reg("eflags", &mut gp.regs.eflags),

            // Only eight SIMD lanes exist for a 32-bit task.
            Xmm8 | Xmm9 | Xmm10 | Xmm11 | Xmm12 | Xmm13 | Xmm14 | Xmm15
            | Ymm8 | Ymm9 | Ymm10 | Ymm11 | Ymm12 | Ymm13 | Ymm14 | Ymm15
            | Zmm0 | Zmm1 | Zmm2 | Zmm3 | Zmm4 | Zmm5 | Zmm6 | Zmm7
            | Zmm8 | Zmm9 | Zmm10 | Zmm11 | Zmm12 | Zmm13 | Zmm14 | Zmm15 => {
                warn!(?id, "register not available in 32-bit context");
                RegisterRef::invalid()
            }

            _ => Self::get_extended(xs, id),
        }
    }

    #[rustfmt::skip]
    fn get_extended(xs: &mut ExtendedState, id: RegisterId) -> RegisterRef<'_> {
        use RegisterId::*;

        match id {
            // x87 registers and environment.
            St0 => reg_at("st0", &mut xs.x87.registers[0].bytes, 16, 0),
            St1 => reg_at("st1", &mut xs.x87.registers[1].bytes, 16, 0),
            St2 => reg_at("st2", &mut xs.x87.registers[2].bytes, 16, 0),
            St3 => reg_at("st3", &mut xs.x87.registers[3].bytes, 16, 0),
            St4 => reg_at("st4", &mut xs.x87.registers[4].bytes, 16, 0),
            St5 => reg_at("st5", &mut xs.x87.registers[5].bytes, 16, 0),
            St6 => reg_at("st6", &mut xs.x87.registers[6].bytes, 16, 0),
            St7 => reg_at("st7", &mut xs.x87.registers[7].bytes, 16, 0),

            Cwd       => reg("cwd", &mut xs.x87.control_word),
            Swd       => reg("swd", &mut xs.x87.status_word),
            Ftw       => reg("ftw", &mut xs.x87.tag_word),
            Fop       => reg("fop", &mut xs.x87.opcode),
            Fip       => reg("fip", &mut xs.x87.inst_ptr),
            Fdp       => reg("fdp", &mut xs.x87.data_ptr),
            Mxcsr     => reg("mxcsr", &mut xs.simd.mxcsr),
            MxcsrMask => reg("mxcsr_mask", &mut xs.simd.mxcsr_mask),

            // MMX registers alias the low eight bytes of ST0-ST7.
            Mm0 => reg_at("mm0", &mut xs.x87.registers[0].bytes, 8, 0),
            Mm1 => reg_at("mm1", &mut xs.x87.registers[1].bytes, 8, 0),
            Mm2 => reg_at("mm2", &mut xs.x87.registers[2].bytes, 8, 0),
            Mm3 => reg_at("mm3", &mut xs.x87.registers[3].bytes, 8, 0),
            Mm4 => reg_at("mm4", &mut xs.x87.registers[4].bytes, 8, 0),
            Mm5 => reg_at("mm5", &mut xs.x87.registers[5].bytes, 8, 0),
            Mm6 => reg_at("mm6", &mut xs.x87.registers[6].bytes, 8, 0),
            Mm7 => reg_at("mm7", &mut xs.x87.registers[7].bytes, 8, 0),

            Xmm0  => reg_at("xmm0", &mut xs.simd.registers[0].bytes, 16, 0),
            Xmm1  => reg_at("xmm1", &mut xs.simd.registers[1].bytes, 16, 0),
            Xmm2  => reg_at("xmm2", &mut xs.simd.registers[2].bytes, 16, 0),
            Xmm3  => reg_at("xmm3", &mut xs.simd.registers[3].bytes, 16, 0),
            Xmm4  => reg_at("xmm4", &mut xs.simd.registers[4].bytes, 16, 0),
            Xmm5  => reg_at("xmm5", &mut xs.simd.registers[5].bytes, 16, 0),
            Xmm6  => reg_at("xmm6", &mut xs.simd.registers[6].bytes, 16, 0),
            Xmm7  => reg_at("xmm7", &mut xs.simd.registers[7].bytes, 16, 0),
            Xmm8  => reg_at("xmm8", &mut xs.simd.registers[8].bytes, 16, 0),
            Xmm9  => reg_at("xmm9", &mut xs.simd.registers[9].bytes, 16, 0),
            Xmm10 => reg_at("xmm10", &mut xs.simd.registers[10].bytes, 16, 0),
            Xmm11 => reg_at("xmm11", &mut xs.simd.registers[11].bytes, 16, 0),
            Xmm12 => reg_at("xmm12", &mut xs.simd.registers[12].bytes, 16, 0),
            Xmm13 => reg_at("xmm13", &mut xs.simd.registers[13].bytes, 16, 0),
            Xmm14 => reg_at("xmm14", &mut xs.simd.registers[14].bytes, 16, 0),
            Xmm15 => reg_at("xmm15", &mut xs.simd.registers[15].bytes, 16, 0),

            Ymm0  => reg_at("ymm0", &mut xs.simd.registers[0].bytes, 32, 0),
            Ymm1  => reg_at("ymm1", &mut xs.simd.registers[1].bytes, 32, 0),
            Ymm2  => reg_at("ymm2", &mut xs.simd.registers[2].bytes, 32, 0),
            Ymm3  => reg_at("ymm3", &mut xs.simd.registers[3].bytes, 32, 0),
            Ymm4  => reg_at("ymm4", &mut xs.simd.registers[4].bytes, 32, 0),
            Ymm5  => reg_at("ymm5", &mut xs.simd.registers[5].bytes, 32, 0),
            Ymm6  => reg_at("ymm6", &mut xs.simd.registers[6].bytes, 32, 0),
            Ymm7  => reg_at("ymm7", &mut xs.simd.registers[7].bytes, 32, 0),
            Ymm8  => reg_at("ymm8", &mut xs.simd.registers[8].bytes, 32, 0),
            Ymm9  => reg_at("ymm9", &mut xs.simd.registers[9].bytes, 32, 0),
            Ymm10 => reg_at("ymm10", &mut xs.simd.registers[10].bytes, 32, 0),
            Ymm11 => reg_at("ymm11", &mut xs.simd.registers[11].bytes, 32, 0),
            Ymm12 => reg_at("ymm12", &mut xs.simd.registers[12].bytes, 32, 0),
            Ymm13 => reg_at("ymm13", &mut xs.simd.registers[13].bytes, 32, 0),
            Ymm14 => reg_at("ymm14", &mut xs.simd.registers[14].bytes, 32, 0),
            Ymm15 => reg_at("ymm15", &mut xs.simd.registers[15].bytes, 32, 0),

            Zmm0  => reg_at("zmm0", &mut xs.simd.registers[0].bytes, 64, 0),
            Zmm1  => reg_at("zmm1", &mut xs.simd.registers[1].bytes, 64, 0),
            Zmm2  => reg_at("zmm2", &mut xs.simd.registers[2].bytes, 64, 0),
            Zmm3  => reg_at("zmm3", &mut xs.simd.registers[3].bytes, 64, 0),
            Zmm4  => reg_at("zmm4", &mut xs.simd.registers[4].bytes, 64, 0),
            Zmm5  => reg_at("zmm5", &mut xs.simd.registers[5].bytes, 64, 0),
            Zmm6  => reg_at("zmm6", &mut xs.simd.registers[6].bytes, 64, 0),
            Zmm7  => reg_at("zmm7", &mut xs.simd.registers[7].bytes, 64, 0),
            Zmm8  => reg_at("zmm8", &mut xs.simd.registers[8].bytes, 64, 0),
            Zmm9  => reg_at("zmm9", &mut xs.simd.registers[9].bytes, 64, 0),
            Zmm10 => reg_at("zmm10", &mut xs.simd.registers[10].bytes, 64, 0),
            Zmm11 => reg_at("zmm11", &mut xs.simd.registers[11].bytes, 64, 0),
            Zmm12 => reg_at("zmm12", &mut xs.simd.registers[12].bytes, 64, 0),
            Zmm13 => reg_at("zmm13", &mut xs.simd.registers[13].bytes, 64, 0),
            Zmm14 => reg_at("zmm14", &mut xs.simd.registers[14].bytes, 64, 0),
            Zmm15 => reg_at("zmm15", &mut xs.simd.registers[15].bytes, 64, 0),

            _ => {
                warn!(?id, "unknown register for this context");
                RegisterRef::invalid()
            }
        }
    }

    /// Populates the normalized extended state from the cached XSAVE image.
    pub(crate) fn load_xsave(&mut self) {
        let lanes = if self.is_64_bit { 16 } else { 8 };
        let area = &*self.xsave;
        let bv = area.xstate_bv;

        let x87 = &mut self.xstate.x87;
        if bv & XFEATURE_X87 != 0 {
            for (i, st) in x87.registers.iter_mut().enumerate() {
                st.bytes.copy_from_slice(&area.st_space[i * 16..(i + 1) * 16]);
            }
            x87.control_word = area.cwd;
            x87.status_word = area.swd;
            x87.tag_word = area.ftw;
            x87.opcode = area.fop;
            x87.inst_ptr = area.fip;
            x87.data_ptr = area.fdp;
            x87.filled = true;
        } else {
            // The control word is architecturally defined even when the x87
            // state is in its init configuration.
            *x87 = X87State::default();
            x87.control_word = area.cwd;
        }

        let simd = &mut self.xstate.simd;
        simd.registers = [SimdRegister::ZERO; 32];

        if bv & XFEATURE_SSE != 0 {
            for (i, slot) in simd.registers.iter_mut().take(lanes).enumerate() {
                slot.bytes[..16].copy_from_slice(&area.xmm_space[i * 16..(i + 1) * 16]);
            }
            simd.mxcsr = area.mxcsr;
            simd.mxcsr_mask = area.mxcsr_mask;
        } else {
            simd.mxcsr = MXCSR_DEFAULT;
            simd.mxcsr_mask = 0;
        }
        simd.sse_filled = true;

        simd.avx_filled = bv & XFEATURE_AVX != 0;
        if simd.avx_filled {
            for (i, slot) in simd.registers.iter_mut().take(lanes).enumerate() {
                slot.bytes[16..32]
                    .copy_from_slice(area.extended_region(XSAVE_YMM_HI128_OFFSET, i, 16));
            }
        }

        simd.zmm_filled = bv & XFEATURE_AVX512 == XFEATURE_AVX512;
        if simd.zmm_filled {
            for (i, slot) in simd.registers.iter_mut().take(lanes).enumerate() {
                slot.bytes[32..64]
                    .copy_from_slice(area.extended_region(XSAVE_ZMM_HI256_OFFSET, i, 32));
            }

            if self.is_64_bit {
                for i in 0..16 {
                    simd.registers[16 + i]
                        .bytes
                        .copy_from_slice(area.extended_region(XSAVE_HI16_ZMM_OFFSET, i, 64));
                }
            }
        }
    }

    /// Re-encodes the populated parts of the normalized state into an XSAVE
    /// image, starting from the cached one so unmodeled portions survive a
    /// write-back untouched.
    pub(crate) fn encoded_xsave(&self) -> XSaveArea {
        let lanes = if self.is_64_bit { 16 } else { 8 };
        let mut area = *self.xsave;
        let mut bv =
            area.xstate_bv & !(XFEATURE_X87 | XFEATURE_SSE | XFEATURE_AVX | XFEATURE_AVX512);

        let x87 = &self.xstate.x87;
        if x87.filled {
            for (i, st) in x87.registers.iter().enumerate() {
                area.st_space[i * 16..(i + 1) * 16].copy_from_slice(&st.bytes);
            }
            area.cwd = x87.control_word;
            area.swd = x87.status_word;
            area.ftw = x87.tag_word;
            area.fop = x87.opcode;
            area.fip = x87.inst_ptr;
            area.fdp = x87.data_ptr;
            bv |= XFEATURE_X87;
        }

        let simd = &self.xstate.simd;
        if simd.sse_filled {
            for (i, slot) in simd.registers.iter().take(lanes).enumerate() {
                area.xmm_space[i * 16..(i + 1) * 16].copy_from_slice(&slot.bytes[..16]);
            }
            area.mxcsr = simd.mxcsr;
            area.mxcsr_mask = simd.mxcsr_mask;
            bv |= XFEATURE_SSE;
        }

        if simd.avx_filled {
            for (i, slot) in simd.registers.iter().take(lanes).enumerate() {
                area.extended_region_mut(XSAVE_YMM_HI128_OFFSET, i, 16)
                    .copy_from_slice(&slot.bytes[16..32]);
            }
            bv |= XFEATURE_AVX;
        }

        if simd.zmm_filled {
            for (i, slot) in simd.registers.iter().take(lanes).enumerate() {
                area.extended_region_mut(XSAVE_ZMM_HI256_OFFSET, i, 32)
                    .copy_from_slice(&slot.bytes[32..64]);
            }
            if self.is_64_bit {
                for i in 0..16 {
                    area.extended_region_mut(XSAVE_HI16_ZMM_OFFSET, i, 64)
                        .copy_from_slice(&simd.registers[16 + i].bytes);
                }
            }
            bv |= XFEATURE_AVX512;
        }

        area.xstate_bv = bv;
        // Standard-format image only.
        area.xcomp_bv = 0;

        area
    }

    /// Pretty-prints the context to stdout.
    pub fn dump(&mut self) {
        use RegisterId::*;

        if self.is_64_bit() {
            println!(
                "RIP: {:016x} RFL: {:016x}",
                self.get(Rip).read::<u64>(),
                self.get(Rflags).read::<u64>()
            );
            println!(
                "RSP: {:016x} R8 : {:016x}",
                self.get(Rsp).read::<u64>(),
                self.get(R8).read::<u64>()
            );
            println!(
                "RBP: {:016x} R9 : {:016x}",
                self.get(Rbp).read::<u64>(),
                self.get(R9).read::<u64>()
            );
            println!(
                "RAX: {:016x} R10: {:016x}",
                self.get(Rax).read::<u64>(),
                self.get(R10).read::<u64>()
            );
            println!(
                "RBX: {:016x} R11: {:016x}",
                self.get(Rbx).read::<u64>(),
                self.get(R11).read::<u64>()
            );
            println!(
                "RCX: {:016x} R12: {:016x}",
                self.get(Rcx).read::<u64>(),
                self.get(R12).read::<u64>()
            );
            println!(
                "RDX: {:016x} R13: {:016x}",
                self.get(Rdx).read::<u64>(),
                self.get(R13).read::<u64>()
            );
            println!(
                "RSI: {:016x} R14: {:016x}",
                self.get(Rsi).read::<u64>(),
                self.get(R14).read::<u64>()
            );
            println!(
                "RDI: {:016x} R15: {:016x}",
                self.get(Rdi).read::<u64>(),
                self.get(R15).read::<u64>()
            );
            println!(
                "CS: {:04x} SS : {:04x} FS_BASE: {:016x}",
                self.get(Cs).read::<u16>(),
                self.get(Ss).read::<u16>(),
                self.get(FsBase).read::<u64>()
            );
            println!(
                "DS: {:04x} ES : {:04x} GS_BASE: {:016x}",
                self.get(Ds).read::<u16>(),
                self.get(Es).read::<u16>(),
                self.get(GsBase).read::<u64>()
            );
            println!(
                "FS: {:04x} GS : {:04x}",
                self.get(Fs).read::<u16>(),
                self.get(Gs).read::<u16>()
            );
        } else {
            println!(
                "EIP: {:08x} EFL: {:08x}",
                self.get(Eip).read::<u32>(),
                self.get(Eflags).read::<u32>()
            );
            println!(
                "ESP: {:08x} EBP: {:08x}",
                self.get(Esp).read::<u32>(),
                self.get(Ebp).read::<u32>()
            );
            println!(
                "EAX: {:08x} EBX: {:08x}",
                self.get(Eax).read::<u32>(),
                self.get(Ebx).read::<u32>()
            );
            println!(
                "ECX: {:08x} EDX: {:08x}",
                self.get(Ecx).read::<u32>(),
                self.get(Edx).read::<u32>()
            );
            println!(
                "ESI: {:08x} EDI: {:08x}",
                self.get(Esi).read::<u32>(),
                self.get(Edi).read::<u32>()
            );
            println!(
                "CS: {:04x} SS : {:04x} FS_BASE: {:08x}",
                self.get(Cs).read::<u16>(),
                self.get(Ss).read::<u16>(),
                self.get(FsBase).read::<u32>()
            );
            println!(
                "DS: {:04x} ES : {:04x} GS_BASE: {:08x}",
                self.get(Ds).read::<u16>(),
                self.get(Es).read::<u16>(),
                self.get(GsBase).read::<u32>()
            );
            println!(
                "FS: {:04x} GS : {:04x}",
                self.get(Fs).read::<u16>(),
                self.get(Gs).read::<u16>()
            );
        }

        let lanes = if self.is_64_bit() { 16 } else { 8 };
        let simd = &self.xstate.simd;

        if simd.sse_filled {
            println!("XSTATE SSE registers:");
            for (n, slot) in simd.registers.iter().take(lanes).enumerate() {
                print!("XMM{n:02}: ");
                for byte in &slot.bytes[..16] {
                    print!("{byte:02x}");
                }
                println!();
            }
        }

        if simd.avx_filled {
            println!("XSTATE AVX registers:");
            for (n, slot) in simd.registers.iter().take(lanes).enumerate() {
                print!("YMM{n:02}: ");
                for byte in &slot.bytes[..32] {
                    print!("{byte:02x}");
                }
                println!();
            }
        }

        if self.is_64_bit() && simd.zmm_filled {
            println!("XSTATE ZMM registers:");
            for (n, slot) in simd.registers.iter().enumerate() {
                print!("ZMM{n:02}: ");
                for byte in &slot.bytes {
                    print!("{byte:02x}");
                }
                println!();
            }
        }
    }
}

/// Compares the modeled state: general-purpose layout, debug registers, and
/// the normalized extended state. The raw XSAVE cache is ignored.
impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.is_64_bit == other.is_64_bit
            && self.gp == other.gp
            && self.dr == other.dr
            && self.xstate == other.xstate
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("is_64_bit", &self.is_64_bit)
            .field("gp", &self.gp)
            .field("dr", &self.dr)
            .field("xstate", &self.xstate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{XSAVE_EXTENDED_OFFSET, XSAVE_SIZE};

    fn context_64() -> Context {
        Context::new(true)
    }

    #[test]
    fn xsave_decode_sets_prefix_flags() {
        let mut ctx = context_64();
        ctx.xsave.xstate_bv = XFEATURE_X87 | XFEATURE_SSE | XFEATURE_AVX;
        ctx.load_xsave();

        let simd = &ctx.extended_state().simd;
        assert!(simd.sse_filled);
        assert!(simd.avx_filled);
        assert!(!simd.zmm_filled);
        assert!(ctx.extended_state().x87.filled);
    }

    #[test]
    fn xsave_decode_defaults_mxcsr_without_sse() {
        let mut ctx = context_64();
        ctx.xsave.xstate_bv = 0;
        ctx.xsave.cwd = 0x037f;
        ctx.load_xsave();

        let xs = ctx.extended_state();
        assert!(xs.simd.sse_filled);
        assert_eq!(xs.simd.mxcsr, MXCSR_DEFAULT);
        assert!(!xs.x87.filled);
        assert_eq!(xs.x87.control_word, 0x037f);
        assert!(xs.simd.registers.iter().all(|r| r.bytes == [0; 64]));
    }

    #[test]
    fn xsave_decode_assembles_full_zmm_values() {
        let mut ctx = context_64();
        let area = &mut ctx.xsave;
        area.xstate_bv = XFEATURE_X87 | XFEATURE_SSE | XFEATURE_AVX | XFEATURE_AVX512;

        // Lane 3: distinct fill per 16-byte quarter.
        area.xmm_space[3 * 16..4 * 16].fill(0x11);
        area.extended_region_mut(XSAVE_YMM_HI128_OFFSET, 3, 16).fill(0x22);
        area.extended_region_mut(XSAVE_ZMM_HI256_OFFSET, 3, 32).fill(0x33);
        // Lane 20 comes straight from the Hi16_ZMM component.
        area.extended_region_mut(XSAVE_HI16_ZMM_OFFSET, 4, 64).fill(0x44);

        ctx.load_xsave();

        let simd = &ctx.extended_state().simd;
        assert!(simd.zmm_filled);

        let lane3 = &simd.registers[3].bytes;
        assert_eq!(&lane3[..16], &[0x11; 16]);
        assert_eq!(&lane3[16..32], &[0x22; 16]);
        assert_eq!(&lane3[32..64], &[0x33; 32]);

        assert_eq!(simd.registers[20].bytes, [0x44; 64]);
    }

    #[test]
    fn xsave_decode_zeroes_high_lanes_for_32_bit_targets() {
        let mut ctx = Context::new(false);
        let area = &mut ctx.xsave;
        area.xstate_bv = XFEATURE_SSE;
        area.xmm_space.fill(0x55);

        ctx.load_xsave();

        let simd = &ctx.extended_state().simd;
        assert_eq!(&simd.registers[7].bytes[..16], &[0x55; 16]);
        assert!(simd.registers[8..].iter().all(|r| r.bytes == [0; 64]));
    }

    #[test]
    fn xsave_roundtrips_through_encode() {
        let mut ctx = context_64();
        {
            let area = &mut ctx.xsave;
            area.xstate_bv = XFEATURE_X87 | XFEATURE_SSE | XFEATURE_AVX | XFEATURE_AVX512;
            area.mxcsr = 0x1fa0;
            area.cwd = 0x037f;
            for (i, byte) in (0..XSAVE_SIZE - XSAVE_EXTENDED_OFFSET).zip((0..=255u8).cycle()) {
                area.extended[i] = byte;
            }
            area.st_space.fill(0xaa);
            area.xmm_space.fill(0xbb);
        }
        ctx.load_xsave();

        let encoded = ctx.encoded_xsave();
        assert_eq!(encoded.xstate_bv, ctx.xsave.xstate_bv);
        assert_eq!(encoded.mxcsr, 0x1fa0);
        assert_eq!(encoded.cwd, 0x037f);
        assert_eq!(encoded.st_space, ctx.xsave.st_space);
        assert_eq!(encoded.xmm_space, ctx.xsave.xmm_space);
        assert_eq!(encoded.extended, ctx.xsave.extended);
        assert_eq!(encoded.xcomp_bv, 0);
    }

    #[test]
    fn register_arithmetic_wraps_per_width() {
        let mut ctx = context_64();
        ctx.get(RegisterId::Ax).write(0xffffu16);

        let mut ax = ctx.get(RegisterId::Ax);
        ax += 1;
        assert_eq!(ax.read::<u16>(), 0);

        // The wrap stayed within the 16-bit view.
        assert_eq!(ctx.get(RegisterId::Rax).read::<u64>(), 0);
    }
}
