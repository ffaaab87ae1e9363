//! Raw x86/x86-64 register layouts and the XSAVE serialization format.
//!
//! The structs here mirror the kernel's exported layouts byte for byte, so
//! they can be handed directly to `PTRACE_GETREGSET`/`PTRACE_SETREGSET` via an
//! `iovec`. The kernel discriminates a 32-bit tracee from a 64-bit one by the
//! `iov_len` it reports back, which is why both layouts exist regardless of
//! the architecture this crate is compiled for.

/// Linux constant defined in `include/uapi/linux/elf.h`.
pub(crate) const NT_PRSTATUS: libc::c_int = 0x1;

/// Regset note for the full XSAVE image, `include/uapi/linux/elf.h`.
pub(crate) const NT_X86_XSTATE: libc::c_int = 0x202;

/// General-purpose registers of a 32-bit task.
///
/// Mirrors the i386 `user_regs_struct` in `sys/user.h`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Regs32 {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// General-purpose registers of a 64-bit task.
///
/// Mirrors the x86-64 `user_regs_struct` in `sys/user.h`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Regs64 {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

const _: () = assert!(std::mem::size_of::<Regs32>() == 68);
const _: () = assert!(std::mem::size_of::<Regs64>() == 216);

/// The standard-format XSAVE image the kernel serializes extended state into.
///
/// Legacy FXSAVE region, then the XSAVE header, then the extended area. The
/// sub-region offsets are architectural and fixed.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub(crate) struct XSaveArea {
    pub cwd: u16,
    pub swd: u16,
    pub ftw: u16,
    pub fop: u16,
    pub fip: u64,
    pub fdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    /// 8 x87 registers, 16 bytes of storage each.
    pub st_space: [u8; 128],
    /// 16 XMM registers, 16 bytes each, present regardless of target bitness.
    pub xmm_space: [u8; 256],
    pub reserved: [u8; 48],
    /// Software-usable bytes; `xcr0` occupies the first eight.
    pub sw_usable: [u8; 48],
    pub xstate_bv: u64,
    pub xcomp_bv: u64,
    pub header_reserved: [u8; 48],
    /// Extended area, starting at byte [`XSAVE_EXTENDED_OFFSET`].
    pub extended: [u8; XSAVE_SIZE - XSAVE_EXTENDED_OFFSET],
    /// Headroom for components past AVX-512 (PKRU and friends). Preserved
    /// verbatim across a fetch/store cycle; a store must hand the kernel the
    /// exact user-xstate size it reported on fetch.
    pub tail: [u8; XSAVE_BUFFER_SIZE - XSAVE_SIZE],
}

/// Size of the modeled portion of the image (through Hi16_ZMM).
pub(crate) const XSAVE_SIZE: usize = 2688;

/// Size of the buffer exchanged with the kernel.
pub(crate) const XSAVE_BUFFER_SIZE: usize = 4096;

/// Byte offset of the extended area (legacy region + XSAVE header).
pub(crate) const XSAVE_EXTENDED_OFFSET: usize = 576;

/// Upper 128 bits of YMM0..YMM15, 16 bytes per register.
pub(crate) const XSAVE_YMM_HI128_OFFSET: usize = 576;

/// Upper 256 bits of ZMM0..ZMM15, 32 bytes per register.
pub(crate) const XSAVE_ZMM_HI256_OFFSET: usize = 1152;

/// ZMM16..ZMM31 in full, 64 bytes per register.
pub(crate) const XSAVE_HI16_ZMM_OFFSET: usize = 1664;

/// `xstate_bv` feature bits, Intel SDM Vol. 1, 13.1.
pub(crate) const XFEATURE_X87: u64 = 1 << 0;
pub(crate) const XFEATURE_SSE: u64 = 1 << 1;
pub(crate) const XFEATURE_AVX: u64 = 1 << 2;
pub(crate) const XFEATURE_OPMASK: u64 = 1 << 5;
pub(crate) const XFEATURE_ZMM_HI256: u64 = 1 << 6;
pub(crate) const XFEATURE_HI16_ZMM: u64 = 1 << 7;
pub(crate) const XFEATURE_AVX512: u64 = XFEATURE_OPMASK | XFEATURE_ZMM_HI256 | XFEATURE_HI16_ZMM;

/// Architectural reset value of MXCSR.
pub(crate) const MXCSR_DEFAULT: u32 = 0x1f80;

const _: () = assert!(std::mem::size_of::<XSaveArea>() == XSAVE_BUFFER_SIZE);
const _: () = assert!(std::mem::offset_of!(XSaveArea, st_space) == 32);
const _: () = assert!(std::mem::offset_of!(XSaveArea, xmm_space) == 160);
const _: () = assert!(std::mem::offset_of!(XSaveArea, sw_usable) == 464);
const _: () = assert!(std::mem::offset_of!(XSaveArea, xstate_bv) == 512);
const _: () = assert!(std::mem::offset_of!(XSaveArea, extended) == XSAVE_EXTENDED_OFFSET);

impl XSaveArea {
    pub(crate) fn zeroed() -> Self {
        // SAFETY: every field is plain old data; all-zero is a valid image.
        unsafe { std::mem::zeroed() }
    }

    /// Slice of the extended area belonging to one register of one feature.
    pub(crate) fn extended_region(&self, base: usize, index: usize, width: usize) -> &[u8] {
        let start = base - XSAVE_EXTENDED_OFFSET + index * width;
        &self.extended[start..start + width]
    }

    pub(crate) fn extended_region_mut(
        &mut self,
        base: usize,
        index: usize,
        width: usize,
    ) -> &mut [u8] {
        let start = base - XSAVE_EXTENDED_OFFSET + index * width;
        &mut self.extended[start..start + width]
    }
}

/// Offset of `u_debugreg[0]` in the virtual `user` struct.
///
/// Debug registers are only reachable through `PEEKUSER`/`POKEUSER`; the
/// kernel interprets these offsets itself rather than dereferencing them.
pub(crate) fn debugreg_user_offset(index: usize) -> u64 {
    let word = std::mem::size_of::<libc::c_ulong>() as u64;
    memoffset::offset_of!(libc::user, u_debugreg) as u64 + word * index as u64
}

/// Offset of the instruction pointer in the virtual `user` struct.
#[cfg(target_arch = "x86_64")]
pub(crate) fn ip_user_offset() -> u64 {
    (memoffset::offset_of!(libc::user, regs) + memoffset::offset_of!(libc::user_regs_struct, rip))
        as u64
}

#[cfg(target_arch = "x86")]
pub(crate) fn ip_user_offset() -> u64 {
    (memoffset::offset_of!(libc::user, regs) + memoffset::offset_of!(libc::user_regs_struct, eip))
        as u64
}
