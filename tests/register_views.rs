use grapple::{Context, RegisterId};
use pretty_assertions::assert_eq;

#[test]
fn sub_registers_view_the_same_storage() {
    let mut ctx = Context::new(true);

    ctx.get(RegisterId::Rax).write(0x1122_3344_5566_7788_u64);

    assert_eq!(ctx.get(RegisterId::Eax).read::<u32>(), 0x5566_7788);
    assert_eq!(ctx.get(RegisterId::Ax).read::<u16>(), 0x7788);
    assert_eq!(ctx.get(RegisterId::Al).read::<u8>(), 0x88);
    assert_eq!(ctx.get(RegisterId::Ah).read::<u8>(), 0x77);

    ctx.get(RegisterId::Ah).write(0xee_u8);
    assert_eq!(ctx.get(RegisterId::Rax).read::<u64>(), 0x1122_3344_5566_ee88);
}

#[test]
fn reads_zero_extend_and_truncate() {
    let mut ctx = Context::new(true);

    ctx.get(RegisterId::Ax).write(0xbeef_u16);

    // Narrow register into wide integer: zero-extended.
    assert_eq!(ctx.get(RegisterId::Ax).read::<u64>(), 0xbeef);
    assert_eq!(ctx.get(RegisterId::Ax).read::<u128>(), 0xbeef);

    // Wide register into narrow integer: low bytes.
    ctx.get(RegisterId::Rbx).write(0x1122_3344_5566_7788_u64);
    assert_eq!(ctx.get(RegisterId::Rbx).read::<u8>(), 0x88);
    assert_eq!(ctx.get(RegisterId::Rbx).read::<u16>(), 0x7788);
}

#[test]
fn assignment_zero_extends_into_the_slot() {
    let mut ctx = Context::new(true);

    ctx.get(RegisterId::Rcx).write(u64::MAX);
    ctx.get(RegisterId::Rcx).write(0x42_u8);

    assert_eq!(ctx.get(RegisterId::Rcx).read::<u64>(), 0x42);
}

#[test]
fn width_generic_aliases_track_the_layout() {
    let mut ctx = Context::new(true);

    ctx.get(RegisterId::Rip).write(0xdead_beef_u64);
    assert_eq!(ctx.get(RegisterId::Xip).read::<u64>(), 0xdead_beef);
    assert_eq!(ctx.get(RegisterId::Xip).name(), "rip");

    ctx.get(RegisterId::Xsp).write(0x7fff_0000_u64);
    assert_eq!(ctx.get(RegisterId::Rsp).read::<u64>(), 0x7fff_0000);
}

#[test]
fn invalid_registers_are_detectable() {
    let mut ctx = Context::new(true);

    let invalid = ctx.get(RegisterId::Invalid);
    assert!(!invalid.is_valid());
    assert_eq!(invalid.size(), 0);
    assert_eq!(invalid.read::<u64>(), 0);
}

#[test]
fn register_arithmetic_wraps() {
    let mut ctx = Context::new(true);

    ctx.get(RegisterId::Rdx).write(0_u64);
    let mut rdx = ctx.get(RegisterId::Rdx);
    rdx -= 1;
    assert_eq!(rdx.read::<u64>(), u64::MAX);

    let mut rdx = ctx.get(RegisterId::Rdx);
    rdx += 2;
    assert_eq!(ctx.get(RegisterId::Rdx).read::<u64>(), 1);
}

#[test]
#[should_panic(expected = "register arithmetic")]
fn register_arithmetic_rejects_simd_widths() {
    let mut ctx = Context::new(true);

    let mut xmm0 = ctx.get(RegisterId::Xmm0);
    xmm0 += 1;
}

#[test]
fn equality_is_byte_wise() {
    let mut left = Context::new(true);
    let mut right = Context::new(true);

    left.get(RegisterId::Rax).write(0xabcd_u64);
    right.get(RegisterId::Rax).write(0xabcd_u64);
    assert!(left.get(RegisterId::Rax) == right.get(RegisterId::Rax));

    right.get(RegisterId::Rax).write(0xabce_u64);
    assert!(left.get(RegisterId::Rax) != right.get(RegisterId::Rax));

    // Same bytes, different widths.
    left.get(RegisterId::Eax).write(0_u32);
    right.get(RegisterId::Ax).write(0_u16);
    assert!(left.get(RegisterId::Eax) != right.get(RegisterId::Ax));
}

#[test]
fn mmx_aliases_the_low_half_of_st() {
    let mut ctx = Context::new(true);

    ctx.get(RegisterId::St3).write(0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00_u128);
    assert_eq!(ctx.get(RegisterId::Mm3).size(), 8);
    assert_eq!(ctx.get(RegisterId::Mm3).read::<u64>(), 0x99aa_bbcc_ddee_ff00);

    ctx.get(RegisterId::Mm3).write(0_u64);
    assert_eq!(
        ctx.get(RegisterId::St3).read::<u128>(),
        0x1122_3344_5566_7788_0000_0000_0000_0000
    );
}

#[test]
fn simd_slots_are_always_64_bytes_wide() {
    let mut ctx = Context::new(true);

    assert_eq!(ctx.get(RegisterId::Xmm5).size(), 16);
    assert_eq!(ctx.get(RegisterId::Ymm5).size(), 32);
    assert_eq!(ctx.get(RegisterId::Zmm5).size(), 64);

    // An XMM-sized write leaves the upper lanes zero.
    ctx.get(RegisterId::Xmm5).write(u128::MAX);
    let zmm = ctx.get(RegisterId::Zmm5);
    assert_eq!(&zmm.bytes()[..16], &[0xff; 16]);
    assert_eq!(&zmm.bytes()[16..], &[0; 48]);
}
