//! Barrier and TLB maintenance instructions.

use core::arch::asm;

/// Mask for the VA[55:12] field of a TLBI operand.
const TLBI_VA_MASK: u64 = 0x0000_0FFF_FFFF_FFFF;

/// `dmb ishst`: orders stores within the inner shareable domain.
#[inline]
pub fn dmb_ishst() {
    // SAFETY: A barrier has no effect besides memory ordering.
    unsafe { asm!("dmb ishst", options(nostack, preserves_flags)) };
}

/// `dsb sy`: waits for all prior memory accesses and maintenance to finish.
#[inline]
pub fn dsb_sy() {
    // SAFETY: A barrier has no effect besides memory ordering.
    unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
}

/// `isb`: flushes the pipeline so later instructions see new context.
#[inline]
pub fn isb() {
    // SAFETY: ISB only resynchronizes the instruction stream.
    unsafe { asm!("isb", options(nostack, preserves_flags)) };
}

/// `tlbi vaae1is`: invalidates `va` for every ASID, inner shareable.
#[inline]
pub fn tlbi_vaae1is(va: u64) {
    let operand = (va >> 12) & TLBI_VA_MASK;
    // SAFETY: TLB invalidation only drops cached translations.
    unsafe { asm!("tlbi vaae1is, {}", in(reg) operand, options(nostack, preserves_flags)) };
}

/// `tlbi vae1is`: invalidates `va` tagged with `asid`, inner shareable.
#[inline]
pub fn tlbi_vae1is(va: u64, asid: u16) {
    let operand = ((va >> 12) & TLBI_VA_MASK) | (u64::from(asid) << 48);
    // SAFETY: TLB invalidation only drops cached translations.
    unsafe { asm!("tlbi vae1is, {}", in(reg) operand, options(nostack, preserves_flags)) };
}
