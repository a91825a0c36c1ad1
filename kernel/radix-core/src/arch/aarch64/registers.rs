//! EL1 system registers used by the MMU layer.

use core::arch::asm;

/// `MAIR_EL1`, the memory attribute indirection register.
pub struct Mair;

impl Mair {
    /// Writes `value`.
    ///
    /// # Safety
    ///
    /// Every live mapping's `AttrIndx` must keep referring to a compatible
    /// attribute after the write.
    #[inline]
    pub unsafe fn write(value: u64) {
        unsafe {
            asm!("msr mair_el1, {}", "isb", in(reg) value, options(nostack, preserves_flags));
        }
    }
}

/// `TTBR0_EL1`, the lower-half translation table base.
pub struct Ttbr0;

impl Ttbr0 {
    /// Writes `value` (table base and ASID) and synchronizes.
    ///
    /// # Safety
    ///
    /// `value` must reference a valid root table whose kernel mappings
    /// cover the code currently executing.
    #[inline]
    pub unsafe fn write(value: u64) {
        unsafe {
            asm!("msr ttbr0_el1, {}", "isb", in(reg) value, options(nostack, preserves_flags));
        }
    }
}
