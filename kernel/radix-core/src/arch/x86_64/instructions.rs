//! TLB management instructions.

use core::arch::asm;

use crate::addr::VirtAddr;

/// Flushes the TLB entry for the given virtual address (INVLPG).
#[inline]
pub fn invlpg(addr: VirtAddr) {
    // SAFETY: INVLPG only invalidates a single TLB entry and has no other
    // side effects.
    unsafe {
        asm!(
            "invlpg [{}]",
            in(reg) addr.as_u64(),
            options(nostack, preserves_flags),
        );
    }
}
