//! Native instruction and register wrappers.
//!
//! Only the module for the architecture being compiled for exists. The
//! barrier pair below is portable so the table walker can order its stores
//! the same way on every target, including the host running unit tests.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Orders prior table stores before any later store that publishes them.
///
/// Issued between zero-filling a new table and writing the descriptor that
/// links it, and between clearing a table descriptor and freeing the table.
#[inline]
pub fn table_store_barrier() {
    #[cfg(target_arch = "aarch64")]
    aarch64::instructions::dmb_ishst();

    // Stores are not reordered with other stores on x86_64.
    #[cfg(target_arch = "x86_64")]
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::Release);

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
}

/// Waits until every prior table write and TLB invalidation has completed.
///
/// Issued at the end of a map or unmap so the caller can touch the range
/// immediately on the same core.
#[inline]
pub fn completion_barrier() {
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::instructions::dsb_sy();
        aarch64::instructions::isb();
    }

    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
