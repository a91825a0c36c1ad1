//! `arch_mmu_*` boundary functions.
//!
//! The VM layer calls these with raw addresses and page counts. They
//! validate the raw values into typed addresses and byte sizes and forward
//! to [`ArchAspace`].

use radix_core::addr::{PhysAddr, VirtAddr};

use crate::codec::PagingArch;
use crate::layout::AspaceConfig;
use crate::mapper::MmuFlags;
use crate::{ArchAspace, MmuError, PageSource};

/// Codec of the architecture this kernel runs on.
#[cfg(target_arch = "aarch64")]
pub type NativeArch = crate::codec::Aarch64;

/// Codec of the architecture this kernel runs on.
#[cfg(target_arch = "x86_64")]
pub type NativeArch = crate::codec::X86_64;

/// One-time MMU setup for the boot CPU.
///
/// Programs the control registers the codec relies on and registers the
/// native TLB invalidate hook. Must run before the first unmap of a live
/// mapping.
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
pub fn arch_mmu_init() {
    #[cfg(target_arch = "aarch64")]
    crate::codec::aarch64::init();
    #[cfg(target_arch = "x86_64")]
    crate::codec::x86_64::init();
}

/// Loads `aspace` as the current translation tree.
///
/// # Safety
///
/// The tree must map the code and data the CPU is executing, and `aspace`
/// must outlive its time on the CPU.
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
pub unsafe fn arch_mmu_context_switch<S: PageSource>(aspace: &ArchAspace<NativeArch, S>) {
    let token = aspace.root_token();
    radix_core::ktrace!("mmu: context switch to {token:#x}");
    // SAFETY: Guaranteed by the caller.
    unsafe { load_root(token) }
}

#[cfg(target_arch = "aarch64")]
unsafe fn load_root(token: u64) {
    use radix_core::arch::aarch64::registers::Ttbr0;

    // SAFETY: Guaranteed by `arch_mmu_context_switch`'s caller.
    unsafe { Ttbr0::write(token) };
}

#[cfg(target_arch = "x86_64")]
unsafe fn load_root(token: u64) {
    use radix_core::arch::x86_64::registers::Cr3;

    // SAFETY: Guaranteed by `arch_mmu_context_switch`'s caller.
    unsafe { Cr3::write_raw(token) };
}

/// Converts a page count into a byte size.
fn pages_to_bytes(count: usize, page_shift: u32) -> Result<u64, MmuError> {
    let count = u64::try_from(count).map_err(|_| MmuError::InvalidArgs)?;
    if count.leading_zeros() < page_shift {
        return Err(MmuError::InvalidArgs);
    }
    Ok(count << page_shift)
}

/// Creates an empty address space.
///
/// # Errors
///
/// See [`ArchAspace::new`].
pub fn arch_mmu_init_aspace<A: PagingArch, S: PageSource>(
    config: AspaceConfig,
    source: S,
) -> Result<ArchAspace<A, S>, MmuError> {
    ArchAspace::new(config, source)
}

/// Tears down `aspace`, freeing every table it allocated.
pub fn arch_mmu_destroy_aspace<A: PagingArch, S: PageSource>(aspace: ArchAspace<A, S>) {
    aspace.destroy();
}

/// Maps `count` pages at `vaddr` to `paddr`.
///
/// # Errors
///
/// [`MmuError::InvalidArgs`] if `paddr` is not a physical address or the
/// byte size overflows, otherwise as [`ArchAspace::map`].
pub fn arch_mmu_map<A: PagingArch, S: PageSource>(
    aspace: &mut ArchAspace<A, S>,
    vaddr: u64,
    paddr: u64,
    count: usize,
    flags: MmuFlags,
) -> Result<(), MmuError> {
    if count == 0 {
        return Ok(());
    }
    let paddr = PhysAddr::try_new(paddr).ok_or(MmuError::InvalidArgs)?;
    let size = pages_to_bytes(count, aspace.config().page_shift)?;
    aspace.map(VirtAddr::new(vaddr), paddr, size, flags)
}

/// Unmaps `count` pages at `vaddr`, returning how many were mapped.
///
/// # Errors
///
/// [`MmuError::InvalidArgs`] if the range is misaligned or leaves the
/// window.
pub fn arch_mmu_unmap<A: PagingArch, S: PageSource>(
    aspace: &mut ArchAspace<A, S>,
    vaddr: u64,
    count: usize,
) -> Result<usize, MmuError> {
    if count == 0 {
        return Ok(0);
    }
    let size = pages_to_bytes(count, aspace.config().page_shift)?;
    aspace.unmap(VirtAddr::new(vaddr), size)
}

/// Looks up the translation of `vaddr`.
///
/// # Errors
///
/// As [`ArchAspace::query`].
pub fn arch_mmu_query<A: PagingArch, S: PageSource>(
    aspace: &ArchAspace<A, S>,
    vaddr: u64,
) -> Result<(PhysAddr, MmuFlags), MmuError> {
    aspace.query(VirtAddr::new(vaddr))
}
