//! Hardware page-table management.
//!
//! Builds, walks, and tears down the radix-tree translation tables of
//! AArch64 (VMSAv8-64) and x86_64 (4-level paging) through one generic
//! walker. Each architecture contributes a [`codec::PagingArch`]
//! implementation describing its descriptor format; everything else
//! (chunking, block selection, table allocation and reclamation, rollback,
//! TLB maintenance) is shared.
//!
//! The crate never locks. Callers serialize mutation of a given address
//! space, typically behind the VM layer's per-aspace mutex.
//!
//! Memory for tables comes from a [`PageSource`], and tables are reached
//! through the kernel [`Physmap`].

#![cfg_attr(not(test), no_std)]

pub mod api;
pub mod aspace;
pub mod codec;
pub mod layout;
pub mod mapper;
pub mod table;
mod walker;

#[cfg(test)]
mod test_support;

use core::fmt;

use radix_core::addr::{PhysAddr, VirtAddr};

pub use aspace::ArchAspace;
pub use layout::AspaceConfig;
pub use mapper::{MmuFlags, TlbScope};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Page-table operation errors.
///
/// Descriptor corruption is not represented: it panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// Misaligned address or size, or an address outside the window.
    InvalidArgs,
    /// The flag combination has no encoding on this architecture.
    InvalidFlags,
    /// A table could not be allocated.
    NoMemory,
    /// The target range overlaps an existing mapping.
    AlreadyMapped,
    /// No mapping exists at the queried address.
    NotFound,
    /// The requested geometry is not supported by this architecture.
    NotSupported,
}

impl MmuError {
    /// Returns the kernel status code for this error.
    pub const fn status(self) -> i32 {
        match self {
            MmuError::InvalidArgs | MmuError::InvalidFlags => -8,
            MmuError::NoMemory => -5,
            MmuError::AlreadyMapped => -14,
            MmuError::NotFound => -2,
            MmuError::NotSupported => -24,
        }
    }
}

impl fmt::Display for MmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmuError::InvalidArgs => write!(f, "invalid address range"),
            MmuError::InvalidFlags => write!(f, "unsupported mapping flags"),
            MmuError::NoMemory => write!(f, "out of memory for page tables"),
            MmuError::AlreadyMapped => write!(f, "range already mapped"),
            MmuError::NotFound => write!(f, "address not mapped"),
            MmuError::NotSupported => write!(f, "unsupported table geometry"),
        }
    }
}

// ---------------------------------------------------------------------------
// Physmap
// ---------------------------------------------------------------------------

/// The kernel's permanent linear mapping of physical memory.
///
/// Every table this crate touches is reached as `offset + phys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Physmap {
    offset: u64,
}

impl Physmap {
    /// Creates a physmap based at `offset`.
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Returns the virtual base of the physmap.
    pub const fn offset(self) -> u64 {
        self.offset
    }

    /// Converts a physical address to its physmap virtual address.
    pub fn phys_to_virt(self, phys: PhysAddr) -> VirtAddr {
        let p = phys.as_u64();
        assert!(
            p <= u64::MAX - self.offset,
            "phys_to_virt: physical address {p:#x} overflows physmap (offset {:#x})",
            self.offset,
        );
        VirtAddr::new(self.offset + p)
    }

    /// Converts a physmap virtual address back to physical.
    ///
    /// Returns `None` if `virt` lies below the physmap.
    pub fn virt_to_phys(self, virt: VirtAddr) -> Option<PhysAddr> {
        virt.as_u64()
            .checked_sub(self.offset)
            .and_then(PhysAddr::try_new)
    }
}

// ---------------------------------------------------------------------------
// PageSource
// ---------------------------------------------------------------------------

/// Supplies the memory that backs translation tables.
///
/// Page-sized and larger tables come from the physical page allocator.
/// Tables smaller than a page (reduced-size roots) come from the kernel heap;
/// sources without a heap may keep the default heap methods, which fail.
///
/// # Safety
///
/// Implementations must return unique, properly aligned memory that is not
/// in use elsewhere and that is reachable through [`PageSource::physmap`].
pub unsafe trait PageSource {
    /// Allocates `count` contiguous pages aligned to `1 << align_shift`.
    fn alloc_contiguous(&mut self, count: usize, align_shift: u32) -> Option<PhysAddr>;

    /// Returns pages obtained from [`alloc_contiguous`](Self::alloc_contiguous).
    ///
    /// # Safety
    ///
    /// `base` and `count` must match a previous allocation that is no longer
    /// referenced by any table.
    unsafe fn free_contiguous(&mut self, base: PhysAddr, count: usize);

    /// Allocates `size` bytes from the kernel heap aligned to `align`.
    fn heap_alloc(&mut self, size: usize, align: usize) -> Option<VirtAddr> {
        let _ = (size, align);
        None
    }

    /// Returns memory obtained from [`heap_alloc`](Self::heap_alloc).
    ///
    /// # Safety
    ///
    /// `ptr`, `size` and `align` must match a previous heap allocation that
    /// is no longer referenced by any table.
    unsafe fn heap_free(&mut self, ptr: VirtAddr, size: usize, align: usize) {
        let _ = (ptr, size, align);
    }

    /// The physmap through which allocated tables are accessed.
    fn physmap(&self) -> Physmap;
}

// SAFETY: Forwards to the underlying source.
unsafe impl<T: PageSource + ?Sized> PageSource for &mut T {
    fn alloc_contiguous(&mut self, count: usize, align_shift: u32) -> Option<PhysAddr> {
        (**self).alloc_contiguous(count, align_shift)
    }

    unsafe fn free_contiguous(&mut self, base: PhysAddr, count: usize) {
        unsafe { (**self).free_contiguous(base, count) }
    }

    fn heap_alloc(&mut self, size: usize, align: usize) -> Option<VirtAddr> {
        (**self).heap_alloc(size, align)
    }

    unsafe fn heap_free(&mut self, ptr: VirtAddr, size: usize, align: usize) {
        unsafe { (**self).heap_free(ptr, size, align) }
    }

    fn physmap(&self) -> Physmap {
        (**self).physmap()
    }
}
