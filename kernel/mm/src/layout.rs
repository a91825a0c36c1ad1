//! Address-space windows and tree geometry.
//!
//! An [`AspaceConfig`] names the window of virtual addresses an address
//! space may map, the span of its tree (`size_shift`), the translation
//! granule (`page_shift`), and the TLB scope its leaves are tagged with.
//! [`AspaceConfig::kernel`] and [`AspaceConfig::user`] give the standard
//! windows for each architecture.

use radix_core::addr::VirtAddr;
use radix_core::mm::PAGE_SHIFT;

use crate::MmuError;
use crate::codec::{Level, MAX_LEVELS, PagingArch};
use crate::mapper::TlbScope;

/// Default tree span: 48-bit virtual addresses.
pub const DEFAULT_SIZE_SHIFT: u32 = 48;

/// Default granule: 4 KiB.
pub const DEFAULT_PAGE_SHIFT: u32 = PAGE_SHIFT;

/// Configuration of one address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspaceConfig {
    /// First virtual address of the window.
    pub base: VirtAddr,
    /// Window size in bytes.
    pub size: u64,
    /// log2 of the virtual span translated by the tree.
    pub size_shift: u32,
    /// log2 of the translation granule.
    pub page_shift: u32,
    /// Scope of the leaves (global for the kernel, an ASID for user spaces).
    pub scope: TlbScope,
}

/// Geometry derived from a validated [`AspaceConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Level of the root table.
    pub top: Level,
    /// Entries in the root table.
    pub root_entries: usize,
    /// Number of levels from root to leaf tables.
    pub levels: usize,
}

impl AspaceConfig {
    /// The architecture's kernel window, shared by all address spaces.
    pub const fn kernel<A: PagingArch>() -> Self {
        Self {
            base: VirtAddr::new(A::KERNEL_BASE),
            size: A::KERNEL_SIZE,
            size_shift: DEFAULT_SIZE_SHIFT,
            page_shift: DEFAULT_PAGE_SHIFT,
            scope: TlbScope::Global,
        }
    }

    /// The architecture's user window, tagged with `asid`.
    pub const fn user<A: PagingArch>(asid: u16) -> Self {
        Self {
            base: VirtAddr::new(A::USER_BASE),
            size: A::USER_SIZE,
            size_shift: DEFAULT_SIZE_SHIFT,
            page_shift: DEFAULT_PAGE_SHIFT,
            scope: TlbScope::Asid(asid),
        }
    }

    /// Returns the page size in bytes.
    pub const fn page_size(&self) -> u64 {
        1 << self.page_shift
    }

    /// Mask selecting the address bits resolved by the tree.
    pub const fn span_mask(&self) -> u64 {
        (1 << self.size_shift) - 1
    }

    /// Checks the configuration against `A` and derives its geometry.
    ///
    /// # Errors
    ///
    /// - [`MmuError::NotSupported`] if the hardware cannot walk this
    ///   granule and span.
    /// - [`MmuError::InvalidArgs`] if the window is empty, misaligned, or
    ///   not contained in a single tree span.
    pub fn validate<A: PagingArch>(&self) -> Result<Geometry, MmuError> {
        if !A::supports_geometry(self.page_shift, self.size_shift) {
            return Err(MmuError::NotSupported);
        }

        let page_size = self.page_size();
        if self.size == 0
            || self.size > 1 << self.size_shift
            || !self.base.is_aligned(page_size)
            || self.size & (page_size - 1) != 0
        {
            return Err(MmuError::InvalidArgs);
        }
        let Some(last) = self.base.as_u64().checked_add(self.size - 1) else {
            return Err(MmuError::InvalidArgs);
        };
        if self.base.as_u64() & !self.span_mask() != last & !self.span_mask()
            || !A::check_vaddr(self.base)
            || !A::check_vaddr(VirtAddr::new(last))
        {
            return Err(MmuError::InvalidArgs);
        }

        let geometry = top_level(self.size_shift, self.page_shift);
        if geometry.levels > MAX_LEVELS {
            return Err(MmuError::NotSupported);
        }
        Ok(geometry)
    }
}

/// Derives the root level: the largest level shift strictly below
/// `size_shift`, with `1 << (size_shift - shift)` root entries.
pub const fn top_level(size_shift: u32, page_shift: u32) -> Geometry {
    let bits = page_shift - 3;
    let mut shift = page_shift;
    let mut levels = 1;
    while shift + bits < size_shift {
        shift += bits;
        levels += 1;
    }
    Geometry {
        top: Level::new(shift, page_shift),
        root_entries: 1 << (size_shift - shift),
        levels,
    }
}
