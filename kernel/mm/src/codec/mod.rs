//! Descriptor codecs.
//!
//! A [`PagingArch`] describes one architecture's translation-table format:
//! how neutral [`MmuFlags`] become attribute bits, how a raw entry is
//! classified at a given level, and which geometries the hardware accepts.
//! The walker is generic over it and never inspects raw bits itself.

pub mod aarch64;
pub mod x86_64;

use radix_core::addr::{PhysAddr, VirtAddr};
use radix_core::kfatal;

use crate::MmuError;
use crate::mapper::{MmuFlags, TlbScope};

pub use self::aarch64::Aarch64;
pub use self::x86_64::X86_64;

/// Largest index shift at which any supported architecture allows a block
/// (large page) descriptor.
pub const BLOCK_MAX_SHIFT: u32 = 30;

/// Upper bound on table levels for every supported geometry.
pub const MAX_LEVELS: usize = 4;

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// Position in the tree, identified by the index shift of the table being
/// looked at.
///
/// Each entry of a table at this level spans `1 << index_shift` bytes of
/// virtual address space. The leaf (page) level has
/// `index_shift == page_shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    index_shift: u32,
    page_shift: u32,
}

impl Level {
    /// Creates a level.
    pub const fn new(index_shift: u32, page_shift: u32) -> Self {
        debug_assert!(index_shift >= page_shift);
        Self {
            index_shift,
            page_shift,
        }
    }

    /// The page (leaf table) level for `page_shift`.
    pub const fn page(page_shift: u32) -> Self {
        Self::new(page_shift, page_shift)
    }

    /// Bits of virtual address resolved below this entry.
    pub const fn index_shift(self) -> u32 {
        self.index_shift
    }

    /// The translation granule.
    pub const fn page_shift(self) -> u32 {
        self.page_shift
    }

    /// Returns `true` at the last level, where leaves are pages.
    pub const fn is_page_level(self) -> bool {
        self.index_shift == self.page_shift
    }

    /// Bytes spanned by one entry.
    pub const fn block_size(self) -> u64 {
        1 << self.index_shift
    }

    /// Bits of index per full-size table.
    pub const fn bits_per_level(self) -> u32 {
        self.page_shift - 3
    }

    /// The level one step closer to the leaves.
    pub const fn child(self) -> Self {
        debug_assert!(!self.is_page_level());
        Self::new(self.index_shift - self.bits_per_level(), self.page_shift)
    }

    /// Table index of `vaddr_rel`, an offset within this table's span.
    pub const fn index(self, vaddr_rel: u64) -> usize {
        (vaddr_rel >> self.index_shift) as usize
    }
}

// ---------------------------------------------------------------------------
// Descriptor classification
// ---------------------------------------------------------------------------

/// What a raw entry means at the level it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// No translation.
    Invalid,
    /// Points at a child table one level down.
    Table(PhysAddr),
    /// Terminates the walk with a block or page at this physical base.
    Leaf(PhysAddr),
    /// A pattern that is not legal at this level.
    Unrecognized,
}

/// One architecture's translation-table format.
pub trait PagingArch {
    /// Short name for log messages.
    const NAME: &'static str;

    /// Value of an invalid entry.
    const INVALID: u64 = 0;

    /// Widest translated virtual address range, in bits.
    const MAX_VA_BITS: u32 = 48;

    /// Base of the kernel window.
    const KERNEL_BASE: u64;
    /// Size of the kernel window in bytes.
    const KERNEL_SIZE: u64;
    /// Base of the user window.
    const USER_BASE: u64;
    /// Size of the user window in bytes.
    const USER_SIZE: u64;

    /// Returns `true` if the hardware can walk a tree with this granule
    /// spanning `1 << size_shift` bytes.
    fn supports_geometry(page_shift: u32, size_shift: u32) -> bool;

    /// Largest index shift at which a leaf may be installed above the page
    /// level.
    fn block_max_shift() -> u32 {
        BLOCK_MAX_SHIFT
    }

    /// Returns `true` if `vaddr` is a well-formed address for this
    /// architecture.
    fn check_vaddr(vaddr: VirtAddr) -> bool;

    /// Returns `true` if `[paddr, paddr + size)` is addressable.
    fn check_paddr(paddr: PhysAddr, size: u64) -> bool;

    /// Translates neutral flags into leaf attribute bits.
    ///
    /// # Errors
    ///
    /// [`MmuError::InvalidFlags`] if the combination has no encoding.
    fn encode_attrs(flags: MmuFlags, scope: TlbScope) -> Result<u64, MmuError>;

    /// Recovers neutral flags from a leaf read at `level`.
    ///
    /// Panics on attribute patterns this layer never writes.
    fn decode_attrs(raw: u64, level: Level) -> MmuFlags;

    /// Classifies `raw` as read from a table at `level`.
    fn classify(raw: u64, level: Level) -> Descriptor;

    /// Builds a table descriptor for a child at `phys` that will hold
    /// leaves carrying `leaf_attrs`.
    fn table_descriptor(phys: PhysAddr, leaf_attrs: u64) -> u64;

    /// Builds a leaf for `phys` at `level`.
    fn leaf_descriptor(phys: PhysAddr, attrs: u64, level: Level) -> u64;

    /// Value loaded into the translation base register for a root at
    /// `root`.
    fn root_token(root: PhysAddr, scope: TlbScope) -> u64;
}

/// Halts on a descriptor the walker cannot interpret.
///
/// The tree is no longer trustworthy, so there is nothing safe to return.
#[cold]
#[track_caller]
pub(crate) fn corrupt_descriptor(arch: &str, raw: u64, level: Level, what: &str) -> ! {
    kfatal!(
        "{arch}: {what} in descriptor {raw:#018x} at index shift {}",
        level.index_shift()
    );
    panic!(
        "{arch}: {what} in descriptor {raw:#018x} at index shift {}",
        level.index_shift()
    );
}
