//! Kernel page geometry.

/// Size of a physical page handed out by the page allocator.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;
