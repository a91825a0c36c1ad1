//! Translation table storage.
//!
//! [`TableHandle`] is the only way the walker touches table memory: it pairs
//! a table's physical address with its physmap view and bounds-checks every
//! entry access. [`allocate_table`] and [`free_table`] adapt a
//! [`PageSource`] to table-sized allocations.

use radix_core::addr::{PhysAddr, VirtAddr};
use radix_core::arch::table_store_barrier;
use radix_core::mm::PAGE_SIZE;
use radix_core::{kerr, ktrace};

use crate::{MmuError, PageSource, Physmap};

/// Size of one table entry in bytes.
pub const ENTRY_SIZE: usize = 8;

/// A translation table owned by the tree.
///
/// Copies alias the same memory. Ownership follows the tree: a table is
/// owned by the single parent entry that points at it, or by the address
/// space for the root.
#[derive(Debug, Clone, Copy)]
pub struct TableHandle {
    phys: PhysAddr,
    virt: VirtAddr,
    entries: usize,
}

impl TableHandle {
    /// Wraps an existing table.
    ///
    /// # Safety
    ///
    /// `phys` must be the base of a live table of `entries` entries that is
    /// reachable through `physmap` and not accessed concurrently except
    /// through the hardware walker.
    pub unsafe fn from_phys(physmap: Physmap, phys: PhysAddr, entries: usize) -> Self {
        Self {
            phys,
            virt: physmap.phys_to_virt(phys),
            entries,
        }
    }

    /// Physical base of the table.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Number of entries.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Size of the table in bytes.
    pub fn size(&self) -> usize {
        self.entries * ENTRY_SIZE
    }

    /// Reads entry `index`.
    #[inline]
    pub fn read(&self, index: usize) -> u64 {
        assert!(
            index < self.entries,
            "table index {index} out of range ({} entries)",
            self.entries
        );
        // SAFETY: `from_phys` guarantees `entries` valid entries at `virt`,
        // and `index` was bounds-checked above.
        unsafe { self.virt.as_mut_ptr::<u64>().add(index).read_volatile() }
    }

    /// Writes entry `index`.
    #[inline]
    pub fn write(&self, index: usize, value: u64) {
        assert!(
            index < self.entries,
            "table index {index} out of range ({} entries)",
            self.entries
        );
        // SAFETY: As for `read`. Volatile so the store is not elided or torn
        // into narrower writes the hardware walker could observe.
        unsafe { self.virt.as_mut_ptr::<u64>().add(index).write_volatile(value) }
    }

    /// Returns `true` if every entry equals `invalid`.
    pub fn is_clear(&self, invalid: u64) -> bool {
        (0..self.entries).all(|i| self.read(i) == invalid)
    }
}

/// Allocates a zeroed table of `size` bytes.
///
/// Tables of at least a page come from the page allocator; smaller ones
/// from the heap, with their physical address recovered through the
/// physmap. A store barrier separates the zero fill from the caller's
/// publishing write.
///
/// # Errors
///
/// [`MmuError::NoMemory`] if the source is exhausted or returned memory
/// outside the physmap.
pub fn allocate_table<S: PageSource + ?Sized>(
    source: &mut S,
    size: usize,
) -> Result<TableHandle, MmuError> {
    debug_assert!(size.is_power_of_two() && size >= ENTRY_SIZE);
    let physmap = source.physmap();

    let (phys, virt) = if size >= PAGE_SIZE {
        let count = size / PAGE_SIZE;
        let Some(phys) = source.alloc_contiguous(count, size.trailing_zeros()) else {
            kerr!("mmu: failed to allocate {count} page(s) for a table");
            return Err(MmuError::NoMemory);
        };
        (phys, physmap.phys_to_virt(phys))
    } else {
        let Some(virt) = source.heap_alloc(size, size) else {
            kerr!("mmu: failed to allocate {size} byte table from heap");
            return Err(MmuError::NoMemory);
        };
        let Some(phys) = physmap.virt_to_phys(virt) else {
            kerr!("mmu: heap table {virt} is outside the physmap");
            // SAFETY: Just allocated and never published.
            unsafe { source.heap_free(virt, size, size) };
            return Err(MmuError::NoMemory);
        };
        (phys, virt)
    };

    // SAFETY: The source handed us `size` bytes at `virt` exclusively.
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, size) };
    table_store_barrier();

    ktrace!("mmu: allocated {size} byte table at {phys}");
    Ok(TableHandle {
        phys,
        virt,
        entries: size / ENTRY_SIZE,
    })
}

/// Returns a table's memory to the source it came from.
///
/// # Safety
///
/// No entry anywhere may still point at `table`, and a store barrier must
/// have ordered the unlinking write before this call.
pub unsafe fn free_table<S: PageSource + ?Sized>(source: &mut S, table: TableHandle) {
    let size = table.size();
    ktrace!("mmu: freeing {size} byte table at {}", table.phys);
    if size >= PAGE_SIZE {
        // SAFETY: Allocated by `allocate_table` with this count.
        unsafe { source.free_contiguous(table.phys, size / PAGE_SIZE) };
    } else {
        // SAFETY: Allocated by `allocate_table` from the heap.
        unsafe { source.heap_free(table.virt, size, size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockSource;

    #[test]
    fn page_table_is_zeroed() {
        let mut src = MockSource::new();
        let table = allocate_table(&mut src, PAGE_SIZE).unwrap();
        assert_eq!(table.entries(), 512);
        // The mock fills fresh memory with a poison pattern.
        assert!(table.is_clear(0));
        assert_eq!(src.page_allocs(), 1);
        unsafe { free_table(&mut src, table) };
        assert_eq!(src.page_frees(), 1);
        assert_eq!(src.live(), 0);
    }

    #[test]
    fn sub_page_table_uses_heap() {
        let mut src = MockSource::new();
        let table = allocate_table(&mut src, 512).unwrap();
        assert_eq!(table.entries(), 64);
        assert!(table.is_clear(0));
        assert!(table.phys().is_aligned(512));
        assert_eq!(src.heap_allocs(), 1);
        assert_eq!(src.page_allocs(), 0);
        unsafe { free_table(&mut src, table) };
        assert_eq!(src.heap_frees(), 1);
    }

    #[test]
    fn multi_page_table_is_contiguous_and_aligned() {
        let mut src = MockSource::new();
        let table = allocate_table(&mut src, 4 * PAGE_SIZE).unwrap();
        assert_eq!(table.entries(), 2048);
        assert!(table.phys().is_aligned(4 * PAGE_SIZE as u64));
        assert_eq!(src.last_request(), Some((4, 14)));
        unsafe { free_table(&mut src, table) };
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut src = MockSource::new();
        src.fail_after(0);
        assert_eq!(
            allocate_table(&mut src, PAGE_SIZE).map(|t| t.entries()),
            Err(MmuError::NoMemory)
        );
        assert_eq!(src.live(), 0);
    }

    #[test]
    fn read_write_entries() {
        let mut src = MockSource::new();
        let table = allocate_table(&mut src, PAGE_SIZE).unwrap();
        table.write(511, 0xdead_b003);
        assert_eq!(table.read(511), 0xdead_b003);
        assert!(!table.is_clear(0));
        table.write(511, 0);
        assert!(table.is_clear(0));
        unsafe { free_table(&mut src, table) };
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_index_panics() {
        let mut src = MockSource::new();
        let table = allocate_table(&mut src, 512).unwrap();
        let _ = table.read(64);
    }
}
