//! Host-side stand-ins for the page allocator, heap and TLB.
//!
//! [`MockSource`] hands out real host memory with a physmap offset of zero,
//! so a "physical" address is simply the host pointer. Fresh memory is
//! filled with a poison pattern so tests notice tables that were not zeroed.

use std::alloc::{Layout, alloc, dealloc};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::vec::Vec;

use radix_core::addr::{PhysAddr, VirtAddr};
use radix_core::mm::PAGE_SIZE;

use crate::mapper::{TlbScope, register_tlb_invalidate};
use crate::{PageSource, Physmap};

const POISON: u8 = 0xA5;

/// A counting page source backed by the host allocator.
///
/// Counters use interior mutability so tests can inspect and steer the
/// source while an address space holds the `&mut` borrow.
pub struct MockSource {
    live: RefCell<BTreeMap<u64, Layout>>,
    page_allocs: Cell<usize>,
    page_frees: Cell<usize>,
    heap_allocs: Cell<usize>,
    heap_frees: Cell<usize>,
    remaining: Cell<usize>,
    last_request: Cell<Option<(usize, u32)>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            live: RefCell::new(BTreeMap::new()),
            page_allocs: Cell::new(0),
            page_frees: Cell::new(0),
            heap_allocs: Cell::new(0),
            heap_frees: Cell::new(0),
            remaining: Cell::new(usize::MAX),
            last_request: Cell::new(None),
        }
    }

    /// Successful page allocations so far.
    pub fn page_allocs(&self) -> usize {
        self.page_allocs.get()
    }

    pub fn page_frees(&self) -> usize {
        self.page_frees.get()
    }

    pub fn heap_allocs(&self) -> usize {
        self.heap_allocs.get()
    }

    pub fn heap_frees(&self) -> usize {
        self.heap_frees.get()
    }

    /// Allocations (of either kind) not yet returned.
    pub fn live(&self) -> usize {
        self.live.borrow().len()
    }

    /// Lets `n` more allocations succeed, then fails every one after.
    pub fn fail_after(&self, n: usize) {
        self.remaining.set(n);
    }

    /// `(count, align_shift)` of the most recent page request.
    pub fn last_request(&self) -> Option<(usize, u32)> {
        self.last_request.get()
    }

    fn take_budget(&self) -> bool {
        match self.remaining.get() {
            0 => false,
            usize::MAX => true,
            n => {
                self.remaining.set(n - 1);
                true
            }
        }
    }

    fn raw_alloc(&self, layout: Layout) -> Option<u64> {
        if !self.take_budget() {
            return None;
        }
        // SAFETY: Every layout used here has a non-zero size.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        // SAFETY: Freshly allocated with `layout.size()` bytes.
        unsafe { ptr.write_bytes(POISON, layout.size()) };
        let addr = ptr as u64;
        self.live.borrow_mut().insert(addr, layout);
        Some(addr)
    }

    fn raw_free(&self, addr: u64, layout: Layout) {
        let recorded = self.live.borrow_mut().remove(&addr);
        assert_eq!(recorded, Some(layout), "free of unknown block {addr:#x}");
        // SAFETY: Allocated by `raw_alloc` with this layout.
        unsafe { dealloc(addr as *mut u8, layout) };
    }
}

unsafe impl PageSource for MockSource {
    fn alloc_contiguous(&mut self, count: usize, align_shift: u32) -> Option<PhysAddr> {
        self.last_request.set(Some((count, align_shift)));
        let layout = Layout::from_size_align(count * PAGE_SIZE, 1 << align_shift).ok()?;
        let addr = self.raw_alloc(layout)?;
        self.page_allocs.set(self.page_allocs.get() + 1);
        Some(PhysAddr::new(addr))
    }

    unsafe fn free_contiguous(&mut self, base: PhysAddr, count: usize) {
        let layout = self.live.borrow().get(&base.as_u64()).copied();
        let layout = layout.unwrap_or_else(|| panic!("free of unknown pages at {base}"));
        assert_eq!(layout.size(), count * PAGE_SIZE, "page count mismatch at {base}");
        self.raw_free(base.as_u64(), layout);
        self.page_frees.set(self.page_frees.get() + 1);
    }

    fn heap_alloc(&mut self, size: usize, align: usize) -> Option<VirtAddr> {
        let layout = Layout::from_size_align(size, align).ok()?;
        let addr = self.raw_alloc(layout)?;
        self.heap_allocs.set(self.heap_allocs.get() + 1);
        Some(VirtAddr::new(addr))
    }

    unsafe fn heap_free(&mut self, ptr: VirtAddr, size: usize, align: usize) {
        let layout = Layout::from_size_align(size, align).unwrap();
        self.raw_free(ptr.as_u64(), layout);
        self.heap_frees.set(self.heap_frees.get() + 1);
    }

    fn physmap(&self) -> Physmap {
        Physmap::new(0)
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        for (addr, layout) in core::mem::take(&mut *self.live.borrow_mut()) {
            // SAFETY: Still owned by this source.
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}

// ---------------------------------------------------------------------------
// TLB recorder
// ---------------------------------------------------------------------------

std::thread_local! {
    static INVALIDATIONS: RefCell<Vec<(TlbScope, VirtAddr)>> = const { RefCell::new(Vec::new()) };
}

fn record_invalidation(scope: TlbScope, virt: VirtAddr) {
    INVALIDATIONS.with(|log| log.borrow_mut().push((scope, virt)));
}

/// Routes TLB invalidations into a per-thread log.
///
/// The hook is process-wide but each test thread only sees its own entries.
pub fn install_tlb_recorder() {
    register_tlb_invalidate(record_invalidation);
}

/// Drains the current thread's invalidation log.
pub fn take_invalidations() -> Vec<(TlbScope, VirtAddr)> {
    INVALIDATIONS.with(|log| core::mem::take(&mut *log.borrow_mut()))
}

// ---------------------------------------------------------------------------
// x86 processor features
// ---------------------------------------------------------------------------

static X86_FEATURES: Mutex<()> = Mutex::new(());

/// Holds the x86 feature atomics at a fixed setting and restores the
/// defaults on drop.
pub struct X86Features {
    _lock: MutexGuard<'static, ()>,
}

/// Pins the x86 codec's processor features for the lifetime of the guard.
///
/// Tests that depend on the feature atomics, default values included, take
/// this so they never observe another test's override.
pub fn x86_features(nx: bool, huge_1g: bool, phys_addr_bits: u8) -> X86Features {
    let lock = X86_FEATURES.lock().unwrap_or_else(PoisonError::into_inner);
    crate::codec::x86_64::set_features(nx, huge_1g, phys_addr_bits);
    X86Features { _lock: lock }
}

impl Drop for X86Features {
    fn drop(&mut self) {
        crate::codec::x86_64::set_features(true, true, 52);
    }
}
