//! Per-address-space translation tree.
//!
//! [`ArchAspace`] owns a root table and the [`PageSource`] its tables come
//! from, validates every request against its window, and drives the walker.
//! It is the handle the VM layer passes in place of a global table pointer,
//! so the kernel space and any number of user spaces coexist.

use core::marker::PhantomData;

use radix_core::addr::{PhysAddr, VirtAddr};
use radix_core::arch::completion_barrier;
use radix_core::{kdebug, ktrace};

use crate::codec::{Level, PagingArch};
use crate::layout::AspaceConfig;
use crate::mapper::MmuFlags;
use crate::table::{ENTRY_SIZE, TableHandle, allocate_table, free_table};
use crate::walker::{self, Walker};
use crate::{MmuError, PageSource};

/// A translation tree for architecture `A` backed by `S`.
///
/// Dropping the address space tears the tree down and frees every table it
/// allocated. It must not be loaded on any CPU at that point.
pub struct ArchAspace<A: PagingArch, S: PageSource> {
    config: AspaceConfig,
    top: Level,
    root: TableHandle,
    owns_root: bool,
    source: S,
    _arch: PhantomData<A>,
}

impl<A: PagingArch, S: PageSource> ArchAspace<A, S> {
    /// Creates an empty address space with a freshly allocated root.
    ///
    /// # Errors
    ///
    /// Configuration errors from [`AspaceConfig::validate`], or
    /// [`MmuError::NoMemory`] if the root cannot be allocated.
    pub fn new(config: AspaceConfig, mut source: S) -> Result<Self, MmuError> {
        let geometry = config.validate::<A>()?;
        let root = allocate_table(&mut source, geometry.root_entries * ENTRY_SIZE)?;
        kdebug!(
            "{}: new aspace {} size {:#x}, root {} ({} entries), {}",
            A::NAME,
            config.base,
            config.size,
            root.phys(),
            root.entries(),
            config.scope
        );
        Ok(Self {
            config,
            top: geometry.top,
            root,
            owns_root: true,
            source,
            _arch: PhantomData,
        })
    }

    /// Adopts an existing root table, such as the kernel's statically
    /// allocated one.
    ///
    /// Tables below the root are still allocated from and freed to `source`.
    /// The root itself is never freed.
    ///
    /// # Errors
    ///
    /// Configuration errors from [`AspaceConfig::validate`].
    ///
    /// # Safety
    ///
    /// `root` must be a valid table for `config`'s geometry, reachable
    /// through `source`'s physmap, and every table below it must have been
    /// allocated from `source` (or be empty).
    pub unsafe fn with_root(
        config: AspaceConfig,
        source: S,
        root: PhysAddr,
    ) -> Result<Self, MmuError> {
        let geometry = config.validate::<A>()?;
        // SAFETY: Guaranteed by the caller.
        let root = unsafe { TableHandle::from_phys(source.physmap(), root, geometry.root_entries) };
        Ok(Self {
            config,
            top: geometry.top,
            root,
            owns_root: false,
            source,
            _arch: PhantomData,
        })
    }

    /// The configuration this address space was created with.
    pub fn config(&self) -> &AspaceConfig {
        &self.config
    }

    /// Physical address of the root table.
    pub fn root_phys(&self) -> PhysAddr {
        self.root.phys()
    }

    /// Value to load into the translation base register (TTBR0 / CR3).
    pub fn root_token(&self) -> u64 {
        A::root_token(self.root.phys(), self.config.scope)
    }

    /// The page source backing this address space.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Checks alignment and window containment of `[vaddr, vaddr + size)`
    /// and returns `vaddr`'s offset within the tree span.
    fn check_range(&self, vaddr: VirtAddr, size: u64) -> Result<u64, MmuError> {
        let page_size = self.config.page_size();
        if !vaddr.is_aligned(page_size) || size & (page_size - 1) != 0 {
            return Err(MmuError::InvalidArgs);
        }
        self.check_window(vaddr, size)?;
        Ok(vaddr.as_u64() & self.config.span_mask())
    }

    fn check_window(&self, vaddr: VirtAddr, size: u64) -> Result<(), MmuError> {
        if !A::check_vaddr(vaddr) || vaddr < self.config.base {
            return Err(MmuError::InvalidArgs);
        }
        let offset = vaddr - self.config.base;
        if size > self.config.size || offset > self.config.size - size {
            return Err(MmuError::InvalidArgs);
        }
        Ok(())
    }

    /// Maps `[vaddr, vaddr + size)` to `[paddr, paddr + size)`.
    ///
    /// Uses the largest blocks the alignment of `vaddr`, `paddr` and `size`
    /// allows. Either the whole range is mapped or, on error, nothing
    /// changed.
    ///
    /// # Errors
    ///
    /// - [`MmuError::InvalidArgs`] for misaligned or out-of-window input.
    /// - [`MmuError::InvalidFlags`] if `flags` cannot be encoded.
    /// - [`MmuError::NoMemory`] if a table could not be allocated.
    /// - [`MmuError::AlreadyMapped`] if any page of the range is mapped.
    pub fn map(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: u64,
        flags: MmuFlags,
    ) -> Result<(), MmuError> {
        kdebug!("{}: map {vaddr} -> {paddr} size {size:#x} flags {flags:?}", A::NAME);

        let vaddr_rel = self.check_range(vaddr, size)?;
        if !paddr.is_aligned(self.config.page_size()) || !A::check_paddr(paddr, size) {
            return Err(MmuError::InvalidArgs);
        }
        if size == 0 {
            return Ok(());
        }
        let attrs = A::encode_attrs(flags, self.config.scope)?;

        let mut walker = Walker::<A, S>::new(&mut self.source, self.config.scope);
        let result = walker.map(vaddr, vaddr_rel, paddr, size, attrs, self.top, &self.root);
        completion_barrier();
        result
    }

    /// Unmaps `[vaddr, vaddr + size)`, returning the number of pages that
    /// were mapped.
    ///
    /// Unmapped holes are skipped, so repeating an unmap is harmless. A
    /// block that is only partly covered is removed whole.
    ///
    /// # Errors
    ///
    /// [`MmuError::InvalidArgs`] for misaligned or out-of-window input.
    pub fn unmap(&mut self, vaddr: VirtAddr, size: u64) -> Result<usize, MmuError> {
        kdebug!("{}: unmap {vaddr} size {size:#x}", A::NAME);

        let vaddr_rel = self.check_range(vaddr, size)?;
        if size == 0 {
            return Ok(0);
        }

        let mut walker = Walker::<A, S>::new(&mut self.source, self.config.scope);
        let count = walker.unmap(vaddr, vaddr_rel, size, self.top, &self.root);
        completion_barrier();
        Ok(count)
    }

    /// Returns the physical address and flags mapped at `vaddr`.
    ///
    /// # Errors
    ///
    /// - [`MmuError::InvalidArgs`] if `vaddr` is outside the window.
    /// - [`MmuError::NotFound`] if nothing is mapped there.
    pub fn query(&self, vaddr: VirtAddr) -> Result<(PhysAddr, MmuFlags), MmuError> {
        self.check_window(vaddr, 1)?;
        let vaddr_rel = vaddr.as_u64() & self.config.span_mask();
        let result = walker::query::<A>(self.source.physmap(), &self.root, self.top, vaddr_rel);
        ktrace!("{}: query {vaddr} -> {result:?}", A::NAME);
        result
    }

    /// Tears the address space down explicitly.
    ///
    /// Equivalent to dropping it; provided so call sites read as intent.
    pub fn destroy(self) {
        drop(self);
    }
}

impl<A: PagingArch, S: PageSource> Drop for ArchAspace<A, S> {
    fn drop(&mut self) {
        let mut walker = Walker::<A, S>::new(&mut self.source, self.config.scope);
        let freed = walker.teardown(&self.root, self.top);
        if self.owns_root {
            // SAFETY: The root is referenced by nothing but this aspace.
            unsafe { free_table(&mut self.source, self.root) };
        }
        kdebug!(
            "{}: destroyed aspace at {}, freed {} table(s)",
            A::NAME,
            self.root.phys(),
            freed + usize::from(self.owns_root)
        );
    }
}
