//! The generic table walker.
//!
//! Map and unmap recurse one level per call; the depth is bounded by the
//! geometry check in `layout` ([`MAX_LEVELS`]). Teardown walks the whole
//! tree with an explicit fixed-capacity stack instead.
//!
//! All offsets handed between levels are relative to the span of the table
//! being processed (`vaddr_rel`), while `vaddr` carries the absolute address
//! for TLB maintenance.

use core::marker::PhantomData;

use planck_noalloc::vec::ArrayVec;
use radix_core::addr::{PhysAddr, VirtAddr};
use radix_core::arch::table_store_barrier;
use radix_core::{kwarn, ktrace};

use crate::codec::{Descriptor, Level, MAX_LEVELS, PagingArch, corrupt_descriptor};
use crate::mapper::{MmuFlags, TlbScope, invalidate_page};
use crate::table::{ENTRY_SIZE, TableHandle, allocate_table, free_table};
use crate::{MmuError, PageSource, Physmap};

/// Walks and mutates one address space's tree.
pub(crate) struct Walker<'a, A: PagingArch, S: PageSource> {
    source: &'a mut S,
    scope: TlbScope,
    _arch: PhantomData<A>,
}

/// Bytes of the chunk starting at `vaddr_rel` that fall inside its entry.
#[inline]
fn chunk_size(level: Level, vaddr_rel: u64, size: u64) -> u64 {
    let block_size = level.block_size();
    let vaddr_rem = vaddr_rel & (block_size - 1);
    size.min(block_size - vaddr_rem)
}

impl<'a, A: PagingArch, S: PageSource> Walker<'a, A, S> {
    pub(crate) fn new(source: &'a mut S, scope: TlbScope) -> Self {
        Self {
            source,
            scope,
            _arch: PhantomData,
        }
    }

    /// Entries in a full-size (non-root) table.
    fn child_entries(level: Level) -> usize {
        1 << level.bits_per_level()
    }

    fn child_handle(&self, phys: PhysAddr, level: Level) -> TableHandle {
        // SAFETY: `phys` came from a table descriptor in a tree this walker
        // exclusively mutates, and every non-root table is full-size.
        unsafe { TableHandle::from_phys(self.source.physmap(), phys, Self::child_entries(level)) }
    }

    /// Follows `table[index]` to its child, creating the child if the slot
    /// is empty.
    ///
    /// A new child is linked with every bit `leaf_attrs` requires of
    /// intermediate entries. Existing entries are left alone until the whole
    /// map has succeeded (see [`Self::raise_table_bits`]).
    fn get_or_create_table(
        &mut self,
        table: &TableHandle,
        index: usize,
        level: Level,
        leaf_attrs: u64,
    ) -> Result<TableHandle, MmuError> {
        let raw = table.read(index);
        match A::classify(raw, level) {
            Descriptor::Invalid => {
                let child = allocate_table(&mut *self.source, Self::child_entries(level) * ENTRY_SIZE)?;
                table.write(index, A::table_descriptor(child.phys(), leaf_attrs));
                Ok(child)
            }
            Descriptor::Table(phys) => Ok(self.child_handle(phys, level)),
            Descriptor::Leaf(phys) => {
                kwarn!(
                    "{}: cannot descend through block at {phys} (index shift {})",
                    A::NAME,
                    level.index_shift()
                );
                Err(MmuError::AlreadyMapped)
            }
            Descriptor::Unrecognized => {
                corrupt_descriptor(A::NAME, raw, level, "unrecognized descriptor type")
            }
        }
    }

    /// Installs `[vaddr, vaddr + size)` -> `paddr` into `table`.
    ///
    /// On failure the tree is exactly as it was before the call.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn map(
        &mut self,
        vaddr: VirtAddr,
        vaddr_rel: u64,
        paddr: PhysAddr,
        size: u64,
        attrs: u64,
        level: Level,
        table: &TableHandle,
    ) -> Result<(), MmuError> {
        self.map_level(vaddr, vaddr_rel, paddr, size, attrs, level, table)?;
        if A::table_descriptor(PhysAddr::zero(), attrs) != A::table_descriptor(PhysAddr::zero(), 0)
        {
            self.raise_table_bits(vaddr_rel, size, attrs, level, table);
        }
        Ok(())
    }

    /// Maps the range at one level, rolling back this level's work on
    /// failure.
    #[allow(clippy::too_many_arguments)]
    fn map_level(
        &mut self,
        vaddr_in: VirtAddr,
        vaddr_rel_in: u64,
        paddr_in: PhysAddr,
        size_in: u64,
        attrs: u64,
        level: Level,
        table: &TableHandle,
    ) -> Result<(), MmuError> {
        let block_size = level.block_size();
        let block_mask = block_size - 1;

        let mut vaddr = vaddr_in;
        let mut vaddr_rel = vaddr_rel_in;
        let mut paddr = paddr_in;
        let mut size = size_in;

        while size > 0 {
            let vaddr_rem = vaddr_rel & block_mask;
            let chunk = chunk_size(level, vaddr_rel, size);
            let index = level.index(vaddr_rel);

            let result = if (vaddr_rel | paddr.as_u64()) & block_mask != 0
                || chunk != block_size
                || level.index_shift() > A::block_max_shift()
            {
                self.map_below(vaddr, vaddr_rem, paddr, chunk, attrs, level, table, index)
            } else if A::classify(table.read(index), level) != Descriptor::Invalid {
                kwarn!("{}: {vaddr} is already mapped", A::NAME);
                Err(MmuError::AlreadyMapped)
            } else {
                table.write(index, A::leaf_descriptor(paddr, attrs, level));
                Ok(())
            };

            if let Err(err) = result {
                let installed = size_in - size;
                if installed > 0 {
                    kwarn!(
                        "{}: rolling back {installed:#x} bytes at {vaddr_in} after {err}",
                        A::NAME
                    );
                    self.unmap(vaddr_in, vaddr_rel_in, installed, level, table);
                }
                return Err(err);
            }

            vaddr = vaddr + chunk;
            vaddr_rel += chunk;
            paddr = paddr + chunk;
            size -= chunk;
        }
        Ok(())
    }

    /// Maps `chunk` through the child table at `table[index]`.
    #[allow(clippy::too_many_arguments)]
    fn map_below(
        &mut self,
        vaddr: VirtAddr,
        vaddr_rem: u64,
        paddr: PhysAddr,
        chunk: u64,
        attrs: u64,
        level: Level,
        table: &TableHandle,
        index: usize,
    ) -> Result<(), MmuError> {
        let child = self.get_or_create_table(table, index, level, attrs)?;
        let result = self.map_level(vaddr, vaddr_rem, paddr, chunk, attrs, level.child(), &child);
        if result.is_err() && child.is_clear(A::INVALID) {
            // The child rolled itself back; drop it if nothing else lives
            // there, whether we just created it or not.
            table.write(index, A::INVALID);
            table_store_barrier();
            // SAFETY: Unlinked and ordered above.
            unsafe { free_table(&mut *self.source, child) };
        }
        result
    }

    /// ORs the bits leaves carrying `attrs` require into every existing
    /// table entry above `[vaddr_rel, vaddr_rel + size)`.
    ///
    /// Runs only after a successful map, so a failed map never leaves a
    /// widened intermediate entry behind.
    fn raise_table_bits(
        &self,
        vaddr_rel: u64,
        size: u64,
        attrs: u64,
        level: Level,
        table: &TableHandle,
    ) {
        let block_mask = level.block_size() - 1;
        let mut vaddr_rel = vaddr_rel;
        let mut size = size;

        while size > 0 {
            let chunk = chunk_size(level, vaddr_rel, size);
            let index = level.index(vaddr_rel);
            let raw = table.read(index);

            if let Descriptor::Table(phys) = A::classify(raw, level) {
                let wanted = A::table_descriptor(phys, attrs);
                if raw | wanted != raw {
                    table.write(index, raw | wanted);
                }
                let child = self.child_handle(phys, level);
                self.raise_table_bits(vaddr_rel & block_mask, chunk, attrs, level.child(), &child);
            }

            vaddr_rel += chunk;
            size -= chunk;
        }
    }

    /// Removes every leaf in `[vaddr, vaddr + size)` from `table`, freeing
    /// child tables that become empty. Returns the number of pages removed.
    pub(crate) fn unmap(
        &mut self,
        vaddr_in: VirtAddr,
        vaddr_rel_in: u64,
        size_in: u64,
        level: Level,
        table: &TableHandle,
    ) -> usize {
        let block_size = level.block_size();
        let block_mask = block_size - 1;

        let mut vaddr = vaddr_in;
        let mut vaddr_rel = vaddr_rel_in;
        let mut size = size_in;
        let mut unmapped = 0;

        while size > 0 {
            let vaddr_rem = vaddr_rel & block_mask;
            let chunk = chunk_size(level, vaddr_rel, size);
            let index = level.index(vaddr_rel);
            let raw = table.read(index);

            match A::classify(raw, level) {
                Descriptor::Invalid => {}
                Descriptor::Table(phys) => {
                    let child = self.child_handle(phys, level);
                    unmapped += self.unmap(vaddr, vaddr_rem, chunk, level.child(), &child);
                    if chunk == block_size || child.is_clear(A::INVALID) {
                        table.write(index, A::INVALID);
                        table_store_barrier();
                        // SAFETY: Unlinked and ordered above.
                        unsafe { free_table(&mut *self.source, child) };
                    }
                }
                Descriptor::Leaf(_) => {
                    if chunk != block_size {
                        kwarn!(
                            "{}: unmap of {chunk:#x} bytes at {vaddr} removes the whole {block_size:#x} block",
                            A::NAME
                        );
                    }
                    table.write(index, A::INVALID);
                    table_store_barrier();
                    invalidate_page(self.scope, vaddr);
                    unmapped += (block_size >> level.page_shift()) as usize;
                }
                Descriptor::Unrecognized => {
                    corrupt_descriptor(A::NAME, raw, level, "unrecognized descriptor type")
                }
            }

            vaddr = vaddr + chunk;
            vaddr_rel += chunk;
            size -= chunk;
        }
        unmapped
    }

    /// Removes every entry under `root` and frees every table below it.
    /// The root itself is left to its owner. Returns the number of tables
    /// freed.
    ///
    /// No TLB maintenance is issued; the caller is discarding the whole
    /// address space and must not have it loaded.
    pub(crate) fn teardown(&mut self, root: &TableHandle, top: Level) -> usize {
        struct Frame {
            table: TableHandle,
            level: Level,
            next: usize,
        }

        let mut stack: ArrayVec<Frame, MAX_LEVELS> = ArrayVec::new();
        stack.push(Frame {
            table: *root,
            level: top,
            next: 0,
        });
        let mut freed = 0;

        while let Some(frame) = stack.as_mut_slice().last_mut() {
            if frame.next == frame.table.entries() {
                let done = stack.pop();
                if let Some(done) = done.filter(|_| !stack.is_empty()) {
                    // SAFETY: Its parent entry was cleared and ordered before
                    // we descended into it.
                    unsafe { free_table(&mut *self.source, done.table) };
                    freed += 1;
                }
                continue;
            }

            let index = frame.next;
            frame.next += 1;
            let level = frame.level;
            let raw = frame.table.read(index);

            let child = match A::classify(raw, level) {
                Descriptor::Invalid => continue,
                Descriptor::Leaf(_) => {
                    frame.table.write(index, A::INVALID);
                    continue;
                }
                Descriptor::Table(phys) => {
                    frame.table.write(index, A::INVALID);
                    table_store_barrier();
                    self.child_handle(phys, level)
                }
                Descriptor::Unrecognized => {
                    corrupt_descriptor(A::NAME, raw, level, "unrecognized descriptor type")
                }
            };

            if stack
                .try_push(Frame {
                    table: child,
                    level: level.child(),
                    next: 0,
                })
                .is_err()
            {
                panic!("{}: table walk deeper than {MAX_LEVELS} levels", A::NAME);
            }
        }

        ktrace!("{}: teardown freed {freed} table(s)", A::NAME);
        freed
    }
}

/// Looks up `vaddr_rel` under `root` without modifying anything.
///
/// # Errors
///
/// [`MmuError::NotFound`] on the first invalid entry.
pub(crate) fn query<A: PagingArch>(
    physmap: Physmap,
    root: &TableHandle,
    top: Level,
    vaddr_rel: u64,
) -> Result<(PhysAddr, MmuFlags), MmuError> {
    let mut table = *root;
    let mut level = top;
    let mut rel = vaddr_rel;

    loop {
        let index = level.index(rel);
        rel &= level.block_size() - 1;
        let raw = table.read(index);

        match A::classify(raw, level) {
            Descriptor::Invalid => return Err(MmuError::NotFound),
            Descriptor::Leaf(phys) => return Ok((phys + rel, A::decode_attrs(raw, level))),
            Descriptor::Table(phys) if !level.is_page_level() => {
                // SAFETY: Reached through a table descriptor of a live tree.
                table = unsafe {
                    TableHandle::from_phys(physmap, phys, 1 << level.bits_per_level())
                };
                level = level.child();
            }
            Descriptor::Table(_) | Descriptor::Unrecognized => {
                corrupt_descriptor(A::NAME, raw, level, "unrecognized descriptor type")
            }
        }
    }
}
