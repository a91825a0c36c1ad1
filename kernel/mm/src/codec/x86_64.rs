//! x86_64 4-level paging format.
//!
//! PML4 -> PDPT -> PD -> PT, 512 entries each. Large leaves are marked with
//! `PS` at the PD (2 MiB) and PDPT (1 GiB) levels; at the PT level the same
//! bit selects a PAT entry instead.
//!
//! Processor capabilities that change the encoding (NX, 1 GiB pages, the
//! physical address width) are discovered by [`init`] and default to the
//! architectural maximums, which is what host tests run with.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use radix_core::addr::{PhysAddr, VirtAddr};

use super::{Descriptor, Level, PagingArch, corrupt_descriptor};
use crate::MmuError;
use crate::mapper::{CachePolicy, MmuFlags, TlbScope};

/// x86_64 4-level page tables.
#[derive(Debug, Clone, Copy)]
pub enum X86_64 {}

bitflags::bitflags! {
    /// Page table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry is present.
        const PRESENT       = 1 << 0;
        /// Writes allowed.
        const WRITABLE      = 1 << 1;
        /// Accessible from ring 3.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on write.
        const DIRTY         = 1 << 6;
        /// Large leaf at PD/PDPT.
        const HUGE_PAGE     = 1 << 7;
        /// Survives CR3 reloads.
        const GLOBAL        = 1 << 8;
        /// Execute-disable.
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Physical frame address, bits 12..51.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// PAT selector in a 4 KiB leaf.
const PTE_PAT: u64 = 1 << 7;
/// PAT selector in a large leaf.
const PTE_PAT_LARGE: u64 = 1 << 12;

static NX_SUPPORTED: AtomicBool = AtomicBool::new(true);
static HUGE_1G_SUPPORTED: AtomicBool = AtomicBool::new(true);
static PHYS_ADDR_BITS: AtomicU8 = AtomicU8::new(52);

impl PagingArch for X86_64 {
    const NAME: &'static str = "x86_64";

    const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;
    const KERNEL_SIZE: u64 = 1 << 47;
    const USER_BASE: u64 = 0;
    const USER_SIZE: u64 = 1 << 47;

    fn supports_geometry(page_shift: u32, size_shift: u32) -> bool {
        page_shift == 12 && size_shift == 48
    }

    fn block_max_shift() -> u32 {
        if HUGE_1G_SUPPORTED.load(Ordering::Relaxed) {
            30
        } else {
            21
        }
    }

    fn check_vaddr(vaddr: VirtAddr) -> bool {
        vaddr.is_sign_extended(Self::MAX_VA_BITS)
    }

    fn check_paddr(paddr: PhysAddr, size: u64) -> bool {
        let bits = u32::from(PHYS_ADDR_BITS.load(Ordering::Relaxed));
        match paddr.as_u64().checked_add(size.saturating_sub(1)) {
            Some(last) => last >> bits == 0,
            None => false,
        }
    }

    fn encode_attrs(flags: MmuFlags, scope: TlbScope) -> Result<u64, MmuError> {
        if flags.contains(MmuFlags::NS) {
            return Err(MmuError::InvalidFlags);
        }

        let mut pte = PteFlags::PRESENT | PteFlags::ACCESSED;
        match flags.cache_policy() {
            Some(CachePolicy::Cached) => {}
            Some(CachePolicy::Uncached) => pte |= PteFlags::CACHE_DISABLE,
            Some(CachePolicy::Device) => {
                pte |= PteFlags::CACHE_DISABLE | PteFlags::WRITE_THROUGH;
            }
            None => return Err(MmuError::InvalidFlags),
        }
        if !flags.contains(MmuFlags::PERM_RO) {
            pte |= PteFlags::WRITABLE;
        }
        if flags.contains(MmuFlags::PERM_USER) {
            pte |= PteFlags::USER;
        }
        if flags.contains(MmuFlags::PERM_NO_EXECUTE) && NX_SUPPORTED.load(Ordering::Relaxed) {
            pte |= PteFlags::NO_EXECUTE;
        }
        if scope == TlbScope::Global {
            pte |= PteFlags::GLOBAL;
        }
        Ok(pte.bits())
    }

    fn decode_attrs(raw: u64, level: Level) -> MmuFlags {
        let pat = if level.is_page_level() {
            PTE_PAT
        } else {
            PTE_PAT_LARGE
        };
        if raw & pat != 0 {
            corrupt_descriptor(Self::NAME, raw, level, "PAT memory type");
        }

        let pte = PteFlags::from_bits_truncate(raw);
        let mut flags = match (
            pte.contains(PteFlags::CACHE_DISABLE),
            pte.contains(PteFlags::WRITE_THROUGH),
        ) {
            (false, false) => MmuFlags::CACHED,
            (true, false) => MmuFlags::UNCACHED,
            (true, true) => MmuFlags::UNCACHED_DEVICE,
            (false, true) => corrupt_descriptor(Self::NAME, raw, level, "write-through memory type"),
        };
        if !pte.contains(PteFlags::WRITABLE) {
            flags |= MmuFlags::PERM_RO;
        }
        if pte.contains(PteFlags::USER) {
            flags |= MmuFlags::PERM_USER;
        }
        if pte.contains(PteFlags::NO_EXECUTE) {
            flags |= MmuFlags::PERM_NO_EXECUTE;
        }
        flags
    }

    fn classify(raw: u64, level: Level) -> Descriptor {
        let pte = PteFlags::from_bits_truncate(raw);
        if !pte.contains(PteFlags::PRESENT) {
            return Descriptor::Invalid;
        }
        if level.is_page_level() {
            return Descriptor::Leaf(PhysAddr::new(raw & ADDR_MASK));
        }
        if !pte.contains(PteFlags::HUGE_PAGE) {
            return Descriptor::Table(PhysAddr::new(raw & ADDR_MASK));
        }
        if level.index_shift() > Self::block_max_shift() {
            return Descriptor::Unrecognized;
        }
        // Bit 12 is PAT in a large leaf, not address.
        Descriptor::Leaf(PhysAddr::new(raw & ADDR_MASK & !(level.block_size() - 1)))
    }

    fn table_descriptor(phys: PhysAddr, leaf_attrs: u64) -> u64 {
        let mut pte = PteFlags::PRESENT | PteFlags::WRITABLE;
        if leaf_attrs & PteFlags::USER.bits() != 0 {
            pte |= PteFlags::USER;
        }
        (phys.as_u64() & ADDR_MASK) | pte.bits()
    }

    fn leaf_descriptor(phys: PhysAddr, attrs: u64, level: Level) -> u64 {
        let mut raw = (phys.as_u64() & ADDR_MASK) | attrs;
        if !level.is_page_level() {
            raw |= PteFlags::HUGE_PAGE.bits();
        }
        raw
    }

    fn root_token(root: PhysAddr, _scope: TlbScope) -> u64 {
        root.as_u64()
    }
}

/// Records processor capabilities that affect the encoding.
pub fn set_features(nx: bool, huge_1g: bool, phys_addr_bits: u8) {
    NX_SUPPORTED.store(nx, Ordering::Relaxed);
    HUGE_1G_SUPPORTED.store(huge_1g, Ordering::Relaxed);
    PHYS_ADDR_BITS.store(phys_addr_bits, Ordering::Relaxed);
}

/// Enables write protection, SMEP/SMAP, global pages, and NX, then routes
/// TLB maintenance to `invlpg`.
#[cfg(target_arch = "x86_64")]
pub(crate) fn init() {
    use radix_core::arch::x86_64::cpuid::PagingFeatures;
    use radix_core::arch::x86_64::instructions::invlpg;
    use radix_core::arch::x86_64::registers::{
        Cr0, Cr0Flags, Cr4, Cr4Flags, EferFlags, efer_insert,
    };

    let features = PagingFeatures::detect();

    let mut cr4 = Cr4Flags::PAGE_GLOBAL;
    if features.smep {
        cr4 |= Cr4Flags::SMEP;
    }
    if features.smap {
        cr4 |= Cr4Flags::SMAP;
    }

    // SAFETY: Every flag set here was reported by CPUID, and turning on
    // supervisor write protection only tightens existing permissions.
    unsafe {
        Cr0::insert(Cr0Flags::WRITE_PROTECT);
        Cr4::insert(cr4);
        if features.nx {
            efer_insert(EferFlags::NO_EXECUTE_ENABLE);
        }
    }

    set_features(features.nx, features.huge_1g, features.phys_addr_bits);
    crate::mapper::register_tlb_invalidate(|_scope, virt| invlpg(virt));

    radix_core::kinfo!(
        "x86_64 mmu: paddr {} bits, vaddr {} bits, nx={}, 1g={}, smep={}, smap={}",
        features.phys_addr_bits,
        features.virt_addr_bits,
        features.nx,
        features.huge_1g,
        features.smep,
        features.smap,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const PML4: Level = Level::new(39, 12);
    const PDPT: Level = Level::new(30, 12);
    const PD: Level = Level::new(21, 12);
    const PT: Level = Level::page(12);

    fn encode(flags: MmuFlags) -> PteFlags {
        PteFlags::from_bits_truncate(X86_64::encode_attrs(flags, TlbScope::Asid(1)).unwrap())
    }

    #[test]
    fn kernel_mapping_is_global_and_accessed() {
        let raw = X86_64::encode_attrs(MmuFlags::CACHED, TlbScope::Global).unwrap();
        let pte = PteFlags::from_bits_truncate(raw);
        assert!(pte.contains(
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::ACCESSED | PteFlags::GLOBAL
        ));
        assert!(!pte.contains(PteFlags::USER));
    }

    #[test]
    fn user_read_only() {
        let pte = encode(MmuFlags::PERM_USER | MmuFlags::PERM_RO);
        assert!(pte.contains(PteFlags::USER));
        assert!(!pte.contains(PteFlags::WRITABLE));
        assert!(!pte.contains(PteFlags::GLOBAL));
    }

    #[test]
    fn cache_policies() {
        assert!(encode(MmuFlags::UNCACHED).contains(PteFlags::CACHE_DISABLE));
        assert!(!encode(MmuFlags::UNCACHED).contains(PteFlags::WRITE_THROUGH));
        assert!(
            encode(MmuFlags::UNCACHED_DEVICE)
                .contains(PteFlags::CACHE_DISABLE | PteFlags::WRITE_THROUGH)
        );
    }

    #[test]
    fn non_secure_and_reserved_cache_are_invalid() {
        assert_eq!(
            X86_64::encode_attrs(MmuFlags::NS, TlbScope::Global),
            Err(MmuError::InvalidFlags)
        );
        assert_eq!(
            X86_64::encode_attrs(MmuFlags::CACHE_MASK, TlbScope::Global),
            Err(MmuError::InvalidFlags)
        );
    }

    #[test]
    fn decode_inverts_encode() {
        let cache = [MmuFlags::CACHED, MmuFlags::UNCACHED, MmuFlags::UNCACHED_DEVICE];
        for &c in &cache {
            for perm in 0..8u32 {
                let flags = c | MmuFlags::from_bits_truncate(perm << 2);
                let attrs = X86_64::encode_attrs(flags, TlbScope::Global).unwrap();
                for level in [PT, PD, PDPT] {
                    let raw = X86_64::leaf_descriptor(PhysAddr::new(0x4000_0000), attrs, level);
                    assert_eq!(X86_64::decode_attrs(raw, level), flags, "flags {flags:?}");
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "write-through memory type")]
    fn write_through_alone_is_fatal() {
        let raw = 0x1000 | (PteFlags::PRESENT | PteFlags::WRITE_THROUGH).bits();
        let _ = X86_64::decode_attrs(raw, PT);
    }

    #[test]
    #[should_panic(expected = "PAT memory type")]
    fn pat_bit_is_fatal() {
        let raw = 0x1000 | PTE_PAT | PteFlags::PRESENT.bits();
        let _ = X86_64::decode_attrs(raw, PT);
    }

    #[test]
    fn classify_by_level() {
        let _features = crate::test_support::x86_features(true, true, 52);
        let p = PteFlags::PRESENT.bits();
        let ps = PteFlags::HUGE_PAGE.bits();
        assert_eq!(X86_64::classify(0x5000, PD), Descriptor::Invalid);
        assert_eq!(
            X86_64::classify(0x5000 | p, PD),
            Descriptor::Table(PhysAddr::new(0x5000))
        );
        assert_eq!(
            X86_64::classify(0x20_0000 | p | ps, PD),
            Descriptor::Leaf(PhysAddr::new(0x20_0000))
        );
        assert_eq!(
            X86_64::classify(0x4000_0000 | p | ps, PDPT),
            Descriptor::Leaf(PhysAddr::new(0x4000_0000))
        );
        // At the PT level bit 7 is PAT, so the entry is still a page.
        assert_eq!(
            X86_64::classify(0x5000 | p | ps, PT),
            Descriptor::Leaf(PhysAddr::new(0x5000))
        );
        assert_eq!(X86_64::classify(0x5000 | p | ps, PML4), Descriptor::Unrecognized);
    }

    #[test]
    fn no_gigabyte_pages_limits_blocks_to_pd() {
        let _features = crate::test_support::x86_features(true, false, 52);
        assert_eq!(X86_64::block_max_shift(), 21);
        let leaf = 0x4000_0000 | (PteFlags::PRESENT | PteFlags::HUGE_PAGE).bits();
        assert_eq!(X86_64::classify(leaf, PDPT), Descriptor::Unrecognized);
        assert_eq!(
            X86_64::classify(0x20_0000 | (PteFlags::PRESENT | PteFlags::HUGE_PAGE).bits(), PD),
            Descriptor::Leaf(PhysAddr::new(0x20_0000))
        );
    }

    #[test]
    fn narrow_physical_address_width() {
        let _features = crate::test_support::x86_features(true, true, 36);
        assert!(X86_64::check_paddr(PhysAddr::new(0xF_FFFF_F000), 0x1000));
        assert!(!X86_64::check_paddr(PhysAddr::new(0xF_FFFF_F000), 0x2000));
        assert!(!X86_64::check_paddr(PhysAddr::new(0x10_0000_0000), 0x1000));
    }

    #[test]
    fn intermediate_entries_follow_user_leaves() {
        let user = encode(MmuFlags::PERM_USER).bits();
        let kernel = X86_64::encode_attrs(MmuFlags::PERM_RO, TlbScope::Global).unwrap();
        let t_user = PteFlags::from_bits_truncate(X86_64::table_descriptor(PhysAddr::new(0x3000), user));
        let t_kernel =
            PteFlags::from_bits_truncate(X86_64::table_descriptor(PhysAddr::new(0x3000), kernel));
        assert!(t_user.contains(PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER));
        assert!(t_kernel.contains(PteFlags::PRESENT | PteFlags::WRITABLE));
        assert!(!t_kernel.contains(PteFlags::USER));
        assert!(!t_kernel.contains(PteFlags::NO_EXECUTE));
    }

    #[test]
    fn address_checks() {
        let _features = crate::test_support::x86_features(true, true, 52);
        assert!(X86_64::check_vaddr(VirtAddr::new(0xFFFF_8000_0000_0000)));
        assert!(!X86_64::check_vaddr(VirtAddr::new(0xFFFF_0000_0000_0000)));
        assert!(X86_64::check_paddr(PhysAddr::new(0x000F_FFFF_FFFF_F000), 0x1000));
        assert!(X86_64::supports_geometry(12, 48));
        assert!(!X86_64::supports_geometry(12, 39));
        assert!(!X86_64::supports_geometry(14, 48));
    }
}
