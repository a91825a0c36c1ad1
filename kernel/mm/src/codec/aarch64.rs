//! AArch64 VMSAv8-64 stage 1 descriptor format.
//!
//! Descriptor type lives in bits [1:0]. Lower attributes sit in bits
//! [11:2], upper attributes (execute-never) in bits [54:53]. Memory types
//! are indirect through `MAIR_EL1`, which [`MAIR_VALUE`] programs.

use radix_core::addr::{PhysAddr, VirtAddr};

use super::{Descriptor, Level, PagingArch, corrupt_descriptor};
use crate::MmuError;
use crate::mapper::{CachePolicy, MmuFlags, TlbScope};

/// AArch64 translation tables.
#[derive(Debug, Clone, Copy)]
pub enum Aarch64 {}

// ---------------------------------------------------------------------------
// Descriptor bits
// ---------------------------------------------------------------------------

const DESC_TYPE_MASK: u64 = 0b11;
const DESC_BLOCK: u64 = 0b01;
/// Table descriptor above the page level; page descriptor at it.
const DESC_TABLE_OR_PAGE: u64 = 0b11;

/// Output address, bits 12..47.
pub const OUTPUT_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

const ATTR_INDEX_SHIFT: u32 = 2;
const ATTR_INDEX_MASK: u64 = 0b111 << ATTR_INDEX_SHIFT;
const ATTR_NS: u64 = 1 << 5;
const ATTR_AP_SHIFT: u32 = 6;
const ATTR_AP_MASK: u64 = 0b11 << ATTR_AP_SHIFT;
const ATTR_SH_INNER_SHAREABLE: u64 = 0b11 << 8;
const ATTR_AF: u64 = 1 << 10;
const ATTR_NG: u64 = 1 << 11;
const ATTR_PXN: u64 = 1 << 53;
const ATTR_UXN: u64 = 1 << 54;

// AP[2:1] encodings.
const AP_P_RW_U_NA: u64 = 0;
const AP_P_RW_U_RW: u64 = 1;
const AP_P_RO_U_NA: u64 = 2;
const AP_P_RO_U_RO: u64 = 3;

// MAIR_EL1 slots.
const MAIR_IDX_STRONGLY_ORDERED: u64 = 0;
const MAIR_IDX_DEVICE: u64 = 1;
const MAIR_IDX_NORMAL: u64 = 2;

/// `MAIR_EL1`: attr0 strongly ordered, attr1 device nGnRE, attr2 normal
/// write-back read/write-allocate.
pub const MAIR_VALUE: u64 = 0x00 | (0x04 << 8) | (0xff << 16);

impl PagingArch for Aarch64 {
    const NAME: &'static str = "arm64";

    const KERNEL_BASE: u64 = 0xFFFF_0000_0000_0000;
    const KERNEL_SIZE: u64 = 1 << 48;
    const USER_BASE: u64 = 0;
    const USER_SIZE: u64 = 1 << 48;

    fn supports_geometry(page_shift: u32, size_shift: u32) -> bool {
        matches!(page_shift, 12 | 14 | 16) && size_shift > page_shift + 3 && size_shift <= 48
    }

    fn check_vaddr(vaddr: VirtAddr) -> bool {
        vaddr.is_split_range(Self::MAX_VA_BITS)
    }

    fn check_paddr(paddr: PhysAddr, size: u64) -> bool {
        match paddr.as_u64().checked_add(size.saturating_sub(1)) {
            Some(last) => last & !(OUTPUT_ADDR_MASK | 0xFFF) == 0,
            None => false,
        }
    }

    fn encode_attrs(flags: MmuFlags, scope: TlbScope) -> Result<u64, MmuError> {
        let mut attrs = ATTR_AF;

        attrs |= match flags.cache_policy() {
            Some(CachePolicy::Cached) => {
                (MAIR_IDX_NORMAL << ATTR_INDEX_SHIFT) | ATTR_SH_INNER_SHAREABLE
            }
            Some(CachePolicy::Uncached) => MAIR_IDX_STRONGLY_ORDERED << ATTR_INDEX_SHIFT,
            Some(CachePolicy::Device) => MAIR_IDX_DEVICE << ATTR_INDEX_SHIFT,
            None => return Err(MmuError::InvalidFlags),
        };

        let ap = match (
            flags.contains(MmuFlags::PERM_USER),
            flags.contains(MmuFlags::PERM_RO),
        ) {
            (true, true) => AP_P_RO_U_RO,
            (true, false) => AP_P_RW_U_RW,
            (false, true) => AP_P_RO_U_NA,
            (false, false) => AP_P_RW_U_NA,
        };
        attrs |= ap << ATTR_AP_SHIFT;

        if flags.contains(MmuFlags::PERM_NO_EXECUTE) {
            attrs |= ATTR_UXN | ATTR_PXN;
        }
        if flags.contains(MmuFlags::NS) {
            attrs |= ATTR_NS;
        }
        if let TlbScope::Asid(_) = scope {
            attrs |= ATTR_NG;
        }

        Ok(attrs)
    }

    fn decode_attrs(raw: u64, level: Level) -> MmuFlags {
        let mut flags = match (raw & ATTR_INDEX_MASK) >> ATTR_INDEX_SHIFT {
            MAIR_IDX_STRONGLY_ORDERED => MmuFlags::UNCACHED,
            MAIR_IDX_DEVICE => MmuFlags::UNCACHED_DEVICE,
            MAIR_IDX_NORMAL => MmuFlags::CACHED,
            _ => corrupt_descriptor(Self::NAME, raw, level, "unknown memory attribute index"),
        };

        flags |= match (raw & ATTR_AP_MASK) >> ATTR_AP_SHIFT {
            AP_P_RW_U_NA => MmuFlags::empty(),
            AP_P_RW_U_RW => MmuFlags::PERM_USER,
            AP_P_RO_U_NA => MmuFlags::PERM_RO,
            _ => MmuFlags::PERM_USER | MmuFlags::PERM_RO,
        };

        if raw & (ATTR_UXN | ATTR_PXN) == ATTR_UXN | ATTR_PXN {
            flags |= MmuFlags::PERM_NO_EXECUTE;
        }
        if raw & ATTR_NS != 0 {
            flags |= MmuFlags::NS;
        }
        flags
    }

    fn classify(raw: u64, level: Level) -> Descriptor {
        let addr = PhysAddr::new(raw & OUTPUT_ADDR_MASK);
        match raw & DESC_TYPE_MASK {
            DESC_TABLE_OR_PAGE if level.is_page_level() => Descriptor::Leaf(addr),
            DESC_TABLE_OR_PAGE => Descriptor::Table(addr),
            DESC_BLOCK
                if !level.is_page_level() && level.index_shift() <= Self::block_max_shift() =>
            {
                Descriptor::Leaf(addr)
            }
            DESC_BLOCK => Descriptor::Unrecognized,
            _ => Descriptor::Invalid,
        }
    }

    fn table_descriptor(phys: PhysAddr, _leaf_attrs: u64) -> u64 {
        (phys.as_u64() & OUTPUT_ADDR_MASK) | DESC_TABLE_OR_PAGE
    }

    fn leaf_descriptor(phys: PhysAddr, attrs: u64, level: Level) -> u64 {
        let kind = if level.is_page_level() {
            DESC_TABLE_OR_PAGE
        } else {
            DESC_BLOCK
        };
        (phys.as_u64() & OUTPUT_ADDR_MASK) | kind | attrs
    }

    fn root_token(root: PhysAddr, scope: TlbScope) -> u64 {
        root.as_u64() | (u64::from(scope.asid()) << 48)
    }
}

/// Programs `MAIR_EL1` and routes TLB maintenance to `tlbi`.
#[cfg(target_arch = "aarch64")]
pub(crate) fn init() {
    use radix_core::arch::aarch64::{instructions, registers::Mair};

    // SAFETY: Boot code only uses the three indices MAIR_VALUE defines.
    unsafe { Mair::write(MAIR_VALUE) };
    crate::mapper::register_tlb_invalidate(|scope, virt| match scope {
        TlbScope::Global => instructions::tlbi_vaae1is(virt.as_u64()),
        TlbScope::Asid(asid) => instructions::tlbi_vae1is(virt.as_u64(), asid),
    });
    radix_core::kinfo!("arm64 mmu: MAIR_EL1={MAIR_VALUE:#x}");
}

#[cfg(test)]
mod tests {
    use super::*;

    const L0: Level = Level::new(39, 12);
    const L1: Level = Level::new(30, 12);
    const L2: Level = Level::new(21, 12);
    const L3: Level = Level::page(12);

    #[test]
    fn mair_layout() {
        assert_eq!(MAIR_VALUE, 0x00ff_0400);
    }

    #[test]
    fn cached_kernel_rw() {
        let attrs = Aarch64::encode_attrs(MmuFlags::CACHED, TlbScope::Global).unwrap();
        assert_eq!(attrs, ATTR_AF | (2 << 2) | ATTR_SH_INNER_SHAREABLE);
        assert_eq!(attrs & ATTR_NG, 0);
    }

    #[test]
    fn user_read_only_no_execute() {
        let flags = MmuFlags::PERM_USER | MmuFlags::PERM_RO | MmuFlags::PERM_NO_EXECUTE;
        let attrs = Aarch64::encode_attrs(flags, TlbScope::Asid(1)).unwrap();
        assert_eq!((attrs & ATTR_AP_MASK) >> ATTR_AP_SHIFT, AP_P_RO_U_RO);
        assert_ne!(attrs & ATTR_UXN, 0);
        assert_ne!(attrs & ATTR_PXN, 0);
        assert_ne!(attrs & ATTR_NG, 0);
        assert_ne!(attrs & ATTR_AF, 0);
    }

    #[test]
    fn device_and_strongly_ordered_are_not_shareable_normal() {
        let dev = Aarch64::encode_attrs(MmuFlags::UNCACHED_DEVICE, TlbScope::Global).unwrap();
        assert_eq!((dev & ATTR_INDEX_MASK) >> ATTR_INDEX_SHIFT, MAIR_IDX_DEVICE);
        let so = Aarch64::encode_attrs(MmuFlags::UNCACHED, TlbScope::Global).unwrap();
        assert_eq!((so & ATTR_INDEX_MASK) >> ATTR_INDEX_SHIFT, MAIR_IDX_STRONGLY_ORDERED);
        assert_eq!(so & ATTR_SH_INNER_SHAREABLE, 0);
    }

    #[test]
    fn reserved_cache_policy_is_invalid() {
        assert_eq!(
            Aarch64::encode_attrs(MmuFlags::CACHE_MASK, TlbScope::Global),
            Err(MmuError::InvalidFlags)
        );
    }

    #[test]
    fn decode_inverts_encode() {
        let cache = [MmuFlags::CACHED, MmuFlags::UNCACHED, MmuFlags::UNCACHED_DEVICE];
        for &c in &cache {
            for perm in 0..16u32 {
                let flags = c | MmuFlags::from_bits_truncate(perm << 2);
                let attrs = Aarch64::encode_attrs(flags, TlbScope::Global).unwrap();
                let raw = Aarch64::leaf_descriptor(PhysAddr::new(0x4000_0000), attrs, L3);
                assert_eq!(Aarch64::decode_attrs(raw, L3), flags, "flags {flags:?}");
            }
        }
    }

    #[test]
    fn single_execute_never_bit_is_still_executable() {
        let raw = ATTR_AF | (MAIR_IDX_NORMAL << ATTR_INDEX_SHIFT) | ATTR_UXN | 0b11;
        assert!(!Aarch64::decode_attrs(raw, L3).contains(MmuFlags::PERM_NO_EXECUTE));
    }

    #[test]
    #[should_panic(expected = "unknown memory attribute index")]
    fn unknown_attr_index_is_fatal() {
        let raw = 0x4000_0000 | (5 << ATTR_INDEX_SHIFT) | ATTR_AF | 0b11;
        let _ = Aarch64::decode_attrs(raw, L3);
    }

    #[test]
    fn classify_by_level() {
        let phys = PhysAddr::new(0x8000_0000);
        assert_eq!(Aarch64::classify(0, L1), Descriptor::Invalid);
        assert_eq!(Aarch64::classify(0x8000_0000 | 0b10, L1), Descriptor::Invalid);
        assert_eq!(Aarch64::classify(0x8000_0000 | 0b11, L1), Descriptor::Table(phys));
        assert_eq!(Aarch64::classify(0x8000_0000 | 0b11, L3), Descriptor::Leaf(phys));
        assert_eq!(Aarch64::classify(0x8000_0000 | 0b01, L1), Descriptor::Leaf(phys));
        assert_eq!(Aarch64::classify(0x8000_0000 | 0b01, L2), Descriptor::Leaf(phys));
        // No blocks at level 0 with a 4 KiB granule, none at the page level.
        assert_eq!(Aarch64::classify(0x8000_0000 | 0b01, L0), Descriptor::Unrecognized);
        assert_eq!(Aarch64::classify(0x8000_0000 | 0b01, L3), Descriptor::Unrecognized);
    }

    #[test]
    fn leaf_kind_depends_on_level() {
        let phys = PhysAddr::new(0x4020_0000);
        assert_eq!(Aarch64::leaf_descriptor(phys, 0, L2) & DESC_TYPE_MASK, DESC_BLOCK);
        assert_eq!(Aarch64::leaf_descriptor(phys, 0, L3) & DESC_TYPE_MASK, 0b11);
        assert_eq!(Aarch64::table_descriptor(phys, ATTR_NG), 0x4020_0000 | 0b11);
    }

    #[test]
    fn geometry_and_address_checks() {
        assert!(Aarch64::supports_geometry(12, 48));
        assert!(Aarch64::supports_geometry(14, 36));
        assert!(Aarch64::supports_geometry(16, 42));
        assert!(!Aarch64::supports_geometry(13, 48));
        assert!(!Aarch64::supports_geometry(12, 49));
        assert!(Aarch64::check_paddr(PhysAddr::new(0x0000_FFFF_FFFF_F000), 0x1000));
        assert!(!Aarch64::check_paddr(PhysAddr::new(0x0000_FFFF_FFFF_F000), 0x2000));
        assert!(Aarch64::check_vaddr(VirtAddr::new(0xFFFF_0000_0000_1000)));
        assert!(!Aarch64::check_vaddr(VirtAddr::new(0x00FF_0000_0000_0000)));
    }

    #[test]
    fn root_token_carries_asid() {
        let root = PhysAddr::new(0x4008_0000);
        assert_eq!(Aarch64::root_token(root, TlbScope::Global), 0x4008_0000);
        assert_eq!(
            Aarch64::root_token(root, TlbScope::Asid(3)),
            0x0003_0000_4008_0000
        );
    }
}
