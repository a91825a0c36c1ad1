//! CPUID feature discovery for paging.

use core::arch::x86_64::__cpuid;

/// Paging-related capabilities reported by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingFeatures {
    /// Execute-disable bit (`NX`) is available.
    pub nx: bool,
    /// 1 GiB pages are available at the PDPT level.
    pub huge_1g: bool,
    /// Supervisor-mode execution prevention.
    pub smep: bool,
    /// Supervisor-mode access prevention.
    pub smap: bool,
    /// Physical address width in bits.
    pub phys_addr_bits: u8,
    /// Linear address width in bits.
    pub virt_addr_bits: u8,
}

const EXT_FEATURES_LEAF: u32 = 0x8000_0001;
const EXT_ADDR_SIZES_LEAF: u32 = 0x8000_0008;

impl PagingFeatures {
    /// Queries the running processor.
    pub fn detect() -> Self {
        // SAFETY: CPUID is available on every x86_64 processor.
        let max_basic = unsafe { __cpuid(0) }.eax;
        let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;

        let (smep, smap) = if max_basic >= 7 {
            let leaf7 = unsafe { __cpuid(7) };
            (leaf7.ebx & (1 << 7) != 0, leaf7.ebx & (1 << 20) != 0)
        } else {
            (false, false)
        };

        let (nx, huge_1g) = if max_ext >= EXT_FEATURES_LEAF {
            let ext = unsafe { __cpuid(EXT_FEATURES_LEAF) };
            (ext.edx & (1 << 20) != 0, ext.edx & (1 << 26) != 0)
        } else {
            (false, false)
        };

        // Without leaf 0x8000_0008 assume the long-mode minimums.
        let (phys_addr_bits, virt_addr_bits) = if max_ext >= EXT_ADDR_SIZES_LEAF {
            let sizes = unsafe { __cpuid(EXT_ADDR_SIZES_LEAF) }.eax;
            ((sizes & 0xff) as u8, ((sizes >> 8) & 0xff) as u8)
        } else {
            (36, 48)
        };

        Self {
            nx,
            huge_1g,
            smep,
            smap,
            phys_addr_bits,
            virt_addr_bits,
        }
    }
}
