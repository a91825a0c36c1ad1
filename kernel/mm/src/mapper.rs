//! Architecture-neutral mapping flags and TLB maintenance dispatch.
//!
//! [`MmuFlags`] is the flag set the VM layer speaks; each codec translates
//! it to and from descriptor bits. [`TlbScope`] says whether a mapping is
//! shared by every address space (kernel) or tagged with an ASID.
//!
//! # TLB Invalidation Decoupling
//!
//! The native invalidate instruction is registered at boot via
//! [`register_tlb_invalidate`]. Before registration invalidations are
//! no-ops, which is correct for early boot (nothing stale is cached) and
//! for host tests.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use radix_core::addr::VirtAddr;

bitflags::bitflags! {
    /// Architecture-independent mapping flags.
    ///
    /// The low two bits are a cache-policy field, not independent flags:
    /// `CACHED` is the zero value, see [`MmuFlags::cache_policy`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MmuFlags: u32 {
        /// Strongly ordered, uncached memory.
        const UNCACHED        = 1;
        /// Device memory.
        const UNCACHED_DEVICE = 2;
        /// Mask of the cache-policy field.
        const CACHE_MASK      = 3;
        /// Accessible from user mode.
        const PERM_USER       = 1 << 2;
        /// Read-only (writable when clear).
        const PERM_RO         = 1 << 3;
        /// Not executable.
        const PERM_NO_EXECUTE = 1 << 4;
        /// Non-secure memory (AArch64 only).
        const NS              = 1 << 5;
    }
}

/// Memory type selected by the cache-policy field of [`MmuFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Normal write-back memory.
    Cached,
    /// Strongly ordered memory.
    Uncached,
    /// Device memory.
    Device,
}

impl MmuFlags {
    /// Normal cacheable memory (cache-policy field zero).
    pub const CACHED: Self = Self::empty();

    /// Decodes the cache-policy field. Returns `None` for the reserved value.
    pub const fn cache_policy(self) -> Option<CachePolicy> {
        match self.bits() & Self::CACHE_MASK.bits() {
            0 => Some(CachePolicy::Cached),
            1 => Some(CachePolicy::Uncached),
            2 => Some(CachePolicy::Device),
            _ => None,
        }
    }

    /// Returns `self` with the cache-policy field replaced.
    #[must_use]
    pub fn with_cache_policy(self, policy: CachePolicy) -> Self {
        let field = match policy {
            CachePolicy::Cached => Self::CACHED,
            CachePolicy::Uncached => Self::UNCACHED,
            CachePolicy::Device => Self::UNCACHED_DEVICE,
        };
        self.difference(Self::CACHE_MASK) | field
    }
}

/// Which TLB entries a mapping may occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbScope {
    /// Shared by every address space (kernel mappings).
    Global,
    /// Private to the address space tagged with this ASID.
    Asid(u16),
}

impl TlbScope {
    /// Returns the ASID, or 0 for global mappings.
    pub const fn asid(self) -> u16 {
        match self {
            TlbScope::Global => 0,
            TlbScope::Asid(asid) => asid,
        }
    }
}

impl fmt::Display for TlbScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlbScope::Global => write!(f, "global"),
            TlbScope::Asid(asid) => write!(f, "asid {asid}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registered TLB invalidate callback
// ---------------------------------------------------------------------------

/// Signature of the native single-page invalidate.
pub type TlbInvalidateFn = fn(TlbScope, VirtAddr);

static TLB_INVALIDATE_FN: AtomicPtr<()> =
    AtomicPtr::new(nop_invalidate as TlbInvalidateFn as *mut ());

fn nop_invalidate(_scope: TlbScope, _virt: VirtAddr) {}

/// Registers the architecture-specific TLB invalidate function.
///
/// Must be called during early boot before any mapping is removed from a
/// table the CPU has walked.
pub fn register_tlb_invalidate(f: TlbInvalidateFn) {
    TLB_INVALIDATE_FN.store(f as *mut (), Ordering::Release);
}

/// Invalidates any cached translation of `virt` within `scope`.
#[inline]
pub(crate) fn invalidate_page(scope: TlbScope, virt: VirtAddr) {
    let ptr = TLB_INVALIDATE_FN.load(Ordering::Acquire);
    // SAFETY: The pointer was stored via `register_tlb_invalidate`, which
    // takes a valid `TlbInvalidateFn`, or it's the initial `nop_invalidate`.
    let f = unsafe { core::mem::transmute::<*mut (), TlbInvalidateFn>(ptr) };
    f(scope, virt);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values_match_kernel_abi() {
        assert_eq!(MmuFlags::CACHED.bits(), 0);
        assert_eq!(MmuFlags::UNCACHED.bits(), 1);
        assert_eq!(MmuFlags::UNCACHED_DEVICE.bits(), 2);
        assert_eq!(MmuFlags::PERM_USER.bits(), 4);
        assert_eq!(MmuFlags::PERM_RO.bits(), 8);
        assert_eq!(MmuFlags::PERM_NO_EXECUTE.bits(), 16);
        assert_eq!(MmuFlags::NS.bits(), 32);
    }

    #[test]
    fn cache_policy_field() {
        assert_eq!(MmuFlags::CACHED.cache_policy(), Some(CachePolicy::Cached));
        assert_eq!(
            (MmuFlags::UNCACHED | MmuFlags::PERM_RO).cache_policy(),
            Some(CachePolicy::Uncached)
        );
        assert_eq!(MmuFlags::UNCACHED_DEVICE.cache_policy(), Some(CachePolicy::Device));
        assert_eq!(MmuFlags::CACHE_MASK.cache_policy(), None);
    }

    #[test]
    fn with_cache_policy_replaces_field() {
        let flags = MmuFlags::UNCACHED_DEVICE | MmuFlags::PERM_USER;
        let cached = flags.with_cache_policy(CachePolicy::Cached);
        assert_eq!(cached, MmuFlags::PERM_USER);
        assert_eq!(
            cached.with_cache_policy(CachePolicy::Uncached),
            MmuFlags::UNCACHED | MmuFlags::PERM_USER
        );
    }

    #[test]
    fn scope_asid() {
        assert_eq!(TlbScope::Global.asid(), 0);
        assert_eq!(TlbScope::Asid(7).asid(), 7);
        assert_eq!(TlbScope::Asid(7).to_string(), "asid 7");
    }
}
