//! Control registers and MSRs touched by MMU initialization.

use core::arch::asm;

bitflags::bitflags! {
    /// CR0 flags relevant to paging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u64 {
        /// Supervisor writes honor read-only pages.
        const WRITE_PROTECT = 1 << 16;
    }
}

bitflags::bitflags! {
    /// CR4 flags relevant to paging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        /// Global pages survive CR3 reloads.
        const PAGE_GLOBAL = 1 << 7;
        /// Supervisor-mode execution prevention.
        const SMEP        = 1 << 20;
        /// Supervisor-mode access prevention.
        const SMAP        = 1 << 21;
    }
}

bitflags::bitflags! {
    /// IA32_EFER register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EferFlags: u64 {
        /// No-Execute Enable.
        const NO_EXECUTE_ENABLE = 1 << 11;
    }
}

/// The CR0 register.
pub struct Cr0;

impl Cr0 {
    /// Reads the raw value.
    #[inline]
    pub fn read_raw() -> u64 {
        let value: u64;
        // SAFETY: Reading CR0 has no side effects.
        unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    /// Writes a raw value.
    ///
    /// # Safety
    ///
    /// Changing CR0 alters protection and paging behavior globally.
    #[inline]
    pub unsafe fn write_raw(value: u64) {
        unsafe { asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags)) };
    }

    /// Sets `flags` while preserving every other bit.
    ///
    /// # Safety
    ///
    /// See [`Cr0::write_raw`].
    #[inline]
    pub unsafe fn insert(flags: Cr0Flags) {
        unsafe { Self::write_raw(Self::read_raw() | flags.bits()) };
    }
}

/// The CR3 register (root table base).
pub struct Cr3;

impl Cr3 {
    /// Loads a new root table, flushing non-global TLB entries.
    ///
    /// # Safety
    ///
    /// `value` must reference a valid PML4 whose kernel half maps the code
    /// currently executing.
    #[inline]
    pub unsafe fn write_raw(value: u64) {
        unsafe { asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags)) };
    }
}

/// The CR4 register.
pub struct Cr4;

impl Cr4 {
    /// Reads the raw value.
    #[inline]
    pub fn read_raw() -> u64 {
        let value: u64;
        // SAFETY: Reading CR4 has no side effects.
        unsafe { asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    /// Sets `flags` while preserving every other bit.
    ///
    /// # Safety
    ///
    /// The processor must support every flag being set.
    #[inline]
    pub unsafe fn insert(flags: Cr4Flags) {
        let value = Self::read_raw() | flags.bits();
        unsafe { asm!("mov cr4, {}", in(reg) value, options(nostack, preserves_flags)) };
    }
}

/// A Model Specific Register, identified by its address.
#[derive(Debug, Clone, Copy)]
pub struct Msr(u32);

/// IA32_EFER MSR address.
pub const IA32_EFER: Msr = Msr(0xC000_0080);

impl Msr {
    /// Reads the 64-bit value of this MSR.
    ///
    /// # Safety
    ///
    /// The caller must ensure this MSR address is valid and readable.
    #[inline]
    pub unsafe fn read(self) -> u64 {
        let (low, high): (u32, u32);
        unsafe {
            asm!(
                "rdmsr",
                in("ecx") self.0,
                out("eax") low,
                out("edx") high,
                options(nomem, nostack, preserves_flags),
            );
        }
        u64::from(high) << 32 | u64::from(low)
    }

    /// Writes a 64-bit value to this MSR.
    ///
    /// # Safety
    ///
    /// The caller must ensure this MSR address is valid and the value is
    /// appropriate.
    #[inline]
    pub unsafe fn write(self, value: u64) {
        let low = value as u32;
        let high = (value >> 32) as u32;
        unsafe {
            asm!(
                "wrmsr",
                in("ecx") self.0,
                in("eax") low,
                in("edx") high,
                options(nomem, nostack, preserves_flags),
            );
        }
    }
}

/// Sets `flags` in IA32_EFER.
///
/// # Safety
///
/// The processor must support every flag being set.
pub unsafe fn efer_insert(flags: EferFlags) {
    unsafe { IA32_EFER.write(IA32_EFER.read() | flags.bits()) };
}
