//! x86_64 architecture support.

pub mod cpuid;
pub mod instructions;
pub mod registers;
