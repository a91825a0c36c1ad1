//! AArch64 architecture support.

pub mod instructions;
pub mod registers;
