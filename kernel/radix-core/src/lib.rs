//! Core library for the Radix page-table layer: typed addresses, kernel
//! logging, and the native instructions the table walker depends on.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod arch;
pub mod log;
pub mod mm;
