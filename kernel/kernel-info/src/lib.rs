//! # Kernel configuration
//!
//! Shared layout and policy constants. Everything in here is a plain
//! compile-time constant; the assertion block at the bottom of each module
//! keeps the values mutually consistent.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
pub mod sched;
