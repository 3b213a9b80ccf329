//! # BPF
//!
//! In-crate eBPF programs, loaded without an object file.

pub mod counter;
pub use counter::*;
