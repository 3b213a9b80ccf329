//! # Inspect
//!
//! Helpers to inspect the running kernel and what it supports.

pub mod features;
pub use features::*;

pub mod kernel_version;
pub use kernel_version::{KernelVersion, KernelVersionReq};
