//! # Probe
//!
//! Module providing a public API to attach to user space probes.

pub mod error;
// Re-export error.
pub use error::ProbeError;

pub mod user;
