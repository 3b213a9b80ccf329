//! # User-level probes
//!
//! Module providing an API to attach probes to userspace programs using
//! uprobes, through either the `perf_uprobe` PMU or tracefs.

pub mod codec;
pub use codec::{random_group, sanitize_symbol, uprobe_token};

pub(crate) mod perf;
pub use perf::PID_ALL;

pub mod pmu;
pub mod tracefs;

pub mod uprobe;
pub use uprobe::UprobeLink;

// Re-export user.rs
#[allow(clippy::module_inception)]
pub mod user;
pub use user::*;
