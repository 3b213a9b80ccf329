//! # uplink
//!
//! Attach eBPF programs to functions of user space executables and shared
//! libraries, without modifying them.
//!
//! A function is looked up by name in the ELF symbol tables of an
//! [`Executable`], then a uprobe is installed at the resulting file offset,
//! either through the `perf_uprobe` PMU or, on kernels lacking it, through the
//! tracefs `uprobe_events` interface. The returned [`UprobeLink`] owns every
//! kernel resource involved and releases them on close.
//!
//! ```no_run
//! use uplink::{core::bpf::CounterMap, Executable};
//!
//! let counters = CounterMap::new(1)?;
//! let prog = counters.program(0)?;
//!
//! let bash = Executable::open("/bin/bash")?;
//! let mut link = bash.uprobe("readline", &prog, None)?;
//! // ...
//! link.close()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod core;

pub use crate::core::{
    probe::{
        user::{ProbeEvent, ProbeKind, UprobeLink},
        ProbeError,
    },
    user::exec::{Executable, UprobeOptions},
};
