//! # PMU
//!
//! Creation of uprobes using the dynamic `uprobe` PMU (Linux >= 4.17). The
//! probe lives as long as its perf event, nothing has to be cleaned up
//! besides closing the descriptor.

use std::{ffi::CString, os::unix::ffi::OsStrExt};

use anyhow::{anyhow, bail, Result};
use log::debug;
use nix::errno::Errno;

use super::{
    perf::{perf_event_open, probe_attr},
    user::{ProbeArgs, ProbeEvent, ProbeSource},
};
use crate::core::{inspect, probe::ProbeError};

const UPROBE_PMU: &str = "uprobe";
/// Bits of `config` holding the reference counter offset.
const REF_CTR_OFFSET_SHIFT: u64 = 32;

/// Install a probe using the `uprobe` PMU. Fails with
/// `ProbeError::NotSupported` if the running kernel does not provide it, so
/// callers can fall back to tracefs.
pub fn pmu_uprobe(args: &ProbeArgs) -> Result<ProbeEvent> {
    // The PMU format stores it in config:32-63.
    if args.ref_ctr_offset > u32::MAX as u64 {
        bail!(
            "Reference counter offset {:#x} does not fit in 32 bits",
            args.ref_ctr_offset
        );
    }

    let r#type = match inspect::pmu_type(UPROBE_PMU)? {
        Some(t) => t,
        None => bail!(ProbeError::NotSupported("perf_uprobe PMU".to_string())),
    };

    let mut config = 0;
    if args.ret {
        config |= 1 << inspect::retprobe_bit(UPROBE_PMU)?;
    }
    if args.ref_ctr_offset != 0 {
        if !inspect::have_ref_ctr_offset_pmu() {
            bail!(ProbeError::NotSupported(
                "reference counter offsets in the uprobe PMU".to_string()
            ));
        }
        config |= args.ref_ctr_offset << REF_CTR_OFFSET_SHIFT;
    }

    let path = CString::new(args.path.as_os_str().as_bytes())
        .map_err(|_| anyhow!(ProbeError::InvalidPath(args.path.display().to_string())))?;

    let mut attr = probe_attr(r#type, config);
    // The path must outlive the syscall, it is only borrowed by the kernel
    // while the event is created.
    attr.__bindgen_anon_3.uprobe_path = path.as_ptr() as u64;
    attr.__bindgen_anon_4.probe_offset = args.offset;

    let fd = perf_event_open(&attr, args.pid).map_err(|e| match e {
        Errno::ESRCH => anyhow!(ProbeError::ProcessNotFound(args.pid)),
        e => anyhow!(ProbeError::kernel("perf_event_open", e)),
    })?;

    debug!(
        "Created {} {} on {}:{:#x} (pmu, pid {})",
        args.kind(),
        args.symbol,
        args.path.display(),
        args.offset,
        args.pid
    );

    Ok(ProbeEvent::new(args.kind(), fd, ProbeSource::Pmu))
}
