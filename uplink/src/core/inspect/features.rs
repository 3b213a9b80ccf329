//! # Features
//!
//! Discovery of the kernel interfaces user probes rely on: the dynamic
//! `uprobe` PMU exposed in sysfs and the tracefs mount point.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Result};
use log::debug;
use once_cell::sync::OnceCell;

use crate::core::probe::ProbeError;

/// Directory holding the dynamic PMU definitions.
const PMU_DIR: &str = "/sys/bus/event_source/devices";
/// Known tracefs mount points, by order of preference.
const TRACEFS_PATHS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

static TRACEFS: OnceCell<PathBuf> = OnceCell::new();
static REF_CTR_OFFSET_PMU: OnceCell<bool> = OnceCell::new();

/// Returns the type of a dynamic PMU (e.g. "uprobe"), to be used in
/// `perf_event_attr.type`. `None` is returned when the kernel does not provide
/// it.
pub fn pmu_type(pmu: &str) -> Result<Option<u32>> {
    let file = Path::new(PMU_DIR).join(pmu).join("type");
    let content = match fs::read_to_string(&file) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => bail!("Could not read {}: {e}", file.display()),
    };

    Ok(Some(content.trim().parse().map_err(|e| {
        anyhow!("Invalid PMU type in {}: {e}", file.display())
    })?))
}

/// Returns the `config` bit used to request a return probe from a dynamic
/// PMU.
pub fn retprobe_bit(pmu: &str) -> Result<u32> {
    let file = Path::new(PMU_DIR)
        .join(pmu)
        .join("format")
        .join("retprobe");
    let content = fs::read_to_string(&file).map_err(|e| {
        anyhow!(ProbeError::NotSupported(format!(
            "{pmu} return probes ({}: {e})",
            file.display()
        )))
    })?;
    parse_format_bit(&content)
}

/// Parse a PMU format description of a single bit, e.g. `config:0`.
fn parse_format_bit(format: &str) -> Result<u32> {
    let format = format.trim();
    let bit = format
        .strip_prefix("config:")
        .ok_or_else(|| anyhow!("Unexpected PMU format: {format}"))?;
    let bit: u32 = bit
        .parse()
        .map_err(|e| anyhow!("Unexpected PMU format bit in {format}: {e}"))?;
    if bit >= u64::BITS {
        bail!("PMU format bit out of range: {format}");
    }
    Ok(bit)
}

/// Does the `uprobe` PMU accept reference counter offsets (Linux >= 4.20)?
pub fn have_ref_ctr_offset_pmu() -> bool {
    *REF_CTR_OFFSET_PMU.get_or_init(|| {
        Path::new(PMU_DIR)
            .join("uprobe/format/ref_ctr_offset")
            .exists()
    })
}

/// Returns the tracefs mount point. Only mount points providing uprobe events
/// are considered.
pub fn tracefs() -> Result<&'static Path> {
    TRACEFS
        .get_or_try_init(|| {
            let path = TRACEFS_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.join("uprobe_events").exists())
                .ok_or_else(|| {
                    anyhow!(ProbeError::NotSupported(format!(
                        "tracefs uprobe_events (tried {})",
                        TRACEFS_PATHS.join(", ")
                    )))
                })?;
            debug!("Using tracefs at {}", path.display());
            Ok(path)
        })
        .map(PathBuf::as_path)
}
