use std::{
    fmt,
    os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd},
    path::PathBuf,
};

use anyhow::{bail, Result};
use log::{debug, warn};

use super::{perf, tracefs, PID_ALL};
use crate::core::probe::ProbeError;

/// Kind of user probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    /// Triggers on function entry.
    Uprobe,
    /// Triggers on function return.
    Uretprobe,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Uprobe => write!(f, "uprobe"),
            ProbeKind::Uretprobe => write!(f, "uretprobe"),
        }
    }
}

/// Everything needed to install one probe instance in the kernel.
#[derive(Clone, Debug)]
pub struct ProbeArgs {
    /// tracefs group the event is defined in. Unused by the PMU path.
    pub group: String,
    /// Symbol name; must be sanitized for the tracefs path.
    pub symbol: String,
    /// Path of the probed file.
    pub path: PathBuf,
    /// File offset of the probe.
    pub offset: u64,
    /// File offset of the reference counter, 0 if unused.
    pub ref_ctr_offset: u64,
    /// Process to trace, `PID_ALL` for all of them.
    pub pid: i32,
    /// Return probe?
    pub ret: bool,
}

impl Default for ProbeArgs {
    fn default() -> Self {
        ProbeArgs {
            group: String::new(),
            symbol: String::new(),
            path: PathBuf::new(),
            offset: 0,
            ref_ctr_offset: 0,
            pid: PID_ALL,
            ret: false,
        }
    }
}

impl ProbeArgs {
    pub fn kind(&self) -> ProbeKind {
        match self.ret {
            false => ProbeKind::Uprobe,
            true => ProbeKind::Uretprobe,
        }
    }
}

/// Kernel interface a probe event was created with, and what has to be
/// cleaned up for it.
#[derive(Debug)]
pub(crate) enum ProbeSource {
    /// Created by the `perf_uprobe` PMU; the perf event is the only resource.
    Pmu,
    /// Defined in tracefs as `<group>/<symbol>`; the definition must be
    /// removed once the perf event is closed.
    TraceFs {
        id: u64,
        group: String,
        symbol: String,
    },
}

/// A probe installed in the kernel. It owns the perf event and, for probes
/// created through tracefs, the event definition.
///
/// Resources are released by `close`, or when the object is dropped.
#[derive(Debug)]
pub struct ProbeEvent {
    kind: ProbeKind,
    /// Perf event, `None` once closed.
    fd: Option<OwnedFd>,
    source: ProbeSource,
    /// Was an eBPF program bound to the perf event?
    attached: bool,
    closed: bool,
}

impl ProbeEvent {
    pub(crate) fn new(kind: ProbeKind, fd: OwnedFd, source: ProbeSource) -> Self {
        ProbeEvent {
            kind,
            fd: Some(fd),
            source,
            attached: false,
            closed: false,
        }
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    /// Kernel assigned trace event ID, for probes created through tracefs.
    pub fn tracefs_id(&self) -> Option<u64> {
        match &self.source {
            ProbeSource::TraceFs { id, .. } => Some(*id),
            ProbeSource::Pmu => None,
        }
    }

    /// Was the probe created using tracefs (and not the PMU)?
    pub fn is_tracefs(&self) -> bool {
        matches!(self.source, ProbeSource::TraceFs { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The perf event descriptor.
    pub fn fd(&self) -> Result<BorrowedFd<'_>> {
        match &self.fd {
            Some(fd) => Ok(fd.as_fd()),
            None => bail!(ProbeError::Closed),
        }
    }

    /// Bind an eBPF program to the probe. The program starts running on the
    /// next probe hit.
    pub(crate) fn attach_bpf(&mut self, prog: BorrowedFd) -> Result<()> {
        perf::attach_bpf(self.fd()?, prog)?;
        self.attached = true;
        Ok(())
    }

    /// Release the probe: the perf event first, then the tracefs definition if
    /// any. All steps are attempted; the first error is returned. Closing an
    /// already closed probe does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut res = Ok(());

        if let Some(fd) = self.fd.take() {
            if self.attached {
                if let Err(e) = perf::disable(fd.as_fd()) {
                    res = Err(e);
                }
            }
            // Closing the perf event detaches the program from the probe.
            if let Err(e) = nix::unistd::close(fd.into_raw_fd()) {
                if res.is_ok() {
                    res = Err(ProbeError::kernel("close", e).into());
                }
            }
        }

        if let ProbeSource::TraceFs { group, symbol, .. } = &self.source {
            if let Err(e) = tracefs::close_trace_fs_probe_event(group, symbol) {
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }

        debug!("Closed {self}");
        res
    }
}

impl Drop for ProbeEvent {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to release {self}: {e}");
        }
    }
}

/// Allow nice log messages.
impl fmt::Display for ProbeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ProbeSource::Pmu => write!(f, "{} (pmu)", self.kind),
            ProbeSource::TraceFs { id, group, symbol } => {
                write!(f, "{} {group}/{symbol} (tracefs, id {id})", self.kind)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs::File;

    use super::*;

    /// A PMU-like probe event backed by /dev/null, to exercise the life cycle
    /// without privileges.
    pub(crate) fn dummy_event() -> ProbeEvent {
        ProbeEvent::new(
            ProbeKind::Uprobe,
            OwnedFd::from(File::open("/dev/null").unwrap()),
            ProbeSource::Pmu,
        )
    }

    #[test]
    fn args_kind() {
        let mut args = ProbeArgs::default();
        assert_eq!(args.pid, PID_ALL);
        assert_eq!(args.kind(), ProbeKind::Uprobe);
        args.ret = true;
        assert_eq!(args.kind(), ProbeKind::Uretprobe);
    }

    #[test]
    fn event_close() {
        let mut event = dummy_event();
        assert!(event.fd().is_ok());
        assert!(!event.is_tracefs());
        assert_eq!(event.tracefs_id(), None);
        assert_eq!(format!("{event}"), "uprobe (pmu)");

        assert!(event.close().is_ok());
        assert!(event.is_closed());
        assert_eq!(
            event.fd().unwrap_err().downcast_ref::<ProbeError>(),
            Some(&ProbeError::Closed)
        );

        // Double close is a no-op.
        assert!(event.close().is_ok());
    }
}
