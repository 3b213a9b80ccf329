//! # Uprobe
//!
//! Attaching eBPF programs to functions of an executable. Probes are created
//! using the `uprobe` PMU when available, tracefs otherwise.

use std::{fmt, os::fd::AsFd};

use anyhow::{bail, Result};
use log::debug;

use super::{
    codec::sanitize_symbol,
    pmu::pmu_uprobe,
    tracefs::trace_fs_uprobe,
    user::{ProbeArgs, ProbeEvent, ProbeKind},
    PID_ALL,
};
use crate::core::{
    inspect,
    probe::ProbeError,
    user::exec::{Executable, UprobeOptions},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkState {
    Unattached,
    Attached,
    Closed,
}

/// Handle on a user probe, optionally running an eBPF program.
///
/// A link goes through `Unattached -> Attached -> Closed`; a closed link can't
/// be attached again. Dropping the link releases the probe.
#[derive(Debug)]
pub struct UprobeLink {
    event: ProbeEvent,
    state: LinkState,
}

impl UprobeLink {
    fn new(event: ProbeEvent) -> Self {
        UprobeLink {
            event,
            state: LinkState::Unattached,
        }
    }

    /// Bind an eBPF program (e.g. a `libbpf_rs::Program`) to the probe. The
    /// program runs on every probe hit from now on.
    pub fn attach<P: AsFd>(&mut self, prog: &P) -> Result<()> {
        match self.state {
            LinkState::Closed => bail!(ProbeError::Closed),
            LinkState::Attached => bail!("A program is already attached to {}", self.event),
            LinkState::Unattached => (),
        }

        self.event.attach_bpf(prog.as_fd())?;
        self.state = LinkState::Attached;

        debug!("Attached program to {}", self.event);
        Ok(())
    }

    /// Release the probe. Closing an already closed link does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.state == LinkState::Closed {
            return Ok(());
        }
        self.state = LinkState::Closed;
        self.event.close()
    }

    pub fn is_attached(&self) -> bool {
        self.state == LinkState::Attached
    }

    pub fn is_closed(&self) -> bool {
        self.state == LinkState::Closed
    }

    /// The underlying probe.
    pub fn event(&self) -> &ProbeEvent {
        &self.event
    }

    pub fn kind(&self) -> ProbeKind {
        self.event.kind()
    }
}

impl fmt::Display for UprobeLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event)
    }
}

impl Executable {
    /// Attach `prog` to the entry of `symbol`.
    ///
    /// The probe is installed at the symbol's offset, which `opts` can change
    /// (see `UprobeOptions`). By default all processes running the executable
    /// are traced.
    pub fn uprobe<P: AsFd>(
        &self,
        symbol: &str,
        prog: &P,
        opts: Option<&UprobeOptions>,
    ) -> Result<UprobeLink> {
        self.attach(symbol, prog, opts, false)
    }

    /// Attach `prog` to the return of `symbol`. See `Executable::uprobe`.
    ///
    /// Return probes replace the return address on the stack: they must not
    /// be used on functions whose caller inspects the stack.
    pub fn uretprobe<P: AsFd>(
        &self,
        symbol: &str,
        prog: &P,
        opts: Option<&UprobeOptions>,
    ) -> Result<UprobeLink> {
        self.attach(symbol, prog, opts, true)
    }

    fn attach<P: AsFd>(
        &self,
        symbol: &str,
        prog: &P,
        opts: Option<&UprobeOptions>,
        ret: bool,
    ) -> Result<UprobeLink> {
        let mut link = self.open_uprobe(symbol, opts, ret)?;
        // On failure the link is dropped, which releases the probe.
        link.attach(prog)?;
        Ok(link)
    }

    /// Install a probe on `symbol` without binding any program to it. Use
    /// `UprobeLink::attach` to do so.
    pub fn open_uprobe(
        &self,
        symbol: &str,
        opts: Option<&UprobeOptions>,
        ret: bool,
    ) -> Result<UprobeLink> {
        let default = UprobeOptions::default();
        let opts = opts.unwrap_or(&default);

        let offset = self.offset(symbol, opts)?;

        if opts.ref_ctr_offset != 0 && !inspect::have_ref_ctr_offset_pmu() {
            bail!(ProbeError::NotSupported(
                "uprobe reference counter offsets".to_string()
            ));
        }

        let args = ProbeArgs {
            symbol: symbol.to_string(),
            path: self.path().to_path_buf(),
            offset,
            ref_ctr_offset: opts.ref_ctr_offset,
            pid: opts.pid.unwrap_or(PID_ALL),
            ret,
            ..Default::default()
        };

        let event = match pmu_uprobe(&args) {
            Ok(event) => event,
            Err(e) if is_not_supported(&e) => {
                debug!("Falling back to tracefs for {symbol}: {e}");
                trace_fs_uprobe(&ProbeArgs {
                    symbol: sanitize_symbol(symbol),
                    ..args
                })?
            }
            Err(e) => return Err(e),
        };

        Ok(UprobeLink::new(event))
    }
}

fn is_not_supported(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ProbeError>(),
        Some(ProbeError::NotSupported(_))
    )
}
