//! # Perf
//!
//! Thin layer over perf_event_open(2) and the perf event ioctls used to bind
//! an eBPF program to a probe.

use std::{
    mem,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

use anyhow::Result;
use libbpf_sys::{perf_event_attr, PERF_SAMPLE_RAW};
use nix::errno::Errno;

use crate::core::probe::ProbeError;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

/// pid used to target all processes.
pub const PID_ALL: i32 = -1;

/// Attributes common to all probe events: one sample per hit, raw data.
pub(crate) fn probe_attr(type_: u32, config: u64) -> perf_event_attr {
    // SAFETY: perf_event_attr is plain old data, all zeroes is its default.
    let mut attr = unsafe { mem::zeroed::<perf_event_attr>() };
    attr.type_ = type_;
    attr.size = mem::size_of::<perf_event_attr>() as u32;
    attr.config = config;
    attr.sample_type = PERF_SAMPLE_RAW as u64;
    attr.__bindgen_anon_1.sample_period = 1;
    attr.__bindgen_anon_2.wakeup_events = 1;
    attr
}

/// Open a perf event for `pid`. A specific cpu must be given when targeting
/// all processes, any cpu is used otherwise.
pub(crate) fn perf_event_open(attr: &perf_event_attr, pid: i32) -> Result<OwnedFd, Errno> {
    let cpu: libc::c_int = match pid {
        PID_ALL => 0,
        _ => -1,
    };

    // SAFETY: attr is a valid perf_event_attr whose size field matches its
    // layout. Pointers it holds outlive the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const perf_event_attr,
            pid as libc::c_int,
            cpu,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if ret < 0 {
        return Err(Errno::last());
    }

    // SAFETY: on success the syscall returns a new file descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

nix::ioctl_none!(perf_event_ioc_enable, b'$', 0);
nix::ioctl_none!(perf_event_ioc_disable, b'$', 1);
nix::ioctl_write_int!(perf_event_ioc_set_bpf, b'$', 8);

/// Bind an eBPF program to a perf event and enable the event.
pub(crate) fn attach_bpf(event: BorrowedFd, prog: BorrowedFd) -> Result<()> {
    // SAFETY: both descriptors are valid for the duration of the calls.
    unsafe { perf_event_ioc_set_bpf(event.as_raw_fd(), prog.as_raw_fd() as _) }
        .map_err(|e| ProbeError::kernel("PERF_EVENT_IOC_SET_BPF", e))?;
    unsafe { perf_event_ioc_enable(event.as_raw_fd()) }
        .map_err(|e| ProbeError::kernel("PERF_EVENT_IOC_ENABLE", e))?;
    Ok(())
}

/// Stop a perf event from triggering its program.
pub(crate) fn disable(event: BorrowedFd) -> Result<()> {
    // SAFETY: the descriptor is valid for the duration of the call.
    unsafe { perf_event_ioc_disable(event.as_raw_fd()) }
        .map_err(|e| ProbeError::kernel("PERF_EVENT_IOC_DISABLE", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_defaults() {
        let attr = probe_attr(libbpf_sys::PERF_TYPE_TRACEPOINT as u32, 42);
        assert_eq!(attr.type_, libbpf_sys::PERF_TYPE_TRACEPOINT as u32);
        assert_eq!(attr.size as usize, mem::size_of::<perf_event_attr>());
        assert_eq!(attr.config, 42);
        assert_eq!(attr.sample_type, PERF_SAMPLE_RAW as u64);
        assert_eq!(unsafe { attr.__bindgen_anon_1.sample_period }, 1);
        assert_eq!(unsafe { attr.__bindgen_anon_3.config1 }, 0);
        assert_eq!(attr.disabled(), 0);
    }
}
