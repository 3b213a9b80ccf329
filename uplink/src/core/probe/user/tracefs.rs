//! # TraceFS
//!
//! Creation of uprobes using the tracefs `uprobe_events` control file. Used
//! when the `uprobe` PMU is not available. Each probe is defined as
//! `<group>/<symbol>`, the kernel assigns it a trace event ID a perf event is
//! then opened on. The definition outlives the perf event and must be removed
//! explicitly.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};
use nix::errno::Errno;

use super::{
    codec::{random_group, sanitize_symbol, uprobe_token},
    perf::{perf_event_open, probe_attr},
    user::{ProbeArgs, ProbeEvent, ProbeSource},
};
use crate::core::{inspect, probe::ProbeError};

/// Prefix of the tracefs groups our probes are defined in.
pub const GROUP_PREFIX: &str = "uplink";

fn uprobe_events() -> Result<PathBuf> {
    Ok(inspect::tracefs()?.join("uprobe_events"))
}

fn event_dir(group: &str, symbol: &str) -> Result<PathBuf> {
    Ok(inspect::tracefs()?.join("events").join(group).join(symbol))
}

/// Kernel error number of an I/O error on a tracefs file.
fn errno(e: &io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Write a single line to a control file. Each write is a command for the
/// kernel; the file is opened in append mode so existing definitions are
/// kept.
fn write_command(file: &Path, command: &str) -> Result<(), Errno> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(file)
        .map_err(|e| errno(&e))?;
    file.write_all(command.as_bytes()).map_err(|e| errno(&e))
}

/// Build the `uprobe_events` line defining a probe.
fn definition(args: &ProbeArgs) -> String {
    format!(
        "{}:{}/{} {}",
        if args.ret { 'r' } else { 'p' },
        args.group,
        args.symbol,
        uprobe_token(args)
    )
}

/// Define the `<args.group>/<args.symbol>` uprobe in tracefs. The symbol must
/// already be sanitized. Fails with `ProbeError::AlreadyExists` if an event
/// with the same group and name is already defined.
pub fn create_trace_fs_probe_event(args: &ProbeArgs) -> Result<()> {
    if args.symbol.is_empty() || sanitize_symbol(&args.symbol) != args.symbol {
        bail!("Invalid tracefs event name '{}'", args.symbol);
    }

    // Older kernels silently accept duplicate definitions.
    if event_dir(&args.group, &args.symbol)?.exists() {
        bail!(ProbeError::AlreadyExists {
            group: args.group.clone(),
            symbol: args.symbol.clone(),
        });
    }

    let line = definition(args);
    write_command(&uprobe_events()?, &line).map_err(|e| match e {
        Errno::EEXIST => anyhow!(ProbeError::AlreadyExists {
            group: args.group.clone(),
            symbol: args.symbol.clone(),
        }),
        e => anyhow!(ProbeError::kernel("uprobe_events", e)),
    })?;

    debug!("Defined tracefs event '{line}'");
    Ok(())
}

/// Remove the `<group>/<symbol>` definition from tracefs. No perf event
/// should still be opened on it.
pub fn close_trace_fs_probe_event(group: &str, symbol: &str) -> Result<()> {
    write_command(&uprobe_events()?, &format!("-:{group}/{symbol}"))
        .map_err(|e| anyhow!(ProbeError::kernel("uprobe_events", e)))?;

    debug!("Removed tracefs event {group}/{symbol}");
    Ok(())
}

/// Kernel assigned ID of a tracefs event.
fn event_id(group: &str, symbol: &str) -> Result<u64> {
    let file = event_dir(group, symbol)?.join("id");
    let id = fs::read_to_string(&file)
        .map_err(|e| anyhow!("Could not read {}: {e}", file.display()))?;

    id.trim()
        .parse()
        .map_err(|e| anyhow!("Invalid event ID in {}: {e}", file.display()))
}

/// Install a probe using tracefs. The event is defined in a newly generated
/// group (`args.group` is not used) so concurrent users probing the same
/// symbol do not collide.
pub fn trace_fs_uprobe(args: &ProbeArgs) -> Result<ProbeEvent> {
    let mut args = args.clone();
    args.group = random_group(GROUP_PREFIX)?;

    create_trace_fs_probe_event(&args)?;

    let open = || -> Result<ProbeEvent> {
        let id = event_id(&args.group, &args.symbol)?;
        let attr = probe_attr(libbpf_sys::PERF_TYPE_TRACEPOINT as u32, id);
        let fd = perf_event_open(&attr, args.pid).map_err(|e| match e {
            Errno::ESRCH => anyhow!(ProbeError::ProcessNotFound(args.pid)),
            e => anyhow!(ProbeError::kernel("perf_event_open", e)),
        })?;

        Ok(ProbeEvent::new(
            args.kind(),
            fd,
            ProbeSource::TraceFs {
                id,
                group: args.group.clone(),
                symbol: args.symbol.clone(),
            },
        ))
    };

    match open() {
        Ok(event) => {
            debug!("Created {event} on {}", uprobe_token(&args));
            Ok(event)
        }
        Err(e) => {
            if let Err(ce) = close_trace_fs_probe_event(&args.group, &args.symbol) {
                warn!(
                    "Failed to remove tracefs event {}/{}: {ce}",
                    args.group, args.symbol
                );
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use test_case::test_case;

    use super::*;
    use crate::core::{
        probe::user::ProbeKind,
        user::exec::{
            tests::{test_executable, TEST_SYMBOL},
            UprobeOptions,
        },
    };

    fn args(ret: bool) -> ProbeArgs {
        let exec = test_executable();
        ProbeArgs {
            symbol: sanitize_symbol(TEST_SYMBOL),
            offset: exec.offset(TEST_SYMBOL, &UprobeOptions::default()).unwrap(),
            path: exec.path().to_path_buf(),
            ret,
            ..Default::default()
        }
    }

    /// Groups of ours defining an event named `symbol`.
    fn defined_groups(symbol: &str) -> Vec<String> {
        let mut groups: Vec<String> = fs::read_dir(inspect::tracefs().unwrap().join("events"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(symbol).exists())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|g| g.starts_with(&format!("{GROUP_PREFIX}_")))
            .collect();
        groups.sort();
        groups
    }

    #[test_case(false, 0, "p:grp/sym /bin/bash:0x10" ; "entry")]
    #[test_case(true, 0, "r:grp/sym /bin/bash:0x10" ; "return")]
    #[test_case(false, 0x20, "p:grp/sym /bin/bash:0x10(0x20)" ; "ref ctr")]
    fn definition_line(ret: bool, ref_ctr_offset: u64, expected: &str) {
        let args = ProbeArgs {
            group: "grp".to_string(),
            symbol: "sym".to_string(),
            path: PathBuf::from("/bin/bash"),
            offset: 0x10,
            ref_ctr_offset,
            ret,
            ..Default::default()
        };
        assert_eq!(definition(&args), expected);
    }

    #[test]
    fn io_errno() {
        assert_eq!(errno(&io::Error::from_raw_os_error(17)), Errno::EEXIST);
        assert_eq!(errno(&io::Error::other("not an os error")), Errno::EIO);
    }

    #[test]
    #[cfg_attr(not(feature = "test_cap_bpf"), ignore)]
    #[serial(uprobe)]
    fn tracefs_ids() {
        let args = args(false);

        let mut a = trace_fs_uprobe(&args).unwrap();
        let mut b = trace_fs_uprobe(&args).unwrap();
        assert_eq!(a.kind(), ProbeKind::Uprobe);
        assert!(a.is_tracefs());
        assert_ne!(a.tracefs_id().unwrap(), b.tracefs_id().unwrap());

        assert!(a.close().is_ok());
        assert!(b.close().is_ok());

        let mut r = trace_fs_uprobe(&ProbeArgs { ret: true, ..args }).unwrap();
        assert_eq!(r.kind(), ProbeKind::Uretprobe);
        assert!(r.close().is_ok());
    }

    #[test]
    #[cfg_attr(not(feature = "test_cap_bpf"), ignore)]
    #[serial(uprobe)]
    fn tracefs_duplicates() {
        let mut args = args(false);
        args.group = random_group(GROUP_PREFIX).unwrap();

        create_trace_fs_probe_event(&args).unwrap();
        assert!(event_dir(&args.group, &args.symbol).unwrap().exists());

        let err = create_trace_fs_probe_event(&args).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProbeError>(),
            Some(&ProbeError::AlreadyExists {
                group: args.group.clone(),
                symbol: args.symbol.clone(),
            })
        );

        // Same group and name, other kind.
        assert!(create_trace_fs_probe_event(&ProbeArgs {
            ret: true,
            ..args.clone()
        })
        .is_err());

        close_trace_fs_probe_event(&args.group, &args.symbol).unwrap();
        assert!(!event_dir(&args.group, &args.symbol).unwrap().exists());
    }

    #[test]
    #[cfg_attr(not(feature = "test_cap_bpf"), ignore)]
    #[serial(uprobe)]
    fn tracefs_unrelated_entries() {
        let mut a = args(false);
        a.group = random_group(GROUP_PREFIX).unwrap();
        let mut b = a.clone();
        b.group = random_group(GROUP_PREFIX).unwrap();

        create_trace_fs_probe_event(&a).unwrap();
        create_trace_fs_probe_event(&b).unwrap();

        close_trace_fs_probe_event(&a.group, &a.symbol).unwrap();
        assert!(!event_dir(&a.group, &a.symbol).unwrap().exists());
        assert!(event_dir(&b.group, &b.symbol).unwrap().exists());

        close_trace_fs_probe_event(&b.group, &b.symbol).unwrap();
    }

    #[test]
    #[cfg_attr(not(feature = "test_cap_bpf"), ignore)]
    #[serial(uprobe)]
    fn tracefs_process_not_found() {
        let args = ProbeArgs {
            pid: -2,
            ..args(false)
        };

        let before = defined_groups(&args.symbol);
        let err = trace_fs_uprobe(&args).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProbeError>(),
            Some(&ProbeError::ProcessNotFound(-2))
        );

        // The definition was rolled back.
        assert_eq!(defined_groups(&args.symbol), before);
    }

    #[test]
    fn invalid_event_name() {
        let args = ProbeArgs {
            group: "grp".to_string(),
            symbol: "not.sanitized".to_string(),
            ..Default::default()
        };
        assert!(create_trace_fs_probe_event(&args).is_err());
        assert!(create_trace_fs_probe_event(&ProbeArgs::default()).is_err());
    }
}
