use nix::errno::Errno;

/// Specific types of errors that resolving and attaching user probes can
/// generate. They are raised through `anyhow` and can be inspected with
/// `err.downcast_ref::<ProbeError>()`.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ProbeError {
    /// The executable path is empty, does not exist or can't be read.
    #[error("Invalid executable path: {0}")]
    InvalidPath(String),
    /// The symbol is not in the executable, or has no address in it (e.g.
    /// functions imported from a shared library).
    #[error("Symbol {0} not found or not resolvable")]
    NoSymbol(String),
    /// The running kernel lacks a feature. When returned by the PMU path,
    /// the tracefs one can be used instead.
    #[error("Not supported by the running kernel: {0}")]
    NotSupported(String),
    /// A tracefs event with the same group and name is already defined.
    #[error("Trace event {group}/{symbol} already exists")]
    AlreadyExists { group: String, symbol: String },
    /// The process the probe is scoped to does not exist.
    #[error("Process {0} not found")]
    ProcessNotFound(i32),
    /// The probe link was closed and can't be used anymore.
    #[error("Probe link is closed")]
    Closed,
    /// Any other error reported by the kernel.
    #[error("{op} failed: {errno}")]
    Kernel { op: &'static str, errno: Errno },
}

impl ProbeError {
    pub(crate) fn kernel(op: &'static str, errno: Errno) -> Self {
        ProbeError::Kernel { op, errno }
    }

    /// Returns the kernel error number behind the error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            ProbeError::AlreadyExists { .. } => Some(Errno::EEXIST),
            ProbeError::ProcessNotFound(_) => Some(Errno::ESRCH),
            ProbeError::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Context};

    use super::*;

    #[test]
    fn downcast_through_context() {
        let err = Err::<(), _>(anyhow!(ProbeError::ProcessNotFound(42)))
            .context("Could not open uprobe")
            .unwrap_err();

        assert_eq!(
            err.downcast_ref::<ProbeError>(),
            Some(&ProbeError::ProcessNotFound(42))
        );
        assert_eq!(
            err.downcast_ref::<ProbeError>().unwrap().errno(),
            Some(Errno::ESRCH)
        );
        assert_eq!(ProbeError::Closed.errno(), None);
    }
}
