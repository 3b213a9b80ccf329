//! Process
//!
//! Module providing process searching capabilities, to scope probes to a
//! running process.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Result};

/// Max length of a command name as reported in `/proc/<pid>/comm`.
const COMM_LEN: usize = 15;

/// Specific types of errors that Process can generate.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ProcessError {
    /// Emitted when the process was not found.
    #[error("Process not found")]
    NotFound,
    /// Emitted when there were too many processes matching input parameters.
    #[error("Too many processes found")]
    TooMany,
}

/// A running process.
#[derive(Debug)]
pub struct Process {
    /// Process id
    pid: i32,
    /// Path of the executable the process is running.
    path: PathBuf,
}

impl Process {
    /// Create a new Process object with a specific pid
    pub fn from_pid(pid: i32) -> Result<Process> {
        if pid <= 0 {
            bail!(ProcessError::NotFound);
        }

        let proc_dir = PathBuf::from("/proc").join(pid.to_string());
        if !proc_dir.exists() {
            bail!(ProcessError::NotFound);
        }

        let path = proc_dir
            .join("exe")
            .read_link()
            .map_err(|e| anyhow!("Cannot open executable path for process {pid}: {e}"))?;

        Ok(Process { pid, path })
    }

    /// Create a new Process object with a specific cmd.
    pub fn from_cmd(cmd: &str) -> Result<Process> {
        let cmd: String = cmd.chars().take(COMM_LEN).collect();
        let mut pid = None;

        // Look in /proc for a process with this cmd.
        for entry in Path::new("/proc/").read_dir()? {
            let entry = entry?;
            let Some(entry_pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };

            // Processes can exit while we look at them.
            match fs::read_to_string(entry.path().join("comm")) {
                Ok(comm) if comm.trim_end_matches('\n') == cmd => (),
                _ => continue,
            }

            // Return a specific error indicating there are more than once
            // process with this cmd so that the user can decide which one to
            // probe.
            if pid.is_some() {
                bail!(ProcessError::TooMany);
            }
            pid = Some(entry_pid);
        }

        match pid {
            Some(pid) => Process::from_pid(pid),
            None => bail!(ProcessError::NotFound),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.pid, self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    #[test]
    fn process_create() -> Result<()> {
        let p = Process::from_pid(std::process::id() as i32)?;
        assert_eq!(p.path(), env::current_exe()?);

        let p = Process::from_pid(-1);
        assert!(
            p.is_err()
                && p.unwrap_err().downcast_ref::<ProcessError>() == Some(&ProcessError::NotFound)
        );
        Ok(())
    }

    #[test]
    fn process_from_cmd() -> Result<()> {
        // Our own command name, as truncated by the kernel.
        let comm = fs::read_to_string("/proc/self/comm")?;
        let p = Process::from_cmd(comm.trim_end_matches('\n'));
        // Other instances of the test binary might be running.
        assert!(
            (p.is_err()
                && p.as_ref().unwrap_err().downcast_ref::<ProcessError>()
                    == Some(&ProcessError::TooMany))
                || p.is_ok()
        );

        let p = Process::from_cmd("_no_way_a_process_with_this_cmd_exists__");
        assert!(
            p.is_err()
                && p.unwrap_err().downcast_ref::<ProcessError>() == Some(&ProcessError::NotFound)
        );
        Ok(())
    }
}
