use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use clap::Args;
use log::{info, warn};

use crate::{cli::SubCommandParserRunner, helpers::signals::Running};
use uplink::{
    core::{bpf::CounterMap, user::proc::Process},
    Executable, UprobeOptions,
};

/// Count the calls to functions of an executable.
#[derive(Args, Debug, Default)]
pub(crate) struct Count {
    #[arg(help = "Path of the executable or shared library")]
    pub(crate) path: PathBuf,
    #[arg(required = true, help = "Functions to count the calls of")]
    pub(crate) symbols: Vec<String>,
    #[arg(long, help = "Count function returns instead of entries")]
    pub(crate) ret: bool,
    #[arg(long, help = "Only count calls made by this process")]
    pub(crate) pid: Option<i32>,
    #[arg(
        long,
        conflicts_with = "pid",
        help = "Only count calls made by the process running this command"
    )]
    pub(crate) cmd: Option<String>,
    #[arg(
        short,
        long,
        help = "Stop counting after this many seconds (default: until interrupted)"
    )]
    pub(crate) duration: Option<u64>,
}

impl Count {
    fn pid(&self) -> Result<Option<i32>> {
        Ok(match (&self.cmd, self.pid) {
            (Some(cmd), _) => Some(Process::from_cmd(cmd)?.pid()),
            (None, Some(pid)) => Some(Process::from_pid(pid)?.pid()),
            (None, None) => None,
        })
    }
}

impl SubCommandParserRunner for Count {
    fn run(&mut self) -> Result<()> {
        let exec = Executable::open(&self.path)?;
        let opts = UprobeOptions {
            pid: self.pid()?,
            ..Default::default()
        };

        let counters = CounterMap::new(self.symbols.len() as u32)?;
        let mut links = Vec::new();
        for (slot, symbol) in self.symbols.iter().enumerate() {
            // The perf event keeps a reference on the program.
            let prog = counters.program(slot as u32)?;
            let link = match self.ret {
                false => exec.uprobe(symbol, &prog, Some(&opts))?,
                true => exec.uretprobe(symbol, &prog, Some(&opts))?,
            };
            info!("Attached to {symbol}: {link}");
            links.push(link);
        }

        let run = Running::new()?;
        let deadline = self
            .duration
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        match deadline {
            Some(_) => info!("Counting..."),
            None => info!("Counting... Press Ctrl-C to stop"),
        }
        while run.running() && deadline.map_or(true, |d| Instant::now() < d) {
            thread::sleep(Duration::from_millis(100));
        }

        // Stop counting before reporting.
        let mut failed = false;
        for link in links.iter_mut() {
            if let Err(e) = link.close() {
                warn!("Could not release {link}: {e}");
                failed = true;
            }
        }

        for (slot, symbol) in self.symbols.iter().enumerate() {
            println!("{:>12} {symbol}", counters.get(slot as u32)?);
        }

        if failed {
            bail!("Some probes could not be released");
        }
        Ok(())
    }
}
