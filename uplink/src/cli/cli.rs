//! # Cli
//!
//! Main configuration and subcommand dispatch.

use anyhow::{bail, Result};
use clap::{builder::PossibleValuesParser, Args, Parser, Subcommand};
use log::LevelFilter;

use super::cmd::{Count, Inspect, Resolve, Symbols};

/// SubCommandParserRunner defines the common interface to run subcommands.
pub(crate) trait SubCommandParserRunner {
    /// Run the subcommand.
    fn run(&mut self) -> Result<()>;
}

/// Options shared by all subcommands.
#[derive(Args, Debug, Default)]
pub(crate) struct MainConfig {
    #[arg(
        long,
        global = true,
        value_parser=PossibleValuesParser::new(["error", "warn", "info", "debug", "trace"]),
        default_value = "info",
        help = "Log level",
    )]
    pub(crate) log_level: String,
}

impl MainConfig {
    pub(crate) fn log_level(&self) -> Result<LevelFilter> {
        Ok(match self.log_level.as_str() {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            x => bail!("Invalid log_level: {}", x),
        })
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum SubCommands {
    /// List the function symbols of an executable.
    Symbols(Symbols),
    /// Resolve a symbol to the file offset a probe would be installed at.
    Resolve(Resolve),
    /// Count the calls to functions of an executable.
    Count(Count),
    /// Report the uprobe related capabilities of the running kernel.
    Inspect(Inspect),
}

impl SubCommands {
    /// Return the runner of the subcommand that was selected.
    pub(crate) fn runner(&mut self) -> &mut dyn SubCommandParserRunner {
        match self {
            SubCommands::Symbols(cmd) => cmd,
            SubCommands::Resolve(cmd) => cmd,
            SubCommands::Count(cmd) => cmd,
            SubCommands::Inspect(cmd) => cmd,
        }
    }
}

/// Attach probes to user space functions
///
/// uplink resolves functions of executables and shared libraries and attaches
/// eBPF programs to them using uprobes.
#[derive(Parser, Debug)]
#[command(
    name = "uplink",
    version,
    disable_help_subcommand = true,
    infer_subcommands = true
)]
pub(crate) struct UplinkCli {
    #[command(flatten)]
    pub(crate) main_config: MainConfig,
    #[command(subcommand)]
    pub(crate) subcommand: SubCommands,
}

/// Parse a number given either in decimal or in hexadecimal (0x prefix).
pub(crate) fn parse_number(s: &str) -> Result<u64> {
    Ok(match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    })
}

/// Parse a file offset. 0 means "no offset" for the resolver and is rejected.
pub(crate) fn parse_file_offset(s: &str) -> Result<u64> {
    match parse_number(s)? {
        0 => bail!("File offset must not be 0"),
        offset => Ok(offset),
    }
}
