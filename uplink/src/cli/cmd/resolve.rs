use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::cli::{parse_file_offset, parse_number, SubCommandParserRunner};
use uplink::{
    core::probe::user::{uprobe_token, ProbeArgs},
    Executable, UprobeOptions,
};

/// Resolve a symbol to the file offset a probe would be installed at.
#[derive(Args, Debug, Default)]
pub(crate) struct Resolve {
    #[arg(help = "Path of the executable or shared library")]
    pub(crate) path: PathBuf,
    #[arg(help = "Symbol to resolve")]
    pub(crate) symbol: String,
    #[arg(
        long,
        value_parser = parse_file_offset,
        help = "Use this file offset instead of the symbol's one (must not be 0)"
    )]
    pub(crate) offset: Option<u64>,
    #[arg(
        long,
        value_parser = parse_number,
        help = "Offset to add to the resolved address"
    )]
    pub(crate) relative_offset: Option<u64>,
}

impl SubCommandParserRunner for Resolve {
    fn run(&mut self) -> Result<()> {
        let exec = Executable::open(&self.path)?;
        let opts = UprobeOptions {
            offset: self.offset.unwrap_or_default(),
            relative_offset: self.relative_offset.unwrap_or_default(),
            ..Default::default()
        };

        let offset = exec.offset(&self.symbol, &opts)?;
        let args = ProbeArgs {
            path: exec.path().to_path_buf(),
            offset,
            ..Default::default()
        };
        println!("{}", uprobe_token(&args));
        Ok(())
    }
}
