use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::cli::SubCommandParserRunner;
use uplink::Executable;

/// List the function symbols of an executable.
#[derive(Args, Debug, Default)]
pub(crate) struct Symbols {
    #[arg(help = "Path of the executable or shared library")]
    pub(crate) path: PathBuf,
    #[arg(
        short,
        long,
        help = "Only list symbols whose name contains the given string"
    )]
    pub(crate) filter: Option<String>,
}

impl SubCommandParserRunner for Symbols {
    fn run(&mut self) -> Result<()> {
        let exec = Executable::open(&self.path)?;

        exec.symbols()?
            .iter()
            .filter(|(name, _, _)| match &self.filter {
                Some(filter) => name.contains(filter.as_str()),
                None => true,
            })
            .for_each(|(name, offset, size)| println!("{offset:#018x} {size:>8} {name}"));
        Ok(())
    }
}
