use anyhow::Result;
use clap::Parser;

mod cli;
mod helpers;

use crate::{cli::UplinkCli, helpers::logger::Logger};

fn main() -> Result<()> {
    let mut cli = UplinkCli::parse();

    Logger::init(cli.main_config.log_level()?)?;

    cli.subcommand.runner().run()
}
