use anyhow::Result;
use clap::Args;

use crate::cli::SubCommandParserRunner;
use uplink::core::inspect::{
    have_ref_ctr_offset_pmu, pmu_type, retprobe_bit, tracefs, KernelVersion,
};

/// Report the uprobe related capabilities of the running kernel.
#[derive(Args, Debug, Default)]
pub(crate) struct Inspect {}

impl SubCommandParserRunner for Inspect {
    fn run(&mut self) -> Result<()> {
        println!("kernel: {}", KernelVersion::current()?);

        match pmu_type("uprobe")? {
            Some(r#type) => {
                println!("uprobe pmu: type {}", r#type);
                match retprobe_bit("uprobe") {
                    Ok(bit) => println!("uprobe pmu retprobe: config bit {bit}"),
                    Err(e) => println!("uprobe pmu retprobe: not available ({e})"),
                }
                println!("uprobe pmu ref_ctr_offset: {}", have_ref_ctr_offset_pmu());
            }
            None => println!("uprobe pmu: not available"),
        }

        match tracefs() {
            Ok(path) => println!("tracefs: {}", path.display()),
            Err(e) => println!("tracefs: not available ({e})"),
        }
        Ok(())
    }
}
