//! Show the tape library inventory.

use std::path::PathBuf;

use clap::Args;

use papertape::{Changer, MtxCommand};

/// Show the tape library inventory
#[derive(Args, Debug)]
pub struct InventoryArgs {
    /// Changer device
    #[arg(long, default_value = "/dev/changer")]
    changer: PathBuf,

    /// Tape device prefix
    #[arg(long, default_value = "/dev/nst")]
    device_prefix: String,
}

pub fn run(args: InventoryArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let changer = Changer::new(Box::new(MtxCommand::new(&args.changer, &args.device_prefix)))?;
    let inventory = changer.inventory();

    let mut drives: Vec<_> = inventory.label_in_drive.iter().collect();
    drives.sort();
    for (drive, label) in drives {
        println!("drive {drive}: {label}");
    }

    let mut slots: Vec<_> = inventory
        .tape_slots
        .iter()
        .map(|(label, slot)| (*slot, label))
        .collect();
    slots.sort();
    for (slot, label) in slots {
        println!("slot {slot}: {label}");
    }
    Ok(())
}
