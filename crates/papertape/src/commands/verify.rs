//! Verify tapes against a queued run catalog.

use std::fs;
use std::path::PathBuf;

use clap::Args;
use tracing::info;

use papertape::{
    Changer, DriveIo, Drives, DumpState, MtxCommand, VerifyJob, catalog, verify_tapes,
};

/// Verify tapes against a queued run catalog
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Run id whose queued catalog to verify against
    #[arg(long)]
    run_id: String,

    /// Tape label to check; repeat for a pair, drives assigned in order
    #[arg(long = "label", required = true)]
    labels: Vec<String>,

    /// Changer device
    #[arg(long, default_value = "/dev/changer")]
    changer: PathBuf,

    /// Tape device prefix
    #[arg(long, default_value = "/dev/nst")]
    device_prefix: String,

    /// Queue directory root
    #[arg(long, default_value = "/papertape/queue")]
    queue_root: PathBuf,
}

pub fn run(args: VerifyArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let catalog_path = args
        .queue_root
        .join(&args.run_id)
        .join(format!("paper.{}.list", args.run_id));
    info!(?catalog_path, "loading queued catalog");
    let text = fs::read_to_string(&catalog_path)?;
    let manifest = catalog::decode(text.lines()).to_manifest();

    let mut jobs = Vec::with_capacity(args.labels.len());
    for (drive, label) in args.labels.iter().enumerate() {
        let changer = Changer::new(Box::new(MtxCommand::new(&args.changer, &args.device_prefix)))?;
        let drives: Box<dyn DriveIo> = Box::new(Drives::new(&args.device_prefix));
        jobs.push(VerifyJob {
            label: label.clone(),
            drive: drive as u8,
            changer,
            drives,
        });
    }

    let results = verify_tapes(jobs, &manifest, &args.run_id);
    let mut all_ok = true;
    for result in &results {
        println!("{}: {}", result.label, result.status);
        all_ok &= result.status.is_ok();
    }
    if !all_ok {
        std::process::exit(DumpState::DumpVerifyFail.code());
    }
    Ok(())
}
