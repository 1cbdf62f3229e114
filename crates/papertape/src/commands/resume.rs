//! Re-verify and finalize a queued run after a crash.
//!
//! A run that died after its physical write leaves a queue directory with
//! the run catalog and the tape-ids file. Those two are enough to rebuild
//! the manifest, re-verify the tapes, and finish the database updates the
//! crash swallowed.

use clap::Args;
use tracing::info;

use papertape::{
    Archive, Changer, DriveIo, Drives, Dump, LabelStore, LeaseStore, LocalTransport, MtxCommand,
    TarCommand, VerifyWorkerFactory,
};

use super::SetupArgs;

/// Re-verify and finalize a queued run
#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Run id of the queued run to resume
    #[arg(long)]
    run_id: String,

    #[command(flatten)]
    setup: SetupArgs,
}

pub fn run(args: ResumeArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = args.setup.to_config();

    let lease = LeaseStore::open(&config.db_path, &args.run_id, config.version)?;
    let labels = LabelStore::open(&config.db_path)?;
    let archive = Archive::new(
        &args.run_id,
        config.version,
        &config.queue_root,
        &config.staging_root,
        Box::new(LocalTransport::new(&config.mirror_root)),
        Box::new(TarCommand),
    )?;
    let changer = Changer::new(Box::new(MtxCommand::new(
        &config.changer_dev,
        &config.device_prefix,
    )))?;
    let drives: Box<dyn DriveIo> = Box::new(Drives::new(&config.device_prefix));

    let changer_dev = config.changer_dev.clone();
    let device_prefix = config.device_prefix.clone();
    let verify_worker: VerifyWorkerFactory = Box::new(move || {
        let changer = Changer::new(Box::new(MtxCommand::new(&changer_dev, &device_prefix)))?;
        let drives: Box<dyn DriveIo> = Box::new(Drives::new(&device_prefix));
        Ok((changer, drives))
    });

    let mut dump = Dump::with_parts(
        config,
        args.run_id.clone(),
        lease,
        labels,
        archive,
        changer,
        drives,
        verify_worker,
    );
    info!(run_id = %args.run_id, "resume assembled");

    let state = dump.resume();
    dump.close_dump();

    eprintln!("resume {}: {:?}", args.run_id, state);
    for report in dump.tape_reports() {
        eprintln!("  {}: {}", report.label, report.status);
    }
    std::process::exit(state.code());
}
