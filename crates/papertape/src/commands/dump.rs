//! Run a full dump.

use clap::Args;
use tracing::info;

use papertape::Dump;

use super::SetupArgs;

/// Run a full dump
#[derive(Args, Debug)]
pub struct DumpArgs {
    #[command(flatten)]
    setup: SetupArgs,
}

pub fn run(args: DumpArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = args.setup.to_config();
    let mut dump = Dump::new(config)?;
    info!(run_id = %dump.run_id(), "dump assembled");

    let state = dump.run();
    dump.close_dump();

    eprintln!("run {}: {:?}", dump.run_id(), state);
    for report in dump.tape_reports() {
        eprintln!("  {}: {}", report.label, report.status);
    }
    // The exit status is the numeric state, so operators can tell how far
    // the run got without reading logs.
    std::process::exit(state.code());
}
