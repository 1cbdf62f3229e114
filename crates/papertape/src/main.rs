use clap::{Parser, Subcommand};
use lloggs::LoggingArgs;

mod commands;

#[derive(Parser)]
#[command(name = "papertape")]
#[command(about = "Dump science data to tape pairs")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full dump
    Dump(commands::dump::DumpArgs),
    /// Verify tapes against a queued run catalog
    Verify(commands::verify::VerifyArgs),
    /// Re-verify and finalize a queued run after a crash
    Resume(commands::resume::ResumeArgs),
    /// Show the tape library inventory
    Inventory(commands::inventory::InventoryArgs),
    /// Decode and summarize a catalog file
    Catalog(commands::catalog::CatalogArgs),
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let _guard = args.logging.setup(|v| match v {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })?;

    match args.command {
        Command::Dump(args) => commands::dump::run(args),
        Command::Verify(args) => commands::verify::run(args),
        Command::Resume(args) => commands::resume::run(args),
        Command::Inventory(args) => commands::inventory::run(args),
        Command::Catalog(args) => commands::catalog::run(args),
    }
}
