//! CLI subcommands.

use std::path::PathBuf;

use clap::Args;

use papertape::{CapacityPolicy, DumpConfig};

pub mod catalog;
pub mod dump;
pub mod inventory;
pub mod resume;
pub mod verify;

/// Deployment settings shared by the run-shaped commands.
#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Shared catalog and label database
    #[arg(long, default_value = "/papertape/papertape.db")]
    db: PathBuf,

    /// Changer device
    #[arg(long, default_value = "/dev/changer")]
    changer: PathBuf,

    /// Tape device prefix; drive N is <prefix>N
    #[arg(long, default_value = "/dev/nst")]
    device_prefix: String,

    /// Number of drives to write: 1 for a single tape, 2 for a pair
    #[arg(long, default_value_t = 2)]
    drive_select: u8,

    /// Per-batch size in MB
    #[arg(long, default_value_t = 5000)]
    batch_size_mb: u64,

    /// Run capacity in MB
    #[arg(long, default_value_t = 1_536_000)]
    tape_size_mb: u64,

    /// Queue directory root
    #[arg(long, default_value = "/papertape/queue")]
    queue_root: PathBuf,

    /// Staging directory root
    #[arg(long, default_value = "/papertape/shm")]
    staging_root: PathBuf,

    /// Mount point records are staged from
    #[arg(long, default_value = "/papertape")]
    mirror_root: PathBuf,

    /// Label series, one per tape written
    #[arg(long = "label-prefix", default_values_t = [String::from("PAPR1"), String::from("PAPR2")])]
    label_prefixes: Vec<String>,

    /// SQL LIKE pattern narrowing candidate paths
    #[arg(long)]
    path_filter: Option<String>,

    /// Keep batching until the budget is exhausted instead of stopping
    /// once a whole batch might not fit
    #[arg(long)]
    strict_fill: bool,

    /// Dump format version
    #[arg(long, default_value_t = 1)]
    version: u32,
}

impl SetupArgs {
    pub fn to_config(&self) -> DumpConfig {
        DumpConfig {
            db_path: self.db.clone(),
            changer_dev: self.changer.clone(),
            device_prefix: self.device_prefix.clone(),
            drive_select: self.drive_select,
            batch_size_mb: self.batch_size_mb,
            tape_size_mb: self.tape_size_mb,
            queue_root: self.queue_root.clone(),
            staging_root: self.staging_root.clone(),
            mirror_root: self.mirror_root.clone(),
            label_prefixes: self.label_prefixes.clone(),
            path_filter: self.path_filter.clone(),
            capacity_policy: if self.strict_fill {
                CapacityPolicy::StrictFill
            } else {
                CapacityPolicy::Conservative
            },
            version: self.version,
        }
    }
}
