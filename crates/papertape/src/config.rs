//! Resolved run configuration.

use std::path::PathBuf;

use crate::batch::CapacityPolicy;

const MB: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Shared file catalog and label registry database.
    pub db_path: PathBuf,
    /// Changer device handed to mtx.
    pub changer_dev: PathBuf,
    /// Tape device prefix; drive N is `<prefix><N>`.
    pub device_prefix: String,
    /// 1 writes a single tape serially, 2 writes a pair in parallel.
    pub drive_select: u8,
    pub batch_size_mb: u64,
    pub tape_size_mb: u64,
    /// Queued archives and catalogs live under `<queue_root>/<run_id>`.
    pub queue_root: PathBuf,
    /// Staging copies live under `<staging_root>/<run_id>`.
    pub staging_root: PathBuf,
    /// Mount point the staging transport copies records from.
    pub mirror_root: PathBuf,
    /// Label series, one per tape written.
    pub label_prefixes: Vec<String>,
    /// Optional LIKE pattern narrowing candidate paths.
    pub path_filter: Option<String>,
    pub capacity_policy: CapacityPolicy,
    /// Dump format version recorded in catalogs and tape locations.
    pub version: u32,
}

impl DumpConfig {
    pub fn batch_size_bytes(&self) -> u64 {
        self.batch_size_mb * MB
    }

    pub fn tape_size_bytes(&self) -> u64 {
        self.tape_size_mb * MB
    }

    /// Label series for the tapes this run will write.
    pub fn run_label_prefixes(&self) -> &[String] {
        let count = self.drive_select.min(self.label_prefixes.len() as u8) as usize;
        &self.label_prefixes[..count]
    }
}
