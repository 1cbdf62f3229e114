//! Papertape - science data migration onto magnetic tape.
//!
//! This library drives full dump runs: it leases candidate files from the
//! shared catalog database, batches them under a capacity budget, stages
//! and queues archive units, writes them to one or two tapes behind a
//! changer, and verifies every tape against the run manifest before the
//! database is finalized.

pub mod archive;
pub mod batch;
pub mod changer;
pub mod config;
pub mod drives;
pub mod dump;
pub mod labels;
pub mod lease;
pub mod status;
pub mod verify;

pub use tape_catalog as catalog;
pub use tape_catalog::{CatalogEntry, DecodedCatalog, Manifest, ManifestEntry};

pub use archive::{Archive, LocalTransport, StagingTransport, TarCommand, UnitArchiver};
pub use batch::{ArchiveUnit, BatchPlanner, CapacityPolicy};
pub use changer::{Changer, ChangerIo, Inventory, MtxCommand, parse_inventory};
pub use config::DumpConfig;
pub use drives::{DriveIo, Drives};
pub use dump::{CleanupAction, Dump, DumpState, VerifyWorkerFactory, cleanup_action, generate_run_id};
pub use labels::{LabelStore, create_label_schema};
pub use lease::{Candidate, LeaseMarker, LeaseStore, create_file_schema};
pub use status::Status;
pub use verify::{TapeVerifyResult, VerifyJob, dump_verify, tape_self_check, verify_tapes};
