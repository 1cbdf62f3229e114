//! Tape verification.
//!
//! A written tape is never trusted from the database side alone: the
//! catalog is re-derived from the tape's own first block and a random
//! member of every archive unit is re-hashed live off tape. Sampling one
//! member per unit trades completeness for tape time; a full-content
//! check would cost another complete pass per tape.

use std::collections::BTreeMap;
use std::thread;

use rand::prelude::IndexedRandom;
use tracing::{debug, info, warn};

use tape_catalog::{self as catalog, DecodedCatalog, Manifest};

use crate::changer::Changer;
use crate::drives::DriveIo;
use crate::status::Status;

/// Everything re-derived from one tape.
#[derive(Debug)]
pub struct TapeCheck {
    pub status: Status,
    pub catalog: DecodedCatalog,
}

/// Outcome of verifying one tape of a run.
#[derive(Debug)]
pub struct TapeVerifyResult {
    pub label: String,
    pub status: Status,
}

/// One tape's worth of verification context. Each worker owns its own
/// changer and drive handles so dual-tape checks share nothing.
pub struct VerifyJob {
    pub label: String,
    pub drive: u8,
    pub changer: Changer,
    pub drives: Box<dyn DriveIo>,
}

/// Load a tape, re-derive its catalog, and spot-check one random member
/// of every archive unit against the catalog's digests.
pub fn tape_self_check(
    changer: &mut Changer,
    drives: &dyn DriveIo,
    label: &str,
    drive: u8,
    run_id: &str,
) -> TapeCheck {
    info!(label, drive, "self check");
    if !changer.load_tape_drive(label, drive) {
        return TapeCheck {
            status: Status::LoadFailed,
            catalog: DecodedCatalog::default(),
        };
    }

    let lines = match drives.read_block(drive) {
        Ok(lines) => lines,
        Err(err) => {
            warn!(label, %err, "catalog block read failed");
            return TapeCheck {
                status: Status::Unknown,
                catalog: DecodedCatalog::default(),
            };
        }
    };
    let decoded = catalog::decode(&lines);
    debug!(
        label,
        entries = decoded.entries.len(),
        run_id = %decoded.run_id,
        "catalog block decoded"
    );

    // The tape names its own run; fall back to the caller's only when the
    // header did not survive.
    let tape_run_id = if decoded.run_id.is_empty() {
        run_id.to_string()
    } else {
        decoded.run_id.clone()
    };

    // Units in ascending order: each hash advances the tape one file mark,
    // so the walk has to follow the physical layout.
    let mut paths_by_unit: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for entry in &decoded.entries {
        paths_by_unit
            .entry(entry.unit_index)
            .or_default()
            .push(entry.path.clone());
    }

    let mut rng = rand::rng();
    for (unit_index, paths) in &paths_by_unit {
        let Some(path) = paths.choose(&mut rng) else {
            continue;
        };
        debug!(label, unit_index, path, "spot checking");
        let found = match drives.content_hash_at(drive, &tape_run_id, *unit_index, path) {
            Ok(found) => found,
            Err(err) => {
                warn!(label, unit_index, path, %err, "hash read failed");
                return TapeCheck {
                    status: Status::ContentHashMismatch {
                        unit_index: *unit_index,
                        path: path.to_string(),
                    },
                    catalog: decoded,
                };
            }
        };
        match decoded.hash_by_path.get(path) {
            Some(expected) if *expected == found => {
                debug!(label, unit_index, path, "digest matches");
            }
            expected => {
                warn!(label, unit_index, path, found, ?expected, "digest mismatch");
                return TapeCheck {
                    status: Status::ContentHashMismatch {
                        unit_index: *unit_index,
                        path: path.to_string(),
                    },
                    catalog: decoded,
                };
            }
        }
    }

    TapeCheck {
        status: Status::Ok,
        catalog: decoded,
    }
}

/// Self-check a tape and compare the re-derived catalog against the run's
/// manifest, field by field.
///
/// Every mismatched field is reported; later comparisons escalate the
/// returned status, so all discrepancies surface in the log even though a
/// single status comes back.
pub fn dump_verify(
    changer: &mut Changer,
    drives: &dyn DriveIo,
    label: &str,
    drive: u8,
    manifest: &Manifest,
    run_id: &str,
) -> Status {
    let check = tape_self_check(changer, drives, label, drive, run_id);
    if !check.status.is_ok() {
        return check.status;
    }

    let mut status = Status::Ok;

    if check.catalog.last_item_index != manifest.last_item_index() {
        warn!(
            label,
            on_tape = check.catalog.last_item_index,
            in_run = manifest.last_item_index(),
            "item count differs"
        );
        status = Status::ItemIndexMismatch;
    }
    if check.catalog.entries != manifest.locations() {
        warn!(label, "catalog entries differ");
        status = Status::CatalogMismatch;
    }
    if check.catalog.hash_by_path != manifest.hash_by_path() {
        warn!(label, "content digests differ");
        status = Status::HashMismatch;
    }
    if check.catalog.run_id != run_id {
        warn!(label, on_tape = %check.catalog.run_id, in_run = run_id, "run id differs");
        status = Status::RunIdMismatch;
    }

    if status.is_ok() {
        info!(label, "tape verified");
    }
    status
}

/// Verify each tape on its own worker and gather the per-tape results.
///
/// Workers are joined before aggregation; the caller fails the run if any
/// result is not ok, and every tape's reason stays retrievable.
pub fn verify_tapes(jobs: Vec<VerifyJob>, manifest: &Manifest, run_id: &str) -> Vec<TapeVerifyResult> {
    thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|mut job| {
                let label = job.label.clone();
                let handle = scope.spawn(move || {
                    let status = dump_verify(
                        &mut job.changer,
                        job.drives.as_ref(),
                        &job.label,
                        job.drive,
                        manifest,
                        run_id,
                    );
                    TapeVerifyResult {
                        label: job.label,
                        status,
                    }
                });
                (label, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(label, handle)| {
                handle.join().unwrap_or_else(move |_| {
                    warn!(label, "verify worker panicked");
                    TapeVerifyResult {
                        label,
                        status: Status::Unknown,
                    }
                })
            })
            .collect()
    })
}
