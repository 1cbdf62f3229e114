//! The dump run state machine.
//!
//! A run moves through a fixed forward sequence of states: claim records,
//! queue them to disk, write tapes, verify tapes. The state is a
//! high-water mark; it never moves backwards, and any stage fault lands
//! the run in that stage's failure state instead of advancing. Cleanup
//! dispatches on the high-water mark alone, so a crash anywhere leaves a
//! well-defined recovery obligation.

use std::path::Path;

use jiff::Zoned;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use tape_catalog::Manifest;

use crate::archive::{Archive, ArchiveError, LocalTransport, TarCommand};
use crate::batch::{ArchiveUnit, BatchPlanner};
use crate::changer::{Changer, ChangerError, MtxCommand};
use crate::config::DumpConfig;
use crate::drives::{DriveIo, Drives};
use crate::labels::{LabelError, LabelStore};
use crate::lease::{LeaseError, LeaseStore};
use crate::verify::{self, TapeVerifyResult, VerifyJob};

/// Run states. The numeric code is the process exit status, so an
/// operator can tell from the exit alone how far a run got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    Initialize,
    DumpList,
    DumpQueue,
    DumpWrite,
    DumpVerify,
    DumpListFail,
    DumpQueueFail,
    DumpWriteFail,
    DumpVerifyFail,
}

impl DumpState {
    pub fn code(self) -> i32 {
        match self {
            DumpState::Initialize => 0,
            DumpState::DumpList => 1,
            DumpState::DumpQueue => 2,
            DumpState::DumpWrite => 3,
            DumpState::DumpVerify => 4,
            DumpState::DumpListFail => 11,
            DumpState::DumpQueueFail => 12,
            DumpState::DumpWriteFail => 13,
            DumpState::DumpVerifyFail => 14,
        }
    }

    /// Position in the forward sequence; failure states do not advance
    /// the high-water mark.
    fn rank(self) -> u8 {
        match self {
            DumpState::Initialize => 0,
            DumpState::DumpList => 1,
            DumpState::DumpQueue => 2,
            DumpState::DumpWrite => 3,
            DumpState::DumpVerify => 4,
            DumpState::DumpListFail
            | DumpState::DumpQueueFail
            | DumpState::DumpWriteFail
            | DumpState::DumpVerifyFail => 0,
        }
    }
}

/// What `close_dump` owes for a given high-water state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    Nothing,
    UnclaimFiles,
}

/// Cleanup is a pure function of the highest state reached, not of the
/// specific failure. Only the claim state unclaims: once records are
/// queued to disk or written to tape, an automatic unclaim would orphan
/// the staged data, so later states leave the leases for an operator.
pub fn cleanup_action(reached: DumpState) -> CleanupAction {
    match reached {
        DumpState::Initialize => CleanupAction::Nothing,
        DumpState::DumpList => CleanupAction::UnclaimFiles,
        DumpState::DumpQueue | DumpState::DumpWrite | DumpState::DumpVerify => {
            CleanupAction::Nothing
        }
        DumpState::DumpListFail
        | DumpState::DumpQueueFail
        | DumpState::DumpWriteFail
        | DumpState::DumpVerifyFail => CleanupAction::Nothing,
    }
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Changer(#[from] ChangerError),
}

/// Builds an independent changer and drive handle for each verify worker.
pub type VerifyWorkerFactory = Box<dyn Fn() -> Result<(Changer, Box<dyn DriveIo>), ChangerError>>;

/// Run id: pid plus a random suffix, so retries on one host stay apart.
pub fn generate_run_id() -> String {
    format!(
        "{:06}{:03}",
        std::process::id() % 1_000_000,
        rand::rng().random_range(1..=999)
    )
}

fn date_stamp() -> String {
    Zoned::now().strftime("%Y%m%d-%H%M").to_string()
}

/// One dump run and everything it owns.
pub struct Dump {
    config: DumpConfig,
    run_id: String,
    lease: LeaseStore,
    labels: LabelStore,
    archive: Archive,
    changer: Changer,
    drives: Box<dyn DriveIo>,
    verify_worker: VerifyWorkerFactory,

    manifest: Manifest,
    units: Vec<ArchiveUnit>,
    claimed: Vec<String>,
    bytes_used: u64,
    tape_index_counter: u64,
    tape_labels: Vec<String>,
    tape_reports: Vec<TapeVerifyResult>,
    reached: DumpState,
    final_state: DumpState,
}

impl Dump {
    /// Assemble a run against the real hardware and database.
    pub fn new(config: DumpConfig) -> Result<Self, DumpError> {
        let run_id = generate_run_id();
        let lease = LeaseStore::open(&config.db_path, &run_id, config.version)?;
        let labels = LabelStore::open(&config.db_path)?;
        let archive = Archive::new(
            &run_id,
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

        Ok(Self::with_parts(
            config,
            run_id,
            lease,
            labels,
            archive,
            changer,
            drives,
            verify_worker,
        ))
    }

    /// Assemble a run from explicit parts. This is the seam tests and
    /// recovery tooling use to substitute stores and hardware handles.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        config: DumpConfig,
        run_id: String,
        lease: LeaseStore,
        labels: LabelStore,
        archive: Archive,
        changer: Changer,
        drives: Box<dyn DriveIo>,
        verify_worker: VerifyWorkerFactory,
    ) -> Self {
        Self {
            config,
            run_id,
            lease,
            labels,
            archive,
            changer,
            drives,
            verify_worker,
            manifest: Manifest::new(),
            units: Vec::new(),
            claimed: Vec::new(),
            bytes_used: 0,
            tape_index_counter: 0,
            tape_labels: Vec::new(),
            tape_reports: Vec::new(),
            reached: DumpState::Initialize,
            final_state: DumpState::Initialize,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Highest forward state reached so far.
    pub fn reached(&self) -> DumpState {
        self.reached
    }

    pub fn final_state(&self) -> DumpState {
        self.final_state
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn tape_labels(&self) -> &[String] {
        &self.tape_labels
    }

    /// Per-tape verification outcomes of the last verify stage.
    pub fn tape_reports(&self) -> &[TapeVerifyResult] {
        &self.tape_reports
    }

    /// Execute a full dump run, returning the terminal state.
    pub fn run(&mut self) -> DumpState {
        info!(run_id = %self.run_id, "starting dump run");

        if let Err(fail) = self.plan_stage() {
            return self.finish(fail);
        }
        if self.manifest.is_empty() {
            // Nothing eligible is a clean no-op, not a failure.
            info!("no files to dump");
            return self.finish(DumpState::Initialize);
        }
        if let Err(fail) = self.write_stage() {
            return self.finish(fail);
        }
        self.advance(DumpState::DumpWrite);

        if let Err(fail) = self.verify_stage() {
            return self.finish(fail);
        }
        self.advance(DumpState::DumpVerify);
        self.finish(DumpState::DumpVerify)
    }

    /// Resume a run from its queue directory: rebuild the manifest and
    /// tape labels from the persisted files, then verify and finalize.
    pub fn resume(&mut self) -> DumpState {
        info!(run_id = %self.run_id, "resuming from queued run");

        let decoded = match self.archive.load_run_catalog() {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(%err, "no readable run catalog in queue");
                return self.finish(DumpState::DumpQueueFail);
            }
        };
        if decoded.run_id != self.run_id {
            warn!(on_disk = %decoded.run_id, "queued catalog names a different run");
        }
        self.manifest = decoded.to_manifest();

        match self.archive.tape_ids_from_file() {
            Ok(labels) => self.tape_labels = labels,
            Err(err) => {
                error!(%err, "no readable tape ids file");
                return self.finish(DumpState::DumpWriteFail);
            }
        }

        // The queue directory proves the run got through its writes.
        self.reached = DumpState::DumpWrite;
        if let Err(fail) = self.verify_stage() {
            return self.finish(fail);
        }
        self.advance(DumpState::DumpVerify);
        self.finish(DumpState::DumpVerify)
    }

    /// Best-effort cleanup, dispatched on the high-water mark alone.
    pub fn close_dump(&mut self) {
        match cleanup_action(self.reached) {
            CleanupAction::Nothing => {
                debug!(reached = ?self.reached, "no lease cleanup owed");
            }
            CleanupAction::UnclaimFiles => {
                info!(records = self.claimed.len(), "releasing claimed records");
                let claimed = std::mem::take(&mut self.claimed);
                let status = self.lease.unclaim(&claimed);
                if !status.is_ok() {
                    // Assume still claimed; the next run or an operator
                    // retries the unclaim.
                    warn!(%status, "unclaim incomplete, records remain marked");
                }
            }
        }
    }

    fn advance(&mut self, next: DumpState) {
        if next.rank() > self.reached.rank() {
            debug!(from = ?self.reached, to = ?next, "state");
            self.reached = next;
        }
    }

    fn finish(&mut self, state: DumpState) -> DumpState {
        self.final_state = state;
        info!(state = ?state, code = state.code(), "run finished");
        state
    }

    /// Claim, stage, and queue batches until the capacity budget or the
    /// candidate pool runs out.
    fn plan_stage(&mut self) -> Result<(), DumpState> {
        let mut planner = BatchPlanner::new(
            &mut self.lease,
            self.config.batch_size_bytes(),
            self.config.tape_size_bytes(),
            self.config.capacity_policy,
            self.config.path_filter.clone(),
        );

        loop {
            if !planner.should_continue(self.bytes_used) {
                info!(bytes_used = self.bytes_used, "run capacity reached");
                break;
            }
            let batch = match planner.next_batch(self.bytes_used) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "batch planning failed");
                    return Err(DumpState::DumpListFail);
                }
            };
            if self.reached.rank() < DumpState::DumpList.rank() {
                self.reached = DumpState::DumpList;
            }
            self.claimed
                .extend(batch.records.iter().map(|r| r.path.clone()));

            let unit_index = self.tape_index_counter;
            let staged = match self.archive.stage_batch(unit_index, &batch.records) {
                Ok(staged) => staged,
                Err(err) => {
                    error!(unit_index, %err, "staging failed");
                    return Err(DumpState::DumpQueueFail);
                }
            };
            if let Err(err) = self.archive.queue_unit(unit_index, &staged) {
                error!(unit_index, %err, "queueing failed");
                return Err(DumpState::DumpQueueFail);
            }

            let unit = ArchiveUnit::from_records(unit_index, &staged);
            for ((archive_index, path), record) in unit.entries.iter().zip(&staged) {
                self.manifest
                    .append(unit_index, *archive_index, record.content_hash.clone(), path.clone());
            }
            self.units.push(unit);
            if self.reached.rank() < DumpState::DumpQueue.rank() {
                self.reached = DumpState::DumpQueue;
            }
            self.bytes_used += batch.total_bytes;
            self.tape_index_counter += 1;
            info!(
                unit_index,
                bytes_used = self.bytes_used,
                entries = self.manifest.len(),
                "unit queued"
            );
        }
        Ok(())
    }

    /// Claim tape labels, persist the recovery files, and write every
    /// tape: the catalog block first, then the units in order.
    fn write_stage(&mut self) -> Result<(), DumpState> {
        let prefixes = self.config.run_label_prefixes().to_vec();
        let labels = match self.labels.select_labels(&prefixes) {
            Ok(labels) => labels,
            Err(err) => {
                error!(%err, "label selection failed");
                return Err(DumpState::DumpWriteFail);
            }
        };
        let status = self.labels.claim(&self.run_id, self.config.version, &labels);
        if !status.is_ok() {
            error!(%status, "label claim failed");
            return Err(DumpState::DumpWriteFail);
        }
        info!(?labels, "tapes claimed for run");
        self.tape_labels = labels.clone();

        // Persisted before any database finalize, so a crash after the
        // physical write is recoverable from disk.
        if let Err(err) = self.archive.save_tape_ids(&labels) {
            error!(%err, "tape ids save failed");
            return Err(DumpState::DumpWriteFail);
        }
        let catalog_path = match self.archive.write_run_catalog(&self.manifest, &date_stamp()) {
            Ok(path) => path,
            Err(err) => {
                error!(%err, "run catalog write failed");
                return Err(DumpState::DumpWriteFail);
            }
        };

        if self.config.drive_select >= 2 {
            self.changer.load_tape_pair(&labels);
            for (drive, label) in labels.iter().enumerate() {
                if !self.drive_holds(drive as u8, label) {
                    error!(label, drive, "tape did not load");
                    return Err(DumpState::DumpWriteFail);
                }
            }
            self.write_to(&[0, 1], &catalog_path)?;
        } else {
            if !self.changer.load_tape_drive(&labels[0], 0) {
                error!(label = %labels[0], "tape did not load");
                return Err(DumpState::DumpWriteFail);
            }
            self.write_to(&[0], &catalog_path)?;
        }
        Ok(())
    }

    fn drive_holds(&mut self, drive: u8, label: &str) -> bool {
        self.changer.check_inventory().is_ok()
            && self
                .changer
                .inventory()
                .label_in_drive
                .get(&drive)
                .map(String::as_str)
                == Some(label)
    }

    fn write_to(&self, drives_sel: &[u8], catalog_path: &Path) -> Result<(), DumpState> {
        info!(?drives_sel, "writing catalog block");
        if let Err(err) = self.drives.write_block(drives_sel, catalog_path) {
            error!(%err, "catalog block write failed");
            return Err(DumpState::DumpWriteFail);
        }
        for unit in &self.units {
            let files = vec![
                self.archive.unit_list_path(unit.unit_index),
                self.archive.unit_tar_path(unit.unit_index),
            ];
            info!(unit_index = unit.unit_index, "writing unit");
            if let Err(err) = self.drives.write_archives(drives_sel, &files) {
                error!(unit_index = unit.unit_index, %err, "unit write failed");
                return Err(DumpState::DumpWriteFail);
            }
        }
        Ok(())
    }

    /// Verify every written tape on its own worker, then finalize the
    /// leases and date the labels.
    fn verify_stage(&mut self) -> Result<(), DumpState> {
        let mut jobs = Vec::with_capacity(self.tape_labels.len());
        for (drive, label) in self.tape_labels.iter().enumerate() {
            match (self.verify_worker)() {
                Ok((changer, drives)) => jobs.push(VerifyJob {
                    label: label.clone(),
                    drive: drive as u8,
                    changer,
                    drives,
                }),
                Err(err) => {
                    error!(label, %err, "verify worker setup failed");
                    return Err(DumpState::DumpVerifyFail);
                }
            }
        }

        let results = verify::verify_tapes(jobs, &self.manifest, &self.run_id);
        for result in &results {
            info!(label = %result.label, status = %result.status, "tape verify result");
        }
        let all_ok = results.iter().all(|r| r.status.is_ok());
        self.tape_reports = results;
        if !all_ok {
            return Err(DumpState::DumpVerifyFail);
        }

        let status = self.lease.finalize(&self.manifest, &self.tape_labels);
        if !status.is_ok() {
            error!(%status, "lease finalize failed");
            return Err(DumpState::DumpVerifyFail);
        }
        let status = self.labels.date_labels(&self.tape_labels, &date_stamp());
        if !status.is_ok() {
            error!(%status, "label dating failed");
            return Err(DumpState::DumpVerifyFail);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_is_a_pure_function_of_the_high_water_mark() {
        assert_eq!(cleanup_action(DumpState::Initialize), CleanupAction::Nothing);
        assert_eq!(
            cleanup_action(DumpState::DumpList),
            CleanupAction::UnclaimFiles
        );
        assert_eq!(cleanup_action(DumpState::DumpQueue), CleanupAction::Nothing);
        assert_eq!(cleanup_action(DumpState::DumpWrite), CleanupAction::Nothing);
        assert_eq!(cleanup_action(DumpState::DumpVerify), CleanupAction::Nothing);
    }

    #[test]
    fn exit_codes_distinguish_every_terminal_state() {
        let states = [
            DumpState::Initialize,
            DumpState::DumpList,
            DumpState::DumpQueue,
            DumpState::DumpWrite,
            DumpState::DumpVerify,
            DumpState::DumpListFail,
            DumpState::DumpQueueFail,
            DumpState::DumpWriteFail,
            DumpState::DumpVerifyFail,
        ];
        let mut codes: Vec<i32> = states.iter().map(|s| s.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), states.len());
    }

    #[test]
    fn forward_ranks_increase() {
        assert!(DumpState::DumpList.rank() > DumpState::Initialize.rank());
        assert!(DumpState::DumpQueue.rank() > DumpState::DumpList.rank());
        assert!(DumpState::DumpWrite.rank() > DumpState::DumpQueue.rank());
        assert!(DumpState::DumpVerify.rank() > DumpState::DumpWrite.rank());
        // Failure states never advance the mark.
        assert_eq!(DumpState::DumpWriteFail.rank(), 0);
    }

    #[test]
    fn run_ids_are_nine_digits() {
        let run_id = generate_run_id();
        assert_eq!(run_id.len(), 9);
        assert!(run_id.bytes().all(|b| b.is_ascii_digit()));
    }
}
