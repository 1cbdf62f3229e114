//! Capacity-bounded batch planning.
//!
//! The planner repeatedly pulls free records from the lease store into
//! batches sized against the per-batch mark, trims each batch so the run
//! never exceeds its tape budget, and claims what it keeps. Each staged
//! batch becomes one archive unit on tape.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::StagedRecord;
use crate::lease::{Candidate, LeaseError, LeaseStore};
use crate::status::Status;

/// How hard to pack a tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityPolicy {
    /// Stop as soon as a whole further batch might not fit. Leaves up to
    /// one batch of slack at the end of the tape.
    #[default]
    Conservative,
    /// Keep batching until the budget is actually exhausted.
    StrictFill,
}

impl CapacityPolicy {
    /// Whether another batch may be attempted at the current fill level.
    pub fn should_continue(&self, bytes_used: u64, batch_size: u64, run_capacity: u64) -> bool {
        match self {
            CapacityPolicy::Conservative => bytes_used + batch_size < run_capacity,
            CapacityPolicy::StrictFill => bytes_used < run_capacity,
        }
    }
}

/// One tar-equivalent unit written to tape in a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveUnit {
    pub unit_index: u64,
    /// `(archive_index, path)`, archive indices 1-based.
    pub entries: Vec<(u64, String)>,
}

impl ArchiveUnit {
    pub fn from_records(unit_index: u64, records: &[StagedRecord]) -> Self {
        Self {
            unit_index,
            entries: records
                .iter()
                .enumerate()
                .map(|(offset, record)| (offset as u64 + 1, record.path.clone()))
                .collect(),
        }
    }
}

/// A claimed selection of records, not yet staged.
#[derive(Debug, Clone)]
pub struct Batch {
    pub records: Vec<Candidate>,
    pub total_bytes: u64,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("lease store failure: {0}")]
    Lease(#[from] LeaseError),

    #[error("claim failed: {0}")]
    Claim(Status),
}

/// Pulls claimed batches out of the lease store.
pub struct BatchPlanner<'a> {
    lease: &'a mut LeaseStore,
    batch_size_bytes: u64,
    run_capacity_bytes: u64,
    policy: CapacityPolicy,
    filter: Option<String>,
}

impl<'a> BatchPlanner<'a> {
    pub fn new(
        lease: &'a mut LeaseStore,
        batch_size_bytes: u64,
        run_capacity_bytes: u64,
        policy: CapacityPolicy,
        filter: Option<String>,
    ) -> Self {
        Self {
            lease,
            batch_size_bytes,
            run_capacity_bytes,
            policy,
            filter,
        }
    }

    /// Whether the run has room for another batch.
    pub fn should_continue(&self, bytes_used: u64) -> bool {
        self.policy
            .should_continue(bytes_used, self.batch_size_bytes, self.run_capacity_bytes)
    }

    /// Fetch, trim to the remaining run budget, and claim the next batch.
    ///
    /// `Ok(None)` means no eligible records remain, which ends the run
    /// normally. A failed claim releases the batch and surfaces the
    /// claim status.
    pub fn next_batch(&mut self, bytes_used: u64) -> Result<Option<Batch>, PlanError> {
        let (mut records, mut total) = self
            .lease
            .fetch_candidates(self.batch_size_bytes, self.filter.as_deref())?;
        if records.is_empty() {
            info!("no eligible records remain");
            return Ok(None);
        }

        // The fetch may run past the batch mark by one record; drop tail
        // records until the run budget holds.
        let remaining = self.run_capacity_bytes.saturating_sub(bytes_used);
        while total > remaining {
            match records.pop() {
                Some(dropped) => {
                    warn!(
                        path = %dropped.path,
                        size_bytes = dropped.size_bytes,
                        remaining,
                        "batch would exceed run capacity, deferring record"
                    );
                    total -= dropped.size_bytes;
                }
                None => break,
            }
        }
        if records.is_empty() {
            info!(remaining, "no record fits the remaining run capacity");
            return Ok(None);
        }

        let paths: Vec<String> = records.iter().map(|r| r.path.clone()).collect();
        let status = self.lease.claim(&paths);
        if !status.is_ok() {
            warn!(%status, "claim failed, releasing batch");
            self.lease.unclaim(&paths);
            return Err(PlanError::Claim(status));
        }

        debug!(records = records.len(), total, "batch claimed");
        Ok(Some(Batch {
            records,
            total_bytes: total,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::create_file_schema;
    use rusqlite::{Connection, params};

    fn store(files: &[(&str, u64)]) -> LeaseStore {
        let conn = Connection::open_in_memory().unwrap();
        create_file_schema(&conn).unwrap();
        for (path, size) in files {
            conn.execute(
                "INSERT INTO files (path, size_bytes, taping_ready) VALUES (?1, ?2, 1)",
                params![path, *size as i64],
            )
            .unwrap();
        }
        LeaseStore::from_connection(conn, "000000001", 1)
    }

    #[test]
    fn single_batch_takes_all_three_and_fills_the_run() {
        let mut lease = store(&[("h:/a", 4000), ("h:/b", 5000), ("h:/c", 6000)]);
        let mut planner = BatchPlanner::new(
            &mut lease,
            12000,
            15000,
            CapacityPolicy::Conservative,
            None,
        );

        let mut bytes_used = 0;
        assert!(planner.should_continue(bytes_used));
        let batch = planner.next_batch(bytes_used).unwrap().unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.total_bytes, 15000);
        bytes_used += batch.total_bytes;

        // The run is full; the conservative loop terminates.
        assert!(!planner.should_continue(bytes_used));
    }

    #[test]
    fn batches_never_exceed_run_capacity() {
        let mut lease = store(&[("h:/a", 11000), ("h:/b", 10000)]);
        let mut planner = BatchPlanner::new(
            &mut lease,
            12000,
            15000,
            CapacityPolicy::StrictFill,
            None,
        );

        let batch = planner.next_batch(0).unwrap().unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.total_bytes, 11000);

        // The deferred record still does not fit the remaining budget.
        assert!(planner.next_batch(11000).unwrap().is_none());
    }

    #[test]
    fn empty_store_ends_the_run() {
        let mut lease = store(&[]);
        let mut planner =
            BatchPlanner::new(&mut lease, 1000, 5000, CapacityPolicy::Conservative, None);
        assert!(planner.next_batch(0).unwrap().is_none());
    }

    #[test]
    fn claimed_batches_are_not_refetched() {
        let mut lease = store(&[("h:/a", 100), ("h:/b", 100)]);
        let mut planner =
            BatchPlanner::new(&mut lease, 100, 1000, CapacityPolicy::StrictFill, None);

        let first = planner.next_batch(0).unwrap().unwrap();
        assert_eq!(first.records[0].path, "h:/a");
        let second = planner.next_batch(100).unwrap().unwrap();
        assert_eq!(second.records[0].path, "h:/b");
        assert!(planner.next_batch(200).unwrap().is_none());
    }

    #[test]
    fn policy_loop_conditions() {
        assert!(CapacityPolicy::Conservative.should_continue(0, 12000, 15000));
        assert!(!CapacityPolicy::Conservative.should_continue(3000, 12000, 15000));
        assert!(CapacityPolicy::StrictFill.should_continue(14999, 12000, 15000));
        assert!(!CapacityPolicy::StrictFill.should_continue(15000, 12000, 15000));
    }

    #[test]
    fn unit_entries_are_one_based() {
        let records = vec![
            StagedRecord {
                path: "h:/a".into(),
                local: "/tmp/a".into(),
                content_hash: "d41d8cd98f00b204e9800998ecf8427e".into(),
            },
            StagedRecord {
                path: "h:/b".into(),
                local: "/tmp/b".into(),
                content_hash: "d41d8cd98f00b204e9800998ecf8427e".into(),
            },
        ];
        let unit = ArchiveUnit::from_records(2, &records);
        assert_eq!(unit.unit_index, 2);
        assert_eq!(unit.entries[0], (1, "h:/a".to_string()));
        assert_eq!(unit.entries[1], (2, "h:/b".to_string()));
    }
}
