//! Lease bookkeeping over the shared file database.
//!
//! The file catalog is maintained by an external system; this module only
//! reads candidate rows and writes the `tape_location` column, which holds
//! the lease marker while a run owns a record and the permanent tape
//! location once the record is on tape. Concurrent dump runs race on the
//! same table, so every claim is a guarded row update: the update only
//! matches rows that are still free, which makes the claim itself the
//! serialization point rather than the preceding fetch.

use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, warn};

use tape_catalog::Manifest;

use crate::status::Status;

/// Marker prefix for records claimed by a live run.
pub const CLAIM_TAG: &str = "1";

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// In-memory view of the `tape_location` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseMarker {
    /// NULL: free for any run to claim.
    Free,
    /// Claimed by a live (or crashed) run.
    Claimed { run_id: String },
    /// Permanently on tape.
    Finalized {
        version: u32,
        tapes: Vec<String>,
        unit_index: u64,
        archive_index: u64,
    },
    /// Anything unrecognized is owned by a stale or foreign run and must
    /// be neither claimed nor cleared.
    Foreign(String),
}

/// Wire form of a claim marker.
pub fn claim_marker(run_id: &str) -> String {
    format!("{CLAIM_TAG}{run_id}")
}

/// Wire form of a permanent tape location.
pub fn finalized_marker(version: u32, tapes: &[String], unit_index: u64, archive_index: u64) -> String {
    format!("{version}[{}]-{unit_index}:{archive_index}", tapes.join(","))
}

impl LeaseMarker {
    /// Parse the raw column value.
    pub fn parse(raw: Option<&str>) -> Self {
        use std::sync::LazyLock;
        static FINALIZED: LazyLock<regex::Regex> = LazyLock::new(|| {
            regex::Regex::new(r"^([0-9]+)\[([^\]]*)\]-([0-9]+):([0-9]+)$").unwrap()
        });

        let Some(raw) = raw else {
            return LeaseMarker::Free;
        };
        if let Some(caps) = FINALIZED.captures(raw) {
            if let (Ok(version), Ok(unit_index), Ok(archive_index)) =
                (caps[1].parse(), caps[3].parse(), caps[4].parse())
            {
                return LeaseMarker::Finalized {
                    version,
                    tapes: caps[2]
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                    unit_index,
                    archive_index,
                };
            }
        }
        if let Some(run_id) = raw.strip_prefix(CLAIM_TAG) {
            if !run_id.is_empty() && run_id.bytes().all(|b| b.is_ascii_digit()) {
                return LeaseMarker::Claimed {
                    run_id: run_id.to_string(),
                };
            }
        }
        LeaseMarker::Foreign(raw.to_string())
    }

    /// Wire form, `None` for `Free`.
    pub fn format(&self) -> Option<String> {
        match self {
            LeaseMarker::Free => None,
            LeaseMarker::Claimed { run_id } => Some(claim_marker(run_id)),
            LeaseMarker::Finalized {
                version,
                tapes,
                unit_index,
                archive_index,
            } => Some(finalized_marker(*version, tapes, *unit_index, *archive_index)),
            LeaseMarker::Foreign(raw) => Some(raw.clone()),
        }
    }
}

/// A record eligible for archival.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: String,
    pub size_bytes: u64,
    /// Digest from the catalog system, if it already knows one.
    pub content_hash: Option<String>,
}

/// Create the `files` table.
///
/// Deployments point at the catalog system's existing database; this is
/// for tests and for bootstrapping scratch setups.
pub fn create_file_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            size_bytes INTEGER NOT NULL,
            content_hash TEXT,
            taping_ready INTEGER NOT NULL DEFAULT 0,
            tape_location TEXT,
            deletable INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_files_tape_location ON files(tape_location);
        "#,
    )
}

/// Handle on the shared file database, scoped to one run.
pub struct LeaseStore {
    conn: Connection,
    run_id: String,
    version: u32,
}

impl LeaseStore {
    pub fn open(path: &std::path::Path, run_id: &str, version: u32) -> Result<Self, LeaseError> {
        let conn = Connection::open(path)?;
        Ok(Self::from_connection(conn, run_id, version))
    }

    pub fn from_connection(conn: Connection, run_id: &str, version: u32) -> Self {
        Self {
            conn,
            run_id: run_id.to_string(),
            version,
        }
    }

    /// The marker this run writes when claiming.
    pub fn claim_marker(&self) -> String {
        claim_marker(&self.run_id)
    }

    /// Fetch free records up to `byte_limit` cumulative bytes.
    ///
    /// A record whose own size exceeds the limit is skipped with a warning,
    /// never partially included. Records are admitted while the running
    /// total before admission is below the limit, so the final total may
    /// run past the mark by at most one record; callers that need a hard
    /// ceiling trim the result. `byte_limit == 0` lifts the limit for this
    /// call entirely.
    pub fn fetch_candidates(
        &self,
        byte_limit: u64,
        filter: Option<&str>,
    ) -> Result<(Vec<Candidate>, u64), LeaseError> {
        let unbounded = byte_limit == 0;
        if unbounded {
            debug!("byte_limit 0, fetching without limit");
        }

        let base = "SELECT path, size_bytes, content_hash FROM files \
                    WHERE taping_ready = 1 AND tape_location IS NULL";
        let mut picked = Vec::new();
        let mut total = 0u64;

        let mut admit = |candidate: Candidate| -> bool {
            if !unbounded && candidate.size_bytes > byte_limit {
                warn!(
                    path = %candidate.path,
                    size_bytes = candidate.size_bytes,
                    byte_limit,
                    "record larger than fetch limit, skipping"
                );
                return true;
            }
            if unbounded || total < byte_limit {
                total += candidate.size_bytes;
                picked.push(candidate);
                true
            } else {
                false
            }
        };

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Candidate> {
            Ok(Candidate {
                path: row.get(0)?,
                size_bytes: row.get::<_, i64>(1)? as u64,
                content_hash: row.get(2)?,
            })
        };

        if let Some(filter) = filter {
            let mut stmt = self
                .conn
                .prepare(&format!("{base} AND path LIKE ?1 ORDER BY path"))?;
            let rows = stmt.query_map(params![filter], map_row)?;
            for row in rows {
                if !admit(row?) {
                    break;
                }
            }
        } else {
            let mut stmt = self.conn.prepare(&format!("{base} ORDER BY path"))?;
            let rows = stmt.query_map([], map_row)?;
            for row in rows {
                if !admit(row?) {
                    break;
                }
            }
        }

        debug!(count = picked.len(), total, "fetched candidates");
        Ok((picked, total))
    }

    /// Claim the given paths for this run.
    ///
    /// Each row update is guarded on the record still being free; a row
    /// that fails or matches nothing degrades the result to `ClaimBuild`
    /// and the loop keeps going, so the caller can distinguish malformed
    /// rows from a failed commit and react (retry or unclaim) either way.
    pub fn claim(&mut self, paths: &[String]) -> Status {
        let marker = self.claim_marker();
        let mut status = Status::Ok;

        let tx = match self.conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%err, "claim transaction open failed");
                return Status::ClaimCommit;
            }
        };

        for path in paths {
            match tx.execute(
                "UPDATE files SET tape_location = ?1 \
                 WHERE path = ?2 AND tape_location IS NULL",
                params![marker, path],
            ) {
                Ok(1) => debug!(path, marker, "claimed"),
                Ok(_) => {
                    warn!(path, "record not free to claim");
                    status = Status::ClaimBuild;
                }
                Err(err) => {
                    warn!(path, %err, "claim update failed");
                    status = Status::ClaimBuild;
                }
            }
        }

        if let Err(err) = tx.commit() {
            warn!(%err, "claim commit failed");
            status = Status::ClaimCommit;
        }
        status
    }

    /// Release records claimed by this run.
    ///
    /// Only rows whose marker exactly matches this run's claim marker are
    /// cleared; records owned by other runs are untouched.
    pub fn unclaim(&mut self, paths: &[String]) -> Status {
        let marker = self.claim_marker();
        let mut status = Status::Ok;

        let tx = match self.conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%err, "unclaim transaction open failed");
                return Status::ClaimCommit;
            }
        };

        for path in paths {
            match tx.execute(
                "UPDATE files SET tape_location = NULL \
                 WHERE path = ?1 AND tape_location = ?2",
                params![path, marker],
            ) {
                Ok(1) => debug!(path, "unclaimed"),
                Ok(_) => debug!(path, "not claimed by this run, leaving"),
                Err(err) => {
                    warn!(path, %err, "unclaim update failed");
                    status = Status::ClaimBuild;
                }
            }
        }

        if let Err(err) = tx.commit() {
            warn!(%err, "unclaim commit failed");
            status = Status::ClaimCommit;
        }
        status
    }

    /// Record the permanent tape location of every manifest entry and mark
    /// the records eligible for later deletion from staging storage.
    pub fn finalize(&mut self, manifest: &Manifest, tapes: &[String]) -> Status {
        let mut status = Status::Ok;

        let tx = match self.conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%err, "finalize transaction open failed");
                return Status::ClaimCommit;
            }
        };

        for entry in manifest.entries() {
            let location =
                finalized_marker(self.version, tapes, entry.unit_index, entry.archive_index);
            debug!(path = %entry.path, location, "writing tape location");
            match tx.execute(
                "UPDATE files SET tape_location = ?1, deletable = 1 WHERE path = ?2",
                params![location, entry.path],
            ) {
                Ok(1) => {}
                Ok(_) => {
                    warn!(path = %entry.path, "no record to finalize");
                    status = Status::ClaimBuild;
                }
                Err(err) => {
                    warn!(path = %entry.path, %err, "finalize update failed");
                    status = Status::ClaimBuild;
                }
            }
        }

        if let Err(err) = tx.commit() {
            warn!(%err, "finalize commit failed");
            status = Status::ClaimCommit;
        }
        status
    }
}
