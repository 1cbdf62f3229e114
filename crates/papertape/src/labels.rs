//! Tape label registry.
//!
//! Physical tapes are bought and barcoded in two series (one per drive), and
//! a run claims the lowest unused label of each series. Labels are dated
//! only after a run has been written and verified, so an undated label with
//! a status is a run that died in flight.

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, warn};

use crate::status::Status;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no free label matching {0}")]
    NoFreeLabel(String),
}

/// Create the `labels` table.
pub fn create_label_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS labels (
            label TEXT PRIMARY KEY,
            date TEXT,
            status TEXT,
            description TEXT,
            capacity INTEGER
        );
        "#,
    )
}

/// Handle on the label registry.
pub struct LabelStore {
    conn: Connection,
}

impl LabelStore {
    pub fn open(path: &std::path::Path) -> Result<Self, LabelError> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Register new label stock.
    pub fn insert(&mut self, labels: &[String]) -> Result<(), LabelError> {
        for label in labels {
            debug!(label, "registering label");
            self.conn.execute(
                "INSERT OR IGNORE INTO labels (label) VALUES (?1)",
                params![label],
            )?;
        }
        Ok(())
    }

    /// Pick the lowest free label for each series prefix, in order.
    pub fn select_labels(&self, prefixes: &[String]) -> Result<Vec<String>, LabelError> {
        let mut picked = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            let label: Option<String> = self
                .conn
                .query_row(
                    "SELECT label FROM labels \
                     WHERE status IS NULL AND date IS NULL AND label LIKE ?1 \
                     ORDER BY label LIMIT 1",
                    params![format!("{prefix}%")],
                    |row| row.get(0),
                )
                .optional()?;
            match label {
                Some(label) => picked.push(label),
                None => return Err(LabelError::NoFreeLabel(prefix.clone())),
            }
        }
        Ok(picked)
    }

    /// Mark labels as owned by the given run.
    pub fn claim(&mut self, run_id: &str, version: u32, labels: &[String]) -> Status {
        let mut status = Status::Ok;
        let tx = match self.conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%err, "label claim transaction open failed");
                return Status::ClaimCommit;
            }
        };

        for label in labels {
            match tx.execute(
                "UPDATE labels SET status = ?1, description = ?2 WHERE label = ?3",
                params![run_id, format!("Paper dump version:{version}"), label],
            ) {
                Ok(1) => debug!(label, run_id, "label claimed"),
                Ok(_) => {
                    warn!(label, "no such label to claim");
                    status = Status::ClaimBuild;
                }
                Err(err) => {
                    warn!(label, %err, "label claim failed");
                    status = Status::ClaimBuild;
                }
            }
        }

        if let Err(err) = tx.commit() {
            warn!(%err, "label claim commit failed");
            status = Status::ClaimCommit;
        }
        status
    }

    /// Stamp the completion date of a verified run onto its labels.
    pub fn date_labels(&mut self, labels: &[String], date: &str) -> Status {
        let mut status = Status::Ok;
        let tx = match self.conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%err, "label date transaction open failed");
                return Status::ClaimCommit;
            }
        };

        for label in labels {
            debug!(label, date, "dating label");
            if let Err(err) = tx.execute(
                "UPDATE labels SET date = ?1 WHERE label = ?2",
                params![date, label],
            ) {
                warn!(label, %err, "label date failed");
                status = Status::ClaimBuild;
            }
        }

        if let Err(err) = tx.commit() {
            warn!(%err, "label date commit failed");
            status = Status::ClaimCommit;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(labels: &[&str]) -> LabelStore {
        let conn = Connection::open_in_memory().unwrap();
        create_label_schema(&conn).unwrap();
        let mut store = LabelStore::from_connection(conn);
        store
            .insert(&labels.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .unwrap();
        store
    }

    fn prefixes() -> Vec<String> {
        vec!["PAPR1".into(), "PAPR2".into()]
    }

    #[test]
    fn selects_lowest_free_label_per_series() {
        let store = registry(&["PAPR1002", "PAPR1001", "PAPR2001"]);
        let picked = store.select_labels(&prefixes()).unwrap();
        assert_eq!(picked, vec!["PAPR1001".to_string(), "PAPR2001".to_string()]);
    }

    #[test]
    fn claimed_labels_are_not_reselected() {
        let mut store = registry(&["PAPR1001", "PAPR1002", "PAPR2001"]);
        assert_eq!(
            store.claim("000000001", 1, &["PAPR1001".to_string()]),
            Status::Ok
        );
        let picked = store.select_labels(&prefixes()).unwrap();
        assert_eq!(picked, vec!["PAPR1002".to_string(), "PAPR2001".to_string()]);
    }

    #[test]
    fn exhausted_series_is_an_error() {
        let store = registry(&["PAPR1001"]);
        let err = store.select_labels(&prefixes()).unwrap_err();
        assert!(matches!(err, LabelError::NoFreeLabel(p) if p == "PAPR2"));
    }

    #[test]
    fn dated_labels_are_retired() {
        let mut store = registry(&["PAPR1001", "PAPR1002"]);
        assert_eq!(
            store.date_labels(&["PAPR1001".to_string()], "20260807-1200"),
            Status::Ok
        );
        let picked = store
            .select_labels(&["PAPR1".to_string()])
            .unwrap();
        assert_eq!(picked, vec!["PAPR1002".to_string()]);
    }
}
