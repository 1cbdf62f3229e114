//! Run status codes.
//!
//! Every external-command and database call is caught at its call site and
//! reported as one of these values; nothing crosses a component boundary as
//! a panic. The orchestrator records the first failing status of each stage
//! in the run report.

use std::fmt;

/// Result of a dump operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,

    // Lease store faults.
    DbConnect,
    ClaimBuild,
    ClaimCommit,

    // Tape hardware faults.
    LoadFailed,
    RewindFailed,
    WriteFailed,

    // Verification mismatches.
    ItemIndexMismatch,
    CatalogMismatch,
    HashMismatch,
    RunIdMismatch,
    /// A sampled archive member hashed differently than the catalog says.
    /// The reference identifies the failing spot check as `unit:path`.
    ContentHashMismatch { unit_index: u64, path: String },

    Unknown,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::DbConnect => write!(f, "database connection failed"),
            Status::ClaimBuild => write!(f, "claim update failed"),
            Status::ClaimCommit => write!(f, "claim commit failed"),
            Status::LoadFailed => write!(f, "tape load failed"),
            Status::RewindFailed => write!(f, "tape rewind failed"),
            Status::WriteFailed => write!(f, "tape write failed"),
            Status::ItemIndexMismatch => write!(f, "catalog item count mismatch"),
            Status::CatalogMismatch => write!(f, "catalog entry mismatch"),
            Status::HashMismatch => write!(f, "catalog hash mismatch"),
            Status::RunIdMismatch => write!(f, "catalog run id mismatch"),
            Status::ContentHashMismatch { unit_index, path } => {
                write!(f, "content hash mismatch at {unit_index}:{path}")
            }
            Status::Unknown => write!(f, "unknown failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_mismatch_reference() {
        let status = Status::ContentHashMismatch {
            unit_index: 3,
            path: "host1:/data/a.uv".into(),
        };
        assert_eq!(
            status.to_string(),
            "content hash mismatch at 3:host1:/data/a.uv"
        );
        assert!(!status.is_ok());
        assert!(Status::Ok.is_ok());
    }
}
