//! Low-level tape drive access.
//!
//! Everything here is a thin layer over the external block-device
//! commands: dd for the fixed-size catalog block, tar for streaming
//! archives to the device, and an mt/tar/md5sum pipeline for hashing a
//! single archive member in place. Dual-drive writes run one child
//! process per drive and poll them to completion, so a stalled device
//! never blocks progress reporting on the other.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Tape block size for the catalog block.
const CATALOG_BLOCK: &str = "32k";

/// Sleep between child poll sweeps.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{command} exited with {code}")]
    CommandFailed { command: String, code: i32 },
}

/// Block-device operations against one or two tape drives. Production
/// shells out; tests substitute an in-memory tape.
pub trait DriveIo: Send + Sync {
    /// Write `file` as the fixed-size first block of each listed drive.
    fn write_block(&self, drives: &[u8], file: &Path) -> Result<(), DriveError>;

    /// Read the first block of the tape in `drive` as text lines.
    fn read_block(&self, drive: u8) -> Result<Vec<String>, DriveError>;

    /// Stream the given files to each listed drive as one tar archive,
    /// all drives in parallel.
    fn write_archives(&self, drives: &[u8], files: &[PathBuf]) -> Result<(), DriveError>;

    /// Advance one file mark and hash a single member of the archive unit
    /// there, without writing the extracted bytes to disk.
    fn content_hash_at(
        &self,
        drive: u8,
        run_id: &str,
        unit_index: u64,
        path: &str,
    ) -> Result<String, DriveError>;
}

/// Production drive access via dd, tar, mt and md5sum.
pub struct Drives {
    device_prefix: String,
}

impl Drives {
    pub fn new(device_prefix: impl Into<String>) -> Self {
        Self {
            device_prefix: device_prefix.into(),
        }
    }

    /// Device path of a drive, e.g. `/dev/nst0`.
    pub fn device(&self, drive: u8) -> String {
        format!("{}{}", self.device_prefix, drive)
    }
}

impl DriveIo for Drives {
    fn write_block(&self, drives: &[u8], file: &Path) -> Result<(), DriveError> {
        let commands = drives
            .iter()
            .map(|&drive| {
                let mut command = Command::new("dd");
                command
                    .arg("conv=sync,block")
                    .arg(format!("of={}", self.device(drive)))
                    .arg(format!("if={}", file.display()))
                    .arg(format!("bs={CATALOG_BLOCK}"))
                    .arg("count=1");
                command
            })
            .collect();
        exec_commands(commands)
    }

    fn read_block(&self, drive: u8) -> Result<Vec<String>, DriveError> {
        let mut command = Command::new("dd");
        command
            .arg("conv=sync,block")
            .arg(format!("if={}", self.device(drive)))
            .arg(format!("bs={CATALOG_BLOCK}"))
            .arg("count=1");
        let rendered = format!("{command:?}");
        debug!(command = %rendered, "reading catalog block");
        let output = command.output()?;
        if !output.status.success() {
            return Err(DriveError::CommandFailed {
                command: rendered,
                code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim_matches('\0').to_string())
            .collect())
    }

    fn write_archives(&self, drives: &[u8], files: &[PathBuf]) -> Result<(), DriveError> {
        let commands = drives
            .iter()
            .map(|&drive| {
                let mut command = Command::new("tar");
                command.arg("cf").arg(self.device(drive));
                for file in files {
                    command.arg(file);
                }
                command
            })
            .collect();
        exec_commands(commands)
    }

    fn content_hash_at(
        &self,
        drive: u8,
        run_id: &str,
        unit_index: u64,
        path: &str,
    ) -> Result<String, DriveError> {
        let device = self.device(drive);
        let unit = format!("paper.{run_id}.{unit_index}");
        // The outer tar is the archive unit on tape, the target record is
        // a member of it; both extractions stream through stdout.
        let pipeline = format!(
            "mt -f {device} fsf 1 && \
             tar xOf {device} {unit}.tar | tar xOf - {unit}/{path} | md5sum",
        );
        debug!(drive, unit, path, "hashing member off tape");

        let mut command = Command::new("sh");
        command.arg("-c").arg(&pipeline);
        let output = command.output()?;
        if !output.status.success() {
            return Err(DriveError::CommandFailed {
                command: pipeline,
                code: output.status.code().unwrap_or(-1),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.split_whitespace().next().unwrap_or("").to_string())
    }
}

/// Spawn every command and poll the children to completion.
///
/// The first non-zero exit is reported after all children have finished,
/// so a failure on one drive does not orphan the writer on the other.
fn exec_commands(commands: Vec<Command>) -> Result<(), DriveError> {
    let mut running: Vec<(String, Child)> = Vec::with_capacity(commands.len());
    for mut command in commands {
        let rendered = format!("{command:?}");
        debug!(command = %rendered, "spawning");
        let child = command
            .stdin(Stdio::null())
            .spawn()
            .map_err(DriveError::Io)?;
        running.push((rendered, child));
    }

    let mut first_failure = None;
    while !running.is_empty() {
        let mut still_running = Vec::with_capacity(running.len());
        for (rendered, mut child) in running {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    debug!(command = %rendered, "finished");
                }
                Ok(Some(status)) => {
                    warn!(command = %rendered, ?status, "command failed");
                    first_failure.get_or_insert(DriveError::CommandFailed {
                        command: rendered,
                        code: status.code().unwrap_or(-1),
                    });
                }
                Ok(None) => still_running.push((rendered, child)),
                Err(err) => {
                    warn!(command = %rendered, %err, "wait failed");
                    first_failure.get_or_insert(DriveError::Io(err));
                }
            }
        }
        running = still_running;
        if !running.is_empty() {
            thread::sleep(POLL_INTERVAL);
        }
    }

    match first_failure {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_paths() {
        let drives = Drives::new("/dev/nst");
        assert_eq!(drives.device(0), "/dev/nst0");
        assert_eq!(drives.device(1), "/dev/nst1");
    }

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script).stdout(Stdio::null());
        command
    }

    #[test]
    fn exec_commands_runs_all_to_completion() {
        let commands = vec![shell("exit 0"), shell("sleep 0.1; exit 0")];
        assert!(exec_commands(commands).is_ok());
    }

    #[test]
    fn exec_commands_reports_first_failure() {
        let commands = vec![shell("exit 0"), shell("exit 3")];
        match exec_commands(commands) {
            Err(DriveError::CommandFailed { code, .. }) => assert_eq!(code, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
