//! Run staging and queue directories.
//!
//! Records are copied from the data mirror into a per-unit staging
//! directory, hashed, packed into a tar in the queue directory, and the
//! staging copy removed to make room for the next batch. The queue
//! directory also holds the run-wide catalog and the tape-ids recovery
//! file, which together are enough to resume a run that died after the
//! physical write.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use md5::{Digest, Md5};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use tape_catalog::{self as catalog, DecodedCatalog, Manifest};

use crate::lease::Candidate;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archiver failed: {0}")]
    Archiver(String),

    #[error("tape ids file is missing or malformed")]
    MalformedTapeIds,
}

/// Byte transport from a data host into local staging.
pub trait StagingTransport: Send + Sync {
    /// Copy the record into `dest`, returning the path of the local copy.
    fn stage(&self, path: &str, dest: &Path) -> io::Result<PathBuf>;
}

/// Transport for installations where the data hosts are mounted under a
/// single local root, with sub-trees named after `host:directory` paths.
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StagingTransport for LocalTransport {
    fn stage(&self, path: &str, dest: &Path) -> io::Result<PathBuf> {
        let src = self.root.join(path);
        let target = dest.join(path);
        copy_tree(&src, &target)?;
        Ok(target)
    }
}

/// Recursive copy preserving the directory shape.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(());
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// MD5 over a record's file bytes in lexical walk order.
///
/// This matches the byte stream `tar xOf` produces for the record at
/// verification time, which extracts members in the same order they were
/// packed.
pub fn tree_digest(path: &Path) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let mut file = File::open(entry.path())?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Builds one tar per archive unit. Tar construction itself is external;
/// this trait is the seam.
pub trait UnitArchiver: Send + Sync {
    /// Pack `unit_dir` into a tar at `dest`, with the directory's own name
    /// as the member root.
    fn build_unit(&self, unit_dir: &Path, dest: &Path) -> Result<(), ArchiveError>;
}

/// Production archiver shelling out to tar.
pub struct TarCommand;

impl UnitArchiver for TarCommand {
    fn build_unit(&self, unit_dir: &Path, dest: &Path) -> Result<(), ArchiveError> {
        let parent = unit_dir
            .parent()
            .ok_or_else(|| ArchiveError::Archiver("unit dir has no parent".into()))?;
        let name = unit_dir
            .file_name()
            .ok_or_else(|| ArchiveError::Archiver("unit dir has no name".into()))?;
        debug!(?unit_dir, ?dest, "building unit tar");
        let output = Command::new("tar")
            .arg("cf")
            .arg(dest)
            .arg("-C")
            .arg(parent)
            .arg(name)
            .output()?;
        if !output.status.success() {
            return Err(ArchiveError::Archiver(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }
}

/// A record copied into staging, with its digest settled.
#[derive(Debug, Clone)]
pub struct StagedRecord {
    pub path: String,
    pub local: PathBuf,
    pub content_hash: String,
}

/// Per-run staging and queue state.
pub struct Archive {
    run_id: String,
    version: u32,
    queue_dir: PathBuf,
    staging_dir: PathBuf,
    transport: Box<dyn StagingTransport>,
    archiver: Box<dyn UnitArchiver>,
}

impl Archive {
    pub fn new(
        run_id: &str,
        version: u32,
        queue_root: &Path,
        staging_root: &Path,
        transport: Box<dyn StagingTransport>,
        archiver: Box<dyn UnitArchiver>,
    ) -> Result<Self, ArchiveError> {
        let queue_dir = queue_root.join(run_id);
        let staging_dir = staging_root.join(run_id);
        fs::create_dir_all(&queue_dir)?;
        fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            run_id: run_id.to_string(),
            version,
            queue_dir,
            staging_dir,
            transport,
            archiver,
        })
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    /// Archive name of a unit: `paper.<run_id>.<unit_index>`.
    pub fn unit_name(&self, unit_index: u64) -> String {
        format!("paper.{}.{}", self.run_id, unit_index)
    }

    fn unit_dir(&self, unit_index: u64) -> PathBuf {
        self.staging_dir.join(self.unit_name(unit_index))
    }

    pub fn unit_tar_path(&self, unit_index: u64) -> PathBuf {
        self.queue_dir.join(format!("{}.tar", self.unit_name(unit_index)))
    }

    pub fn unit_list_path(&self, unit_index: u64) -> PathBuf {
        self.queue_dir.join(format!("{}.list", self.unit_name(unit_index)))
    }

    pub fn run_catalog_path(&self) -> PathBuf {
        self.queue_dir.join(format!("paper.{}.list", self.run_id))
    }

    pub fn tape_ids_path(&self) -> PathBuf {
        self.queue_dir
            .join(format!("paper.{}.tape_ids.list", self.run_id))
    }

    /// Copy a batch into the unit's staging directory and settle digests,
    /// computing any the catalog system did not already know.
    pub fn stage_batch(
        &self,
        unit_index: u64,
        batch: &[Candidate],
    ) -> Result<Vec<StagedRecord>, ArchiveError> {
        let unit_dir = self.unit_dir(unit_index);
        fs::create_dir_all(&unit_dir)?;

        let mut locals = Vec::with_capacity(batch.len());
        for candidate in batch {
            debug!(path = %candidate.path, "staging");
            locals.push(self.transport.stage(&candidate.path, &unit_dir)?);
        }

        let records: Result<Vec<StagedRecord>, ArchiveError> = batch
            .par_iter()
            .zip(locals)
            .map(|(candidate, local)| {
                let content_hash = match &candidate.content_hash {
                    Some(hash) => hash.clone(),
                    None => tree_digest(&local)?,
                };
                Ok(StagedRecord {
                    path: candidate.path.clone(),
                    local,
                    content_hash,
                })
            })
            .collect();

        let records = records?;
        info!(unit_index, records = records.len(), "batch staged");
        Ok(records)
    }

    /// Pack the staged unit into the queue and drop the staging copy.
    pub fn queue_unit(&self, unit_index: u64, records: &[StagedRecord]) -> Result<(), ArchiveError> {
        let paths: Vec<String> = records.iter().map(|r| r.path.clone()).collect();
        fs::write(
            self.unit_list_path(unit_index),
            catalog::encode_unit_list(unit_index, &paths),
        )?;

        let unit_dir = self.unit_dir(unit_index);
        self.archiver
            .build_unit(&unit_dir, &self.unit_tar_path(unit_index))?;
        fs::remove_dir_all(&unit_dir)?;
        info!(unit_index, "unit queued");
        Ok(())
    }

    /// Write the run-wide catalog into the queue directory.
    pub fn write_run_catalog(&self, manifest: &Manifest, date: &str) -> Result<PathBuf, ArchiveError> {
        let path = self.run_catalog_path();
        fs::write(&path, catalog::encode(manifest, &self.run_id, self.version, date))?;
        debug!(?path, entries = manifest.len(), "run catalog written");
        Ok(path)
    }

    /// Read back the queued run catalog, if one exists.
    pub fn load_run_catalog(&self) -> Result<DecodedCatalog, ArchiveError> {
        let text = fs::read_to_string(self.run_catalog_path())?;
        Ok(catalog::decode(text.lines()))
    }

    /// Persist the claimed tape labels so a crash between the physical
    /// write and the database update stays recoverable.
    pub fn save_tape_ids(&self, labels: &[String]) -> Result<(), ArchiveError> {
        info!(?labels, path = ?self.tape_ids_path(), "saving tape ids");
        fs::write(self.tape_ids_path(), catalog::format_tape_ids(labels))?;
        Ok(())
    }

    pub fn tape_ids_from_file(&self) -> Result<Vec<String>, ArchiveError> {
        let text = fs::read_to_string(self.tape_ids_path())?;
        catalog::parse_tape_ids(&text).ok_or(ArchiveError::MalformedTapeIds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Archiver that records the request instead of running tar.
    struct TouchArchiver;

    impl UnitArchiver for TouchArchiver {
        fn build_unit(&self, _unit_dir: &Path, dest: &Path) -> Result<(), ArchiveError> {
            fs::write(dest, b"tar")?;
            Ok(())
        }
    }

    fn archive(mirror: &Path, work: &Path) -> Archive {
        Archive::new(
            "000001123",
            1,
            &work.join("queue"),
            &work.join("shm"),
            Box::new(LocalTransport::new(mirror)),
            Box::new(TouchArchiver),
        )
        .unwrap()
    }

    #[test]
    fn stage_copies_and_hashes() {
        let mirror = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let record = mirror.path().join("pot0:/data/zen.uv");
        fs::create_dir_all(&record).unwrap();
        fs::write(record.join("1.bin"), b"a").unwrap();
        fs::write(record.join("2.bin"), b"b").unwrap();

        let archive = archive(mirror.path(), work.path());
        let batch = vec![Candidate {
            path: "pot0:/data/zen.uv".into(),
            size_bytes: 2,
            content_hash: None,
        }];
        let staged = archive.stage_batch(0, &batch).unwrap();
        assert_eq!(staged.len(), 1);
        assert!(staged[0].local.join("1.bin").is_file());
        // md5 of the concatenated bytes "ab" in lexical order.
        assert_eq!(staged[0].content_hash, "187ef4436122d1cc2f40dc2b92f0eba0");
    }

    #[test]
    fn known_hash_is_reused() {
        let mirror = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let record = mirror.path().join("pot0:/data/a.uv");
        fs::create_dir_all(&record).unwrap();
        fs::write(record.join("visdata"), b"payload").unwrap();

        let archive = archive(mirror.path(), work.path());
        let batch = vec![Candidate {
            path: "pot0:/data/a.uv".into(),
            size_bytes: 7,
            content_hash: Some("d41d8cd98f00b204e9800998ecf8427e".into()),
        }];
        let staged = archive.stage_batch(0, &batch).unwrap();
        assert_eq!(staged[0].content_hash, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn queue_unit_writes_list_and_tar_and_clears_staging() {
        let mirror = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let record = mirror.path().join("pot0:/data/a.uv");
        fs::create_dir_all(&record).unwrap();
        fs::write(record.join("visdata"), b"x").unwrap();

        let archive = archive(mirror.path(), work.path());
        let batch = vec![Candidate {
            path: "pot0:/data/a.uv".into(),
            size_bytes: 1,
            content_hash: None,
        }];
        let staged = archive.stage_batch(4, &batch).unwrap();
        archive.queue_unit(4, &staged).unwrap();

        let list = fs::read_to_string(archive.unit_list_path(4)).unwrap();
        assert_eq!(list, "4:1:pot0:/data/a.uv\n");
        assert!(archive.unit_tar_path(4).is_file());
        assert!(!work.path().join("shm/000001123/paper.000001123.4").exists());
    }

    #[test]
    fn tape_ids_roundtrip_through_queue_dir() {
        let mirror = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let archive = archive(mirror.path(), work.path());
        let labels = vec!["PAPR1001".to_string(), "PAPR2001".to_string()];
        archive.save_tape_ids(&labels).unwrap();
        assert_eq!(archive.tape_ids_from_file().unwrap(), labels);
    }

    #[test]
    fn run_catalog_roundtrip() {
        let mirror = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let archive = archive(mirror.path(), work.path());

        let mut manifest = Manifest::new();
        manifest.append(0, 1, "d41d8cd98f00b204e9800998ecf8427e", "pot0:/data/a.uv");
        archive.write_run_catalog(&manifest, "20260807-1200").unwrap();

        let decoded = archive.load_run_catalog().unwrap();
        assert_eq!(decoded.run_id, "000001123");
        assert_eq!(decoded.entries, manifest.locations());
    }
}
