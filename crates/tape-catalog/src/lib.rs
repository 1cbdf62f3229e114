//! Text catalog format for tape dump runs.
//!
//! A dump run records everything it writes in a plain-text catalog that is
//! stored both in the run's queue directory and as the first physical block
//! of every tape written. The format is line oriented:
//!
//! ```text
//! ## Paper dump catalog:<run_id> (version: <v> on <YYYYMMDD-HHMM>)
//! ## This tape contains files as listed below:
//! ## item_index:unit_index:archive_index:content_hash:path
//! 1:0:1:d41d8cd98f00b204e9800998ecf8427e:host1:/data/zen.2455988.uv
//! ```
//!
//! Decoding only recognizes the header line and well-formed data lines;
//! anything else is skipped, so future commentary lines do not break old
//! readers.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

/// Header line, capturing the run id.
static HEADER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^## Paper dump catalog:([0-9]+)").unwrap());

/// Data line: item, unit, archive index, 32 hex chars of digest, path.
static DATA_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+):([0-9]+):([0-9]+):([a-f0-9]{32}):(.*)$").unwrap());

/// Tape-ids recovery file body: `[LABEL1,LABEL2]`.
static TAPE_IDS_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(.*)\]").unwrap());

/// One line of the run-wide catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// 1-based position over the whole run, strictly increasing.
    pub item_index: u64,
    /// Which archive unit on tape holds the record.
    pub unit_index: u64,
    /// 1-based position of the record within its unit.
    pub archive_index: u64,
    /// 32 lowercase hex chars.
    pub content_hash: String,
    pub path: String,
}

/// Position of a record on tape, without the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub unit_index: u64,
    pub archive_index: u64,
    pub path: String,
}

/// The run's authoritative record of everything written.
///
/// Entries are appended in write order; `item_index` is assigned on append
/// and is strictly increasing from 1.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record, assigning the next item index.
    pub fn append(
        &mut self,
        unit_index: u64,
        archive_index: u64,
        content_hash: impl Into<String>,
        path: impl Into<String>,
    ) {
        let item_index = self.entries.len() as u64 + 1;
        self.entries.push(ManifestEntry {
            item_index,
            unit_index,
            archive_index,
            content_hash: content_hash.into(),
            path: path.into(),
        });
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Item index of the last entry, 0 when empty.
    pub fn last_item_index(&self) -> u64 {
        self.entries.last().map(|e| e.item_index).unwrap_or(0)
    }

    /// The entries as tape positions, in item order.
    pub fn locations(&self) -> Vec<CatalogEntry> {
        self.entries
            .iter()
            .map(|e| CatalogEntry {
                unit_index: e.unit_index,
                archive_index: e.archive_index,
                path: e.path.clone(),
            })
            .collect()
    }

    /// Content digest per path.
    pub fn hash_by_path(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.path.clone(), e.content_hash.clone()))
            .collect()
    }
}

/// Result of decoding a catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedCatalog {
    /// Item index of the last data line seen, 0 if none.
    pub last_item_index: u64,
    /// Tape positions in the order the lines appeared.
    pub entries: Vec<CatalogEntry>,
    /// Content digest per path.
    pub hash_by_path: HashMap<String, String>,
    /// Run id from the header line, empty if no header was present.
    pub run_id: String,
}

impl DecodedCatalog {
    /// Rebuild a manifest from the decoded parts, in line order.
    pub fn to_manifest(&self) -> Manifest {
        let mut manifest = Manifest::new();
        for entry in &self.entries {
            let hash = self
                .hash_by_path
                .get(&entry.path)
                .cloned()
                .unwrap_or_default();
            manifest.append(entry.unit_index, entry.archive_index, hash, entry.path.clone());
        }
        manifest
    }
}

/// Render the run-wide catalog text.
///
/// `date` is the run timestamp already formatted as `YYYYMMDD-HHMM`.
pub fn encode(manifest: &Manifest, run_id: &str, version: u32, date: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "## Paper dump catalog:{run_id} (version: {version} on {date})\n"
    ));
    out.push_str("## This tape contains files as listed below:\n");
    out.push_str("## item_index:unit_index:archive_index:content_hash:path\n");
    for entry in manifest.entries() {
        out.push_str(&format!(
            "{}:{}:{}:{}:{}\n",
            entry.item_index, entry.unit_index, entry.archive_index, entry.content_hash, entry.path
        ));
    }
    out
}

/// Parse catalog text back into its parts.
///
/// Lines matching neither fixed pattern are skipped.
pub fn decode<I, S>(lines: I) -> DecodedCatalog
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut decoded = DecodedCatalog::default();

    for line in lines {
        let line = line.as_ref();
        if let Some(caps) = DATA_LINE.captures(line) {
            // Indices are guaranteed numeric by the pattern.
            decoded.last_item_index = caps[1].parse().unwrap_or(0);
            let unit_index = caps[2].parse().unwrap_or(0);
            let archive_index = caps[3].parse().unwrap_or(0);
            let content_hash = caps[4].to_string();
            let path = caps[5].to_string();
            decoded.hash_by_path.insert(path.clone(), content_hash);
            decoded.entries.push(CatalogEntry {
                unit_index,
                archive_index,
                path,
            });
        } else if let Some(caps) = HEADER_LINE.captures(line) {
            decoded.run_id = caps[1].to_string();
        }
    }

    decoded
}

/// Render the per-unit list file: one `unit:archive:path` line per record,
/// archive indices 1-based in the given order.
pub fn encode_unit_list(unit_index: u64, paths: &[String]) -> String {
    let mut out = String::new();
    for (offset, path) in paths.iter().enumerate() {
        out.push_str(&format!("{}:{}:{}\n", unit_index, offset + 1, path));
    }
    out
}

/// Render the tape-ids recovery file body.
pub fn format_tape_ids(labels: &[String]) -> String {
    format!("[{}]\n", labels.join(","))
}

/// Parse a tape-ids recovery file, returning the labels in order.
pub fn parse_tape_ids(text: &str) -> Option<Vec<String>> {
    for line in text.lines() {
        if let Some(caps) = TAPE_IDS_LINE.captures(line) {
            return Some(
                caps[1]
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.trim().to_string())
                    .collect(),
            );
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        let mut m = Manifest::new();
        m.append(0, 1, "d41d8cd98f00b204e9800998ecf8427e", "host1:/data/a.uv");
        m.append(0, 2, "900150983cd24fb0d6963f7d28e17f72", "host1:/data/b.uv");
        m.append(1, 1, "f96b697d7cb7938d525a2f31aaf161d0", "host2:/data/c.uv");
        m
    }

    #[test]
    fn roundtrip() {
        let m = sample_manifest();
        let text = encode(&m, "012345678", 1, "20260807-1200");
        let decoded = decode(text.lines());

        assert_eq!(decoded.run_id, "012345678");
        assert_eq!(decoded.last_item_index, 3);
        assert_eq!(decoded.entries, m.locations());
        assert_eq!(decoded.hash_by_path, m.hash_by_path());
    }

    #[test]
    fn item_indices_strictly_increase() {
        let m = sample_manifest();
        let indices: Vec<u64> = m.entries().iter().map(|e| e.item_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(m.last_item_index(), 3);
    }

    #[test]
    fn unknown_lines_are_skipped() {
        let text = "\
## Paper dump catalog:999000111 (version: 2 on 20260101-0000)
## some future commentary
not a data line at all
1:0:1:d41d8cd98f00b204e9800998ecf8427e:host1:/data/a.uv
2:0:2:THISISNOTLOWERHEX00000000000000aa:host1:/data/b.uv
";
        let decoded = decode(text.lines());
        assert_eq!(decoded.run_id, "999000111");
        // The uppercase digest line does not match the fixed pattern.
        assert_eq!(decoded.entries.len(), 1);
        assert_eq!(decoded.last_item_index, 1);
    }

    #[test]
    fn paths_may_contain_colons() {
        let mut m = Manifest::new();
        m.append(0, 1, "d41d8cd98f00b204e9800998ecf8427e", "pot0:/mnt/data:odd");
        let decoded = decode(encode(&m, "1", 1, "20260101-0000").lines());
        assert_eq!(decoded.entries[0].path, "pot0:/mnt/data:odd");
    }

    #[test]
    fn empty_manifest_decodes_empty() {
        let m = Manifest::new();
        let decoded = decode(encode(&m, "42", 1, "20260101-0000").lines());
        assert_eq!(decoded.last_item_index, 0);
        assert!(decoded.entries.is_empty());
        assert_eq!(decoded.run_id, "42");
    }

    #[test]
    fn decoded_catalog_rebuilds_manifest() {
        let m = sample_manifest();
        let decoded = decode(encode(&m, "7", 1, "20260101-0000").lines());
        let rebuilt = decoded.to_manifest();
        assert_eq!(rebuilt.entries(), m.entries());
    }

    #[test]
    fn unit_list_lines() {
        let paths = vec!["host1:/data/a.uv".to_string(), "host1:/data/b.uv".to_string()];
        let text = encode_unit_list(3, &paths);
        assert_eq!(text, "3:1:host1:/data/a.uv\n3:2:host1:/data/b.uv\n");
    }

    #[test]
    fn tape_ids_roundtrip() {
        let labels = vec!["PAPR1001".to_string(), "PAPR2001".to_string()];
        let text = format_tape_ids(&labels);
        assert_eq!(text, "[PAPR1001,PAPR2001]\n");
        assert_eq!(parse_tape_ids(&text), Some(labels));
        assert_eq!(parse_tape_ids("no ids here"), None);
    }
}
