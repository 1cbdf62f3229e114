//! Tape library management.
//!
//! The changer robot moves tapes between storage slots and the two drives.
//! All state lives in the hardware; the inventory is re-read via the
//! external status command before every decision that depends on drive
//! occupancy, never cached across calls that move tapes.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// A drive line:
/// `Data Transfer Element 1:Full (Storage Element 1 Loaded):VolumeTag = PAPR1001`
static DRIVE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Data Transfer Element (\d+):Full \(Storage Element (\d+) Loaded\):VolumeTag = ([A-Z0-9]{8})",
    )
    .unwrap()
});

/// A storage line: `Storage Element 10:Full :VolumeTag=PAPR1010`
static STORAGE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+Storage Element (\d+):Full :VolumeTag=([A-Z0-9]{8})").unwrap());

#[derive(Debug, Error)]
pub enum ChangerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{command} exited with {code}: {detail}")]
    CommandFailed {
        command: String,
        code: i32,
        detail: String,
    },
}

/// External changer and drive control. Production shells out to mtx and
/// mt; tests script a library in memory.
pub trait ChangerIo: Send {
    /// Raw inventory text in `mtx status` format.
    fn inventory(&self) -> Result<String, ChangerError>;
    fn load(&self, slot: u32, drive: u8) -> Result<(), ChangerError>;
    fn unload(&self, slot: u32, drive: u8) -> Result<(), ChangerError>;
    fn rewind(&self, drive: u8) -> Result<(), ChangerError>;
}

/// Production control via the mtx and mt commands.
pub struct MtxCommand {
    changer_dev: PathBuf,
    device_prefix: String,
}

impl MtxCommand {
    pub fn new(changer_dev: impl Into<PathBuf>, device_prefix: impl Into<String>) -> Self {
        Self {
            changer_dev: changer_dev.into(),
            device_prefix: device_prefix.into(),
        }
    }

    fn run(&self, mut command: Command) -> Result<std::process::Output, ChangerError> {
        let rendered = format!("{command:?}");
        debug!(command = %rendered, "running");
        let output = command.output()?;
        if !output.status.success() {
            return Err(ChangerError::CommandFailed {
                command: rendered,
                code: output.status.code().unwrap_or(-1),
                detail: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }
}

impl ChangerIo for MtxCommand {
    fn inventory(&self) -> Result<String, ChangerError> {
        let mut command = Command::new("mtx");
        command.arg("-f").arg(&self.changer_dev).arg("status");
        let output = self.run(command)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn load(&self, slot: u32, drive: u8) -> Result<(), ChangerError> {
        let mut command = Command::new("mtx");
        command
            .arg("-f")
            .arg(&self.changer_dev)
            .arg("load")
            .arg(slot.to_string())
            .arg(drive.to_string());
        self.run(command).map(|_| ())
    }

    fn unload(&self, slot: u32, drive: u8) -> Result<(), ChangerError> {
        let mut command = Command::new("mtx");
        command
            .arg("-f")
            .arg(&self.changer_dev)
            .arg("unload")
            .arg(slot.to_string())
            .arg(drive.to_string());
        self.run(command).map(|_| ())
    }

    fn rewind(&self, drive: u8) -> Result<(), ChangerError> {
        let mut command = Command::new("mt");
        command
            .arg("-f")
            .arg(format!("{}{}", self.device_prefix, drive))
            .arg("rewind");
        self.run(command).map(|_| ())
    }
}

/// Parsed library state.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Loaded tape per drive.
    pub label_in_drive: HashMap<u8, String>,
    /// Drive and home storage slot of every loaded tape.
    pub drive_ids: HashMap<String, (u8, u32)>,
    /// Storage slot of every tape at rest.
    pub tape_slots: HashMap<String, u32>,
}

/// Parse `mtx status` output into drive and slot maps.
pub fn parse_inventory(output: &str) -> Inventory {
    let mut inventory = Inventory::default();
    for line in output.lines() {
        if let Some(caps) = DRIVE_LINE.captures(line) {
            let drive: u8 = caps[1].parse().unwrap_or(0);
            let slot: u32 = caps[2].parse().unwrap_or(0);
            let label = caps[3].to_string();
            inventory.label_in_drive.insert(drive, label.clone());
            inventory.drive_ids.insert(label, (drive, slot));
        } else if let Some(caps) = STORAGE_LINE.captures(line) {
            let slot: u32 = caps[1].parse().unwrap_or(0);
            inventory.tape_slots.insert(caps[2].to_string(), slot);
        }
    }
    inventory
}

/// The changer plus its last-read inventory.
pub struct Changer {
    io: Box<dyn ChangerIo>,
    inventory: Inventory,
}

impl Changer {
    pub fn new(io: Box<dyn ChangerIo>) -> Result<Self, ChangerError> {
        let mut changer = Self {
            io,
            inventory: Inventory::default(),
        };
        changer.check_inventory()?;
        Ok(changer)
    }

    /// Re-read the library inventory.
    pub fn check_inventory(&mut self) -> Result<(), ChangerError> {
        let output = self.io.inventory()?;
        self.inventory = parse_inventory(&output);
        debug!(
            drives = self.inventory.label_in_drive.len(),
            slots = self.inventory.tape_slots.len(),
            "inventory"
        );
        Ok(())
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// True when no drive holds a tape. Refreshes the inventory first.
    pub fn drives_empty(&mut self) -> bool {
        if self.check_inventory().is_err() {
            return false;
        }
        self.inventory.label_in_drive.is_empty()
    }

    /// True when the given drive is empty. Refreshes the inventory first.
    pub fn drive_empty(&mut self, drive: u8) -> bool {
        if self.check_inventory().is_err() {
            return false;
        }
        !self.inventory.label_in_drive.contains_key(&drive)
    }

    /// Load a tape into a drive, unloading whatever is in the way.
    ///
    /// Up to 3 attempts: an empty drive is loaded directly; a drive that
    /// already holds the requested label is rewound in place; a drive
    /// holding another tape is unloaded and the attempt repeated.
    pub fn load_tape_drive(&mut self, label: &str, drive: u8) -> bool {
        debug!(label, drive, "check then load");
        for attempt in 0..3 {
            if self.drive_empty(drive) {
                debug!(label, drive, attempt, "loading");
                return self.load_tape(label, drive);
            }

            match self.inventory.label_in_drive.get(&drive) {
                Some(loaded) if loaded == label => {
                    // Already in place; callers expect a rewound tape.
                    return self.rewind_tape(label);
                }
                Some(loaded) => {
                    let loaded = loaded.clone();
                    debug!(label, drive, loaded, attempt, "drive filled, unloading");
                    self.unload_tape(&loaded);
                }
                None => {}
            }
        }
        warn!(label, drive, "load retries exhausted");
        false
    }

    /// Load a pair of tapes into drives 0 and 1.
    ///
    /// Requires both drives empty and exactly two labels; any deviation is
    /// reported and left for the caller to observe via the inventory.
    pub fn load_tape_pair(&mut self, labels: &[String]) {
        debug!("checking drives");
        if !self.drives_empty() {
            debug!(?labels, "drives not empty, not loading pair");
            return;
        }
        if labels.len() != 2 {
            debug!(?labels, "need exactly two labels for a pair");
            return;
        }
        for (drive, label) in labels.iter().enumerate() {
            debug!(label, drive, "loading");
            self.load_tape(label, drive as u8);
        }
    }

    /// Unload every loaded tape back to its home slot.
    pub fn unload_tape_pair(&mut self) {
        if self.drives_empty() {
            return;
        }
        let loaded: Vec<String> = self.inventory.drive_ids.keys().cloned().collect();
        for label in loaded {
            debug!(label, "unloading");
            self.unload_tape(&label);
        }
    }

    /// Unload one tape if it is loaded; a no-op otherwise.
    pub fn unload_tape_drive(&mut self, label: &str) {
        if self.drives_empty() {
            debug!(label, "drives already empty");
            return;
        }
        self.unload_tape(label);
    }

    /// Rewind the drive holding the given tape.
    pub fn rewind_tape(&mut self, label: &str) -> bool {
        match self.inventory.drive_ids.get(label) {
            Some(&(drive, _)) => {
                debug!(label, drive, "rewinding");
                match self.io.rewind(drive) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(label, %err, "rewind failed");
                        false
                    }
                }
            }
            None => {
                warn!(label, "tape not loaded, cannot rewind");
                false
            }
        }
    }

    fn load_tape(&mut self, label: &str, drive: u8) -> bool {
        let Some(&slot) = self.inventory.tape_slots.get(label) else {
            warn!(label, "tape not found in any storage slot");
            return false;
        };
        if let Err(err) = self.io.load(slot, drive) {
            warn!(label, drive, %err, "load failed");
            return false;
        }
        if self.check_inventory().is_err() {
            return false;
        }
        self.inventory.label_in_drive.get(&drive).map(String::as_str) == Some(label)
    }

    fn unload_tape(&mut self, label: &str) -> bool {
        let Some(&(drive, slot)) = self.inventory.drive_ids.get(label) else {
            debug!(label, "not loaded, nothing to unload");
            return true;
        };
        debug!(label, drive, slot, "unloading to home slot");
        if let Err(err) = self.io.unload(slot, drive) {
            warn!(label, %err, "unload failed");
            return false;
        }
        self.check_inventory().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    const SAMPLE: &str = "\
  Storage Changer /dev/changer:2 Drives, 20 Slots ( 0 Import/Export )
Data Transfer Element 0:Full (Storage Element 1 Loaded):VolumeTag = PAPR1001
Data Transfer Element 1:Empty
      Storage Element 2:Full :VolumeTag=PAPR1002
      Storage Element 3:Full :VolumeTag=PAPR2001
      Storage Element 4:Empty
";

    #[test]
    fn parses_drive_and_storage_lines() {
        let inventory = parse_inventory(SAMPLE);
        assert_eq!(inventory.label_in_drive.get(&0).map(String::as_str), Some("PAPR1001"));
        assert!(!inventory.label_in_drive.contains_key(&1));
        assert_eq!(inventory.drive_ids.get("PAPR1001"), Some(&(0, 1)));
        assert_eq!(inventory.tape_slots.get("PAPR1002"), Some(&2));
        assert_eq!(inventory.tape_slots.get("PAPR2001"), Some(&3));
    }

    /// In-memory library scripted to behave like a real changer.
    struct FakeLibrary {
        /// drive -> (label, home slot)
        drives: RefCell<BTreeMap<u8, (String, u32)>>,
        /// slot -> label
        slots: RefCell<BTreeMap<u32, String>>,
        rewind_fails: bool,
    }

    impl FakeLibrary {
        fn new(slots: &[(u32, &str)]) -> Self {
            Self {
                drives: RefCell::new(BTreeMap::new()),
                slots: RefCell::new(
                    slots
                        .iter()
                        .map(|&(slot, label)| (slot, label.to_string()))
                        .collect(),
                ),
                rewind_fails: false,
            }
        }
    }

    impl ChangerIo for FakeLibrary {
        fn inventory(&self) -> Result<String, ChangerError> {
            let mut out = String::new();
            for (drive, (label, slot)) in self.drives.borrow().iter() {
                out.push_str(&format!(
                    "Data Transfer Element {drive}:Full (Storage Element {slot} Loaded):VolumeTag = {label}\n"
                ));
            }
            for (slot, label) in self.slots.borrow().iter() {
                out.push_str(&format!("      Storage Element {slot}:Full :VolumeTag={label}\n"));
            }
            Ok(out)
        }

        fn load(&self, slot: u32, drive: u8) -> Result<(), ChangerError> {
            let label = self.slots.borrow_mut().remove(&slot).ok_or_else(|| {
                ChangerError::CommandFailed {
                    command: format!("mtx load {slot} {drive}"),
                    code: 1,
                    detail: "source slot empty".into(),
                }
            })?;
            self.drives.borrow_mut().insert(drive, (label, slot));
            Ok(())
        }

        fn unload(&self, slot: u32, drive: u8) -> Result<(), ChangerError> {
            let (label, _) = self.drives.borrow_mut().remove(&drive).ok_or_else(|| {
                ChangerError::CommandFailed {
                    command: format!("mtx unload {slot} {drive}"),
                    code: 1,
                    detail: "drive empty".into(),
                }
            })?;
            self.slots.borrow_mut().insert(slot, label);
            Ok(())
        }

        fn rewind(&self, drive: u8) -> Result<(), ChangerError> {
            if self.rewind_fails {
                Err(ChangerError::CommandFailed {
                    command: format!("mt -f /dev/nst{drive} rewind"),
                    code: 2,
                    detail: "device error".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn loads_into_empty_drive() {
        let library = FakeLibrary::new(&[(1, "PAPR1001"), (2, "PAPR2001")]);
        let mut changer = Changer::new(Box::new(library)).unwrap();
        assert!(changer.load_tape_drive("PAPR1001", 0));
        assert_eq!(
            changer.inventory().label_in_drive.get(&0).map(String::as_str),
            Some("PAPR1001")
        );
    }

    #[test]
    fn loaded_tape_is_rewound_in_place() {
        let library = FakeLibrary::new(&[(1, "PAPR1001")]);
        let mut changer = Changer::new(Box::new(library)).unwrap();
        assert!(changer.load_tape_drive("PAPR1001", 0));
        // Second load finds the same label and rewinds instead.
        assert!(changer.load_tape_drive("PAPR1001", 0));
    }

    #[test]
    fn occupied_drive_is_unloaded_then_retried() {
        let library = FakeLibrary::new(&[(1, "PAPR1001"), (2, "PAPR1002")]);
        let mut changer = Changer::new(Box::new(library)).unwrap();
        assert!(changer.load_tape_drive("PAPR1002", 0));
        assert!(changer.load_tape_drive("PAPR1001", 0));
        assert_eq!(
            changer.inventory().label_in_drive.get(&0).map(String::as_str),
            Some("PAPR1001")
        );
        // The displaced tape went back to its home slot.
        assert_eq!(changer.inventory().tape_slots.get("PAPR1002"), Some(&2));
    }

    #[test]
    fn missing_tape_fails_after_retries() {
        let library = FakeLibrary::new(&[(1, "PAPR1001")]);
        let mut changer = Changer::new(Box::new(library)).unwrap();
        assert!(!changer.load_tape_drive("PAPR9999", 0));
    }

    #[test]
    fn pair_load_requires_two_labels_and_empty_drives() {
        let library = FakeLibrary::new(&[(1, "PAPR1001"), (2, "PAPR2001")]);
        let mut changer = Changer::new(Box::new(library)).unwrap();

        changer.load_tape_pair(&["PAPR1001".to_string()]);
        assert!(changer.drives_empty());

        changer.load_tape_pair(&["PAPR1001".to_string(), "PAPR2001".to_string()]);
        assert_eq!(changer.inventory().label_in_drive.len(), 2);

        // A second pair load with occupied drives is a no-op.
        changer.load_tape_pair(&["PAPR1001".to_string(), "PAPR2001".to_string()]);
        assert_eq!(changer.inventory().label_in_drive.len(), 2);

        changer.unload_tape_pair();
        assert!(changer.drives_empty());
    }

    #[test]
    fn rewind_failure_is_reported_not_raised() {
        let mut library = FakeLibrary::new(&[(1, "PAPR1001")]);
        library.rewind_fails = true;
        let mut changer = Changer::new(Box::new(library)).unwrap();
        assert!(changer.load_tape_drive("PAPR1001", 0));
        assert!(!changer.rewind_tape("PAPR1001"));
        assert!(!changer.rewind_tape("PAPR9999"));
    }
}
