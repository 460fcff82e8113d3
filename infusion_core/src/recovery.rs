//! Durable key-value slots for crash recovery.
//!
//! The bolus manager writes the in-flight bolus here as soon as the pod
//! accepts it, and removes it only after the delivered amount is in the
//! ledger. Each slot is one JSON file, written atomically through a temp file
//! in the same directory and renamed over the original.

use crate::{Error, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Slot holding the bolus currently being delivered
pub const ACTIVE_BOLUS_SLOT: &str = "active_bolus";

/// Simple key-value store that survives process restarts
pub trait DurableStore: Send + Sync {
    fn put(&self, slot: &str, value: &str) -> Result<()>;
    fn get(&self, slot: &str) -> Result<Option<String>>;
    fn remove(&self, slot: &str) -> Result<()>;
}

/// One file per slot under a directory
pub struct FileDurableStore {
    dir: PathBuf,
}

impl FileDurableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn slot_path(&self, slot: &str) -> Result<PathBuf> {
        if slot.is_empty() || !slot.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Recovery(format!("invalid slot name {slot:?}")));
        }
        Ok(self.dir.join(format!("{slot}.json")))
    }
}

impl DurableStore for FileDurableStore {
    fn put(&self, slot: &str, value: &str) -> Result<()> {
        let path = self.slot_path(slot)?;
        std::fs::create_dir_all(&self.dir)?;
        write_atomic(&path, value.as_bytes())?;
        tracing::debug!("Stored recovery slot {} at {:?}", slot, path);
        Ok(())
    }

    fn get(&self, slot: &str) -> Result<Option<String>> {
        let path = self.slot_path(slot)?;
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path)?;
        file.lock_shared()?;
        let mut contents = String::new();
        let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
        file.unlock()?;
        read?;

        Ok(Some(contents))
    }

    fn remove(&self, slot: &str) -> Result<()> {
        let path = self.slot_path(slot)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Cleared recovery slot {}", slot);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Atomically replace `path` with `contents`.
///
/// Writes to a temp file in the same directory, syncs it, then renames it
/// over the original.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Recovery(format!("{path:?} has no parent directory")))?;
    std::fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    temp.as_file().lock_exclusive()?;

    {
        let mut writer = std::io::BufWriter::new(temp.as_file());
        writer.write_all(contents)?;
        writer.flush()?;
    }

    temp.as_file().sync_all()?;
    temp.as_file().unlock()?;

    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// In-memory durable store for tests and embedders with their own persistence
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryDurableStore {
    fn put(&self, slot: &str, value: &str) -> Result<()> {
        self.slots
            .lock()
            .map_err(|_| Error::Recovery("slot lock poisoned".into()))?
            .insert(slot.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, slot: &str) -> Result<Option<String>> {
        Ok(self
            .slots
            .lock()
            .map_err(|_| Error::Recovery("slot lock poisoned".into()))?
            .get(slot)
            .cloned())
    }

    fn remove(&self, slot: &str) -> Result<()> {
        self.slots
            .lock()
            .map_err(|_| Error::Recovery("slot lock poisoned".into()))?
            .remove(slot);
        Ok(())
    }
}
