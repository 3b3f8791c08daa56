/// Capacity-bounded key-value storage for checkpoint records
///
/// The manager never touches a backend directly except through
/// [`CheckpointStore`], so in-memory, file and SQLite backends are
/// interchangeable. Records are written whole and never updated in place.
use super::{CheckpointPriority, TriggerType};
use crate::{ResilienceError, ResilienceResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One persisted checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    pub id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Monotonic clock reading at creation, meaningful within one process
    pub created_ms: u64,
    pub trigger: TriggerType,
    pub priority: CheckpointPriority,
    pub milestone: bool,
    /// Hex SHA-256 of the uncompressed snapshot
    pub checksum: String,
    /// gzip-compressed snapshot; kept out of the metadata file of the file
    /// backend
    #[serde(skip)]
    pub compressed_snapshot: Vec<u8>,
}

/// Storage backend contract
pub trait CheckpointStore: Send + Sync {
    fn get(&self, id: &str) -> ResilienceResult<Option<StoredCheckpoint>>;

    /// Insert a record. Overwriting an existing id is allowed when full;
    /// a new id on a full store fails with `ResilienceError::Store`.
    fn set(&self, record: StoredCheckpoint) -> ResilienceResult<()>;

    /// Returns whether a record was removed
    fn delete(&self, id: &str) -> ResilienceResult<bool>;

    /// Every record, oldest sequence first
    fn list(&self) -> ResilienceResult<Vec<StoredCheckpoint>>;

    fn len(&self) -> ResilienceResult<usize>;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> ResilienceResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn store_full(capacity: usize) -> ResilienceError {
    ResilienceError::Store(format!("store full (capacity {})", capacity))
}

/// In-memory backend, lost at process exit
#[derive(Debug)]
pub struct MemoryCheckpointStore {
    capacity: usize,
    records: Mutex<BTreeMap<String, StoredCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StoredCheckpoint>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite a stored blob in place, simulating storage corruption
    pub fn corrupt(&self, id: &str, compressed_snapshot: Vec<u8>) -> bool {
        match self.lock().get_mut(id) {
            Some(record) => {
                record.compressed_snapshot = compressed_snapshot;
                true
            }
            None => false,
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, id: &str) -> ResilienceResult<Option<StoredCheckpoint>> {
        Ok(self.lock().get(id).cloned())
    }

    fn set(&self, record: StoredCheckpoint) -> ResilienceResult<()> {
        let mut records = self.lock();
        if !records.contains_key(&record.id) && records.len() >= self.capacity {
            return Err(store_full(self.capacity));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    fn delete(&self, id: &str) -> ResilienceResult<bool> {
        Ok(self.lock().remove(id).is_some())
    }

    fn list(&self) -> ResilienceResult<Vec<StoredCheckpoint>> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    fn len(&self) -> ResilienceResult<usize> {
        Ok(self.lock().len())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Directory backend: `<id>.json` metadata next to a `<id>.gz` blob.
///
/// The blob is written before its metadata, and both go through a temporary
/// file and a rename, so a record only becomes visible once complete.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    capacity: usize,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store directory
    pub fn open(dir: impl Into<PathBuf>, capacity: usize) -> ResilienceResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;

        Ok(Self {
            dir,
            capacity,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.gz", id))
    }

    fn read_record(&self, id: &str) -> ResilienceResult<Option<StoredCheckpoint>> {
        let meta = match fs::read(self.meta_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut record: StoredCheckpoint = serde_json::from_slice(&meta)?;
        record.compressed_snapshot = match fs::read(self.blob_path(id)) {
            Ok(blob) => blob,
            // Metadata without a blob still lists, and fails its checksum
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(record))
    }

    fn ids(&self) -> ResilienceResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if valid_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }
}

/// Ids become file names; anything but `[A-Za-z0-9_-]` is refused
fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn write_atomic(path: &Path, bytes: &[u8]) -> ResilienceResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, id: &str) -> ResilienceResult<Option<StoredCheckpoint>> {
        if !valid_id(id) {
            return Ok(None);
        }
        self.read_record(id)
    }

    fn set(&self, record: StoredCheckpoint) -> ResilienceResult<()> {
        if !valid_id(&record.id) {
            return Err(ResilienceError::Store(format!(
                "invalid checkpoint id: {:?}",
                record.id
            )));
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let exists = self.meta_path(&record.id).exists();
        if !exists && self.ids()?.len() >= self.capacity {
            return Err(store_full(self.capacity));
        }

        let meta = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.blob_path(&record.id), &record.compressed_snapshot)?;
        write_atomic(&self.meta_path(&record.id), &meta)?;

        tracing::trace!(id = %record.id, dir = %self.dir.display(), "Checkpoint written");
        Ok(())
    }

    fn delete(&self, id: &str) -> ResilienceResult<bool> {
        if !valid_id(id) {
            return Ok(false);
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existed = match fs::remove_file(self.meta_path(id)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(self.blob_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(existed)
    }

    fn list(&self) -> ResilienceResult<Vec<StoredCheckpoint>> {
        let mut records = Vec::new();
        for id in self.ids()? {
            match self.read_record(&id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Skipping unreadable checkpoint record");
                }
            }
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    fn len(&self) -> ResilienceResult<usize> {
        Ok(self.ids()?.len())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
