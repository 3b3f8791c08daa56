/// Validated application-state checkpoints with progressive rollback
///
/// # Pipeline
///
/// ```text
/// StateSnapshotProvider::serialize()
///          │
///          ↓
///   structural validation ──✗──→ rejected, never stored
///   (NaN/∞, nesting, shape, provider.validate)
///          │
///          ↓
///   SHA-256 over the raw blob
///          │
///          ↓
///   gzip → CheckpointStore::set ──→ retention (count, age, milestones)
/// ```
///
/// Rollback reverses the path: load, decompress, verify the checksum, then
/// hand the blob back to the provider. A record whose checksum does not match
/// is marked INVALID and never used again.
pub mod file_state;
mod manager;
pub mod sqlite;
pub mod store;
pub mod validation;

pub use file_state::JsonFileState;
pub use manager::{CheckpointManager, CheckpointStats};
pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, StoredCheckpoint};
pub use validation::{validate_snapshot, SnapshotValidation};

use crate::{ResilienceError, ResilienceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::oneshot;

/// The external save/game-state system, seen from the checkpoint manager
#[cfg_attr(test, mockall::automock)]
pub trait StateSnapshotProvider: Send + Sync {
    /// Serialize the current application state into a JSON document
    fn serialize(&self) -> anyhow::Result<Vec<u8>>;

    /// Replace the current application state with the one in `snapshot`
    fn restore(&self, snapshot: &[u8]) -> anyhow::Result<()>;

    /// Schema checks the host knows about; the engine's own structural
    /// checks run first either way
    fn validate(&self, _snapshot: &[u8]) -> anyhow::Result<SnapshotValidation> {
        Ok(SnapshotValidation::valid())
    }
}

/// What caused a checkpoint to be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Manual,
    Periodic,
    /// Taken before a disruptive recovery action
    PreRecovery,
    /// Significant progress; exempt from age-based eviction
    Milestone,
    Shutdown,
}

impl TriggerType {
    pub fn is_milestone(&self) -> bool {
        matches!(self, TriggerType::Milestone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "MANUAL",
            TriggerType::Periodic => "PERIODIC",
            TriggerType::PreRecovery => "PRE_RECOVERY",
            TriggerType::Milestone => "MILESTONE",
            TriggerType::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "MANUAL" => Ok(TriggerType::Manual),
            "PERIODIC" => Ok(TriggerType::Periodic),
            "PRE_RECOVERY" => Ok(TriggerType::PreRecovery),
            "MILESTONE" => Ok(TriggerType::Milestone),
            "SHUTDOWN" => Ok(TriggerType::Shutdown),
            other => Err(ResilienceError::Store(format!("unknown trigger type: {}", other))),
        }
    }
}

/// Creation priority; HIGH bypasses throttling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointPriority {
    #[default]
    Normal,
    High,
}

impl CheckpointPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointPriority::Normal => "NORMAL",
            CheckpointPriority::High => "HIGH",
        }
    }
}

impl FromStr for CheckpointPriority {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(CheckpointPriority::Normal),
            "HIGH" => Ok(CheckpointPriority::High),
            other => Err(ResilienceError::Store(format!("unknown priority: {}", other))),
        }
    }
}

/// Lifecycle of a checkpoint as tracked by the manager
///
/// ```text
/// PENDING_VALIDATION ──→ VALID ──→ ACTIVE
///          │               │         │
///          ↓               ↓         ↓
///       INVALID         EVICTED   EVICTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    /// Loaded from a store and not yet re-verified
    PendingValidation,
    Valid,
    /// Failed its checksum or could not be restored; never used again
    Invalid,
    /// The checkpoint most recently restored
    Active,
    Evicted,
}

impl CheckpointStatus {
    /// Whether rollback may consider this checkpoint
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            CheckpointStatus::PendingValidation | CheckpointStatus::Valid | CheckpointStatus::Active
        )
    }
}

/// A validated snapshot. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Unique checkpoint identifier (UUID)
    pub id: String,

    /// Monotonic creation order, newest highest
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub trigger: TriggerType,

    pub priority: CheckpointPriority,

    /// Uncompressed state blob as produced by the provider
    pub snapshot: Vec<u8>,

    /// Hex SHA-256 of `snapshot`
    pub checksum: String,

    pub validation: SnapshotValidation,
}

impl Checkpoint {
    pub fn summary(&self, status: CheckpointStatus, stored_bytes: usize) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            sequence: self.sequence,
            timestamp: self.timestamp,
            trigger: self.trigger,
            priority: self.priority,
            milestone: self.trigger.is_milestone(),
            status,
            checksum: self.checksum.clone(),
            snapshot_bytes: self.snapshot.len(),
            stored_bytes,
        }
    }
}

/// Metadata view of a checkpoint, without the blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub trigger: TriggerType,
    pub priority: CheckpointPriority,
    pub milestone: bool,
    pub status: CheckpointStatus,
    pub checksum: String,
    /// Uncompressed size
    pub snapshot_bytes: usize,
    /// Compressed size as held by the store
    pub stored_bytes: usize,
}

/// Which checkpoint a rollback should restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollbackTarget {
    /// Exactly this checkpoint, or fail
    Id(String),
    /// The newest usable checkpoint, without walking further back
    Latest,
    /// Newest to oldest, skipping invalid ones, until one restores
    Progressive,
}

impl fmt::Display for RollbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackTarget::Id(id) => write!(f, "id:{}", id),
            RollbackTarget::Latest => f.write_str("latest"),
            RollbackTarget::Progressive => f.write_str("progressive"),
        }
    }
}

impl FromStr for RollbackTarget {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ResilienceError::CheckpointNotFound(String::new())),
            "latest" => Ok(RollbackTarget::Latest),
            "progressive" => Ok(RollbackTarget::Progressive),
            other => Ok(RollbackTarget::Id(
                other.strip_prefix("id:").unwrap_or(other).to_string(),
            )),
        }
    }
}

/// Result of a successful rollback
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    /// Checkpoint now in effect
    pub checkpoint_id: String,
    pub target: RollbackTarget,
    pub reason: String,
    /// Candidates examined, including the restored one
    pub tried: usize,
    /// Candidates marked INVALID during this rollback
    pub invalidated: Vec<String>,
    /// A pre-rollback snapshot was captured and `undo_last_rollback` can use it
    pub undo_available: bool,
    pub restored_at: DateTime<Utc>,
}

/// Completion signal for a deferred checkpoint.
///
/// The checkpoint does not exist until the ticket resolves.
#[derive(Debug)]
pub struct CheckpointTicket {
    receiver: Option<oneshot::Receiver<ResilienceResult<CheckpointSummary>>>,
    resolved: Option<ResilienceResult<CheckpointSummary>>,
}

impl CheckpointTicket {
    pub(crate) fn channel() -> (oneshot::Sender<ResilienceResult<CheckpointSummary>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                receiver: Some(rx),
                resolved: None,
            },
        )
    }

    /// Poll without blocking; `None` while creation is still pending
    pub fn try_result(&mut self) -> Option<ResilienceResult<CheckpointSummary>> {
        if self.resolved.is_none() {
            if let Some(receiver) = self.receiver.as_mut() {
                match receiver.try_recv() {
                    Ok(result) => {
                        self.resolved = Some(result);
                        self.receiver = None;
                    }
                    Err(oneshot::error::TryRecvError::Empty) => return None,
                    Err(oneshot::error::TryRecvError::Closed) => {
                        self.resolved = Some(Err(ResilienceError::Cancelled));
                        self.receiver = None;
                    }
                }
            }
        }
        self.resolved.clone()
    }

    pub fn is_ready(&mut self) -> bool {
        self.try_result().is_some()
    }

    /// Wait for the deferred creation to finish
    pub async fn wait(mut self) -> ResilienceResult<CheckpointSummary> {
        if let Some(result) = self.resolved.take() {
            return result;
        }
        match self.receiver.take() {
            Some(receiver) => receiver.await.unwrap_or(Err(ResilienceError::Cancelled)),
            None => Err(ResilienceError::Cancelled),
        }
    }
}
