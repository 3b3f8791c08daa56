/// Checkpoint creation, retention and rollback
///
/// The manager owns the store exclusively. It keeps an in-memory index of
/// every record (status, sizes, ordering) rebuilt from the store on startup;
/// the store itself only ever sees whole-record writes and deletes.
///
/// Provider calls (serialize/restore/validate) never run under the index
/// lock, and at most one rollback runs at a time.
use super::store::{CheckpointStore, StoredCheckpoint};
use super::validation::{validate_snapshot, SnapshotValidation};
use super::{
    Checkpoint, CheckpointPriority, CheckpointStatus, CheckpointSummary, CheckpointTicket,
    RollbackReport, RollbackTarget, StateSnapshotProvider, TriggerType,
};
use crate::clock::Clock;
use crate::config::CheckpointConfig;
use crate::sinks::{CheckpointEvent, MetricEvent, MetricsSink, TracingMetrics};
use crate::{ResilienceError, ResilienceResult};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Index entry for one stored checkpoint
#[derive(Debug, Clone)]
struct IndexEntry {
    id: String,
    sequence: u64,
    timestamp: DateTime<Utc>,
    trigger: TriggerType,
    priority: CheckpointPriority,
    milestone: bool,
    checksum: String,
    status: CheckpointStatus,
    invalid_reason: Option<String>,
    snapshot_bytes: usize,
    stored_bytes: usize,
}

impl IndexEntry {
    fn from_record(record: &StoredCheckpoint, status: CheckpointStatus) -> Self {
        Self {
            id: record.id.clone(),
            sequence: record.sequence,
            timestamp: record.timestamp,
            trigger: record.trigger,
            priority: record.priority,
            milestone: record.milestone,
            checksum: record.checksum.clone(),
            status,
            invalid_reason: None,
            snapshot_bytes: gzip_isize(&record.compressed_snapshot),
            stored_bytes: record.compressed_snapshot.len(),
        }
    }

    fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            sequence: self.sequence,
            timestamp: self.timestamp,
            trigger: self.trigger,
            priority: self.priority,
            milestone: self.milestone,
            status: self.status,
            checksum: self.checksum.clone(),
            snapshot_bytes: self.snapshot_bytes,
            stored_bytes: self.stored_bytes,
        }
    }
}

/// State captured just before a rollback replaced it
#[derive(Debug, Clone)]
struct UndoSnapshot {
    blob: Vec<u8>,
    /// Checkpoint that was active before the rollback, if any
    previously_active: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    created: u64,
    rejected: u64,
    throttled: u64,
    evicted: u64,
    rollbacks: u64,
    rollback_failures: u64,
    invalidated: u64,
}

#[derive(Debug, Default)]
struct IndexState {
    /// Keyed by sequence, oldest first
    entries: BTreeMap<u64, IndexEntry>,
    next_sequence: u64,
    last_created_ms: Option<u64>,
    last_created_at: Option<DateTime<Utc>>,
    undo: Option<UndoSnapshot>,
    counters: Counters,
}

impl IndexState {
    fn find(&self, id: &str) -> Option<&IndexEntry> {
        self.entries.values().find(|e| e.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut IndexEntry> {
        self.entries.values_mut().find(|e| e.id == id)
    }

    fn active_id(&self) -> Option<String> {
        self.entries
            .values()
            .find(|e| e.status == CheckpointStatus::Active)
            .map(|e| e.id.clone())
    }

    /// Sequence of the newest checkpoint a rollback could use
    fn newest_usable(&self) -> Option<u64> {
        self.entries
            .values()
            .rev()
            .find(|e| e.status.is_usable())
            .map(|e| e.sequence)
    }

    fn usable_newest_first(&self) -> Vec<String> {
        self.entries
            .values()
            .rev()
            .filter(|e| e.status.is_usable())
            .map(|e| e.id.clone())
            .collect()
    }

    fn stored_bytes(&self) -> usize {
        self.entries.values().map(|e| e.stored_bytes).sum()
    }
}

/// Checkpoint statistics for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStats {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub pending_validation: usize,
    pub milestones: usize,
    pub active: Option<String>,
    pub stored_bytes: usize,
    pub capacity: usize,
    pub created: u64,
    pub rejected: u64,
    pub throttled: u64,
    pub evicted: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
    pub invalidated: u64,
    pub last_created_at: Option<DateTime<Utc>>,
    pub undo_available: bool,
    pub deferred_requests: usize,
}

struct DeferredRequest {
    trigger: TriggerType,
    priority: CheckpointPriority,
    reply: oneshot::Sender<ResilienceResult<CheckpointSummary>>,
}

/// Clears the rollback gate when dropped
struct RollbackGuard<'a>(&'a AtomicBool);

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Why a single rollback candidate was rejected
enum CandidateFailure {
    /// The checkpoint itself is bad and was marked INVALID
    Invalid(ResilienceError),
    /// The store could not be read; the checkpoint keeps its status
    Store(ResilienceError),
}

/// Creates, validates, stores, evicts and restores checkpoints
pub struct CheckpointManager {
    config: CheckpointConfig,
    provider: Arc<dyn StateSnapshotProvider>,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<IndexState>,
    deferred: Mutex<VecDeque<DeferredRequest>>,
    rollback_in_progress: AtomicBool,
}

impl CheckpointManager {
    /// Open a manager over `store`, indexing whatever it already holds.
    ///
    /// Pre-existing records start as PENDING_VALIDATION; their checksums are
    /// verified when a rollback first reaches them.
    pub fn new(
        config: CheckpointConfig,
        provider: Arc<dyn StateSnapshotProvider>,
        store: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
    ) -> ResilienceResult<Self> {
        let mut state = IndexState::default();
        for record in store.list()? {
            state.next_sequence = state.next_sequence.max(record.sequence + 1);
            state
                .entries
                .insert(record.sequence, IndexEntry::from_record(&record, CheckpointStatus::PendingValidation));
        }
        state.next_sequence = state.next_sequence.max(1);

        if !state.entries.is_empty() {
            tracing::info!(
                checkpoints = state.entries.len(),
                capacity = store.capacity(),
                "Indexed existing checkpoints"
            );
        }

        Ok(Self {
            config,
            provider,
            store,
            clock,
            metrics: Arc::new(TracingMetrics),
            state: Mutex::new(state),
            deferred: Mutex::new(VecDeque::new()),
            rollback_in_progress: AtomicBool::new(false),
        })
    }

    /// Send checkpoint events to `metrics` instead of the tracing sink
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CheckpointEvent) {
        let event = MetricEvent::Checkpoint(event);
        if panic::catch_unwind(AssertUnwindSafe(|| self.metrics.record(&event))).is_err() {
            tracing::warn!("Metrics sink panicked while recording a checkpoint event");
        }
    }

    /// Take, validate and store a checkpoint of the current state.
    ///
    /// NORMAL priority requests within `min_interval_ms` of the previous
    /// checkpoint fail with `Throttled`. PRE_RECOVERY and MILESTONE triggers
    /// always count as HIGH.
    pub fn create(&self, trigger: TriggerType, priority: CheckpointPriority) -> ResilienceResult<Checkpoint> {
        let priority = match trigger {
            TriggerType::PreRecovery | TriggerType::Milestone => CheckpointPriority::High,
            _ => priority,
        };

        let now_ms = self.clock.now_ms();
        if priority == CheckpointPriority::Normal {
            let mut state = self.lock();
            if let Some(last) = state.last_created_ms {
                let elapsed = now_ms.saturating_sub(last);
                if elapsed < self.config.min_interval_ms {
                    let remaining_ms = self.config.min_interval_ms - elapsed;
                    state.counters.throttled += 1;
                    drop(state);
                    tracing::debug!(trigger = %trigger, remaining_ms, "Checkpoint throttled");
                    self.emit(CheckpointEvent::Throttled { remaining_ms });
                    return Err(ResilienceError::Throttled { remaining_ms });
                }
            }
        }

        let snapshot = call_provider(|| self.provider.serialize())
            .map_err(|e| ResilienceError::SnapshotFailed(format!("{:#}", e)))?;

        let validation = self.validate(&snapshot);
        if !validation.valid {
            self.lock().counters.rejected += 1;
            let reason = validation.errors.join("; ");
            tracing::warn!(trigger = %trigger, reason = %reason, "Checkpoint rejected by validation");
            self.emit(CheckpointEvent::Rejected { reason });
            return Err(ResilienceError::ValidationFailed(validation.errors));
        }

        let checksum = sha256_hex(&snapshot);
        let compressed = compress(&snapshot, self.config.compression_level)?;

        let sequence = {
            let mut state = self.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            sequence
        };

        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            sequence,
            timestamp: self.clock.wall(),
            trigger,
            priority,
            snapshot,
            checksum,
            validation,
        };
        let record = StoredCheckpoint {
            id: checkpoint.id.clone(),
            sequence,
            timestamp: checkpoint.timestamp,
            created_ms: now_ms,
            trigger,
            priority,
            milestone: trigger.is_milestone(),
            checksum: checkpoint.checksum.clone(),
            compressed_snapshot: compressed,
        };

        self.make_room()?;
        let stored_bytes = record.compressed_snapshot.len();
        let entry = IndexEntry {
            snapshot_bytes: checkpoint.snapshot.len(),
            ..IndexEntry::from_record(&record, CheckpointStatus::Valid)
        };
        self.store.set(record)?;

        {
            let mut state = self.lock();
            state.entries.insert(sequence, entry);
            state.last_created_ms = Some(now_ms);
            state.last_created_at = Some(checkpoint.timestamp);
            state.counters.created += 1;
        }

        tracing::info!(
            id = %checkpoint.id,
            trigger = %trigger,
            priority = priority.as_str(),
            bytes = checkpoint.snapshot.len(),
            stored_bytes,
            "Checkpoint created"
        );
        self.emit(CheckpointEvent::Created(
            checkpoint.summary(CheckpointStatus::Valid, stored_bytes),
        ));

        if let Err(e) = self.enforce_retention() {
            tracing::warn!(error = %e, "Checkpoint retention pass failed");
        }

        Ok(checkpoint)
    }

    fn validate(&self, snapshot: &[u8]) -> SnapshotValidation {
        let structural = validate_snapshot(snapshot, self.config.max_depth);
        if !structural.valid {
            return structural;
        }
        match call_provider(|| self.provider.validate(snapshot)) {
            Ok(host) => structural.merge(host),
            Err(e) => SnapshotValidation::invalid(vec![format!("provider validation failed: {:#}", e)]),
        }
    }

    /// Queue a checkpoint for the next idle slot
    pub fn request_checkpoint(&self, trigger: TriggerType, priority: CheckpointPriority) -> CheckpointTicket {
        let (reply, ticket) = CheckpointTicket::channel();
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(DeferredRequest {
                trigger,
                priority,
                reply,
            });
        tracing::trace!(trigger = %trigger, "Checkpoint deferred");
        ticket
    }

    /// Run every deferred checkpoint request, resolving their tickets
    pub fn run_pending(&self) -> Vec<ResilienceResult<CheckpointSummary>> {
        let requests: Vec<DeferredRequest> = self
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        requests
            .into_iter()
            .map(|request| {
                let result = self
                    .create(request.trigger, request.priority)
                    .map(|cp| self.get(&cp.id).unwrap_or_else(|| cp.summary(CheckpointStatus::Valid, 0)));
                // The caller may have dropped its ticket
                let _ = request.reply.send(result.clone());
                result
            })
            .collect()
    }

    /// Drop every deferred request; their tickets resolve as `Cancelled`
    pub fn cancel_pending(&self) -> usize {
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        let count = deferred.len();
        deferred.clear();
        count
    }

    pub fn pending_requests(&self) -> usize {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Restore a checkpoint.
    ///
    /// The current state is captured first so that `undo_last_rollback` can
    /// put it back; if it cannot be captured the rollback fails with
    /// `SnapshotFailed` and nothing is restored. Candidates whose checksum
    /// does not match, or that the provider cannot restore, are marked
    /// INVALID; a failed restore is followed by re-applying the captured
    /// state. Only one rollback may run at a time; a concurrent call fails
    /// with `Busy`.
    pub fn rollback(&self, target: RollbackTarget, reason: &str) -> ResilienceResult<RollbackReport> {
        let _guard = self.enter_rollback()?;

        let candidates = {
            let state = self.lock();
            match &target {
                RollbackTarget::Id(id) => match state.find(id) {
                    None => return Err(ResilienceError::CheckpointNotFound(id.clone())),
                    Some(entry) if !entry.status.is_usable() => {
                        return Err(ResilienceError::ValidationFailed(vec![format!(
                            "checkpoint {} is INVALID: {}",
                            id,
                            entry.invalid_reason.as_deref().unwrap_or("unknown reason")
                        )]));
                    }
                    Some(entry) => vec![entry.id.clone()],
                },
                RollbackTarget::Latest => state.usable_newest_first().into_iter().take(1).collect(),
                RollbackTarget::Progressive => state.usable_newest_first(),
            }
        };

        if candidates.is_empty() {
            self.lock().counters.rollback_failures += 1;
            tracing::warn!(rollback_target = %target, reason, "Rollback requested with no usable checkpoint");
            self.emit(CheckpointEvent::RollbackExhausted { tried: 0 });
            return Err(ResilienceError::RollbackExhausted { tried: 0 });
        }

        tracing::info!(rollback_target = %target, reason, candidates = candidates.len(), "Rollback started");

        let pre_rollback = match call_provider(|| self.provider.serialize()) {
            Ok(blob) => blob,
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::error!(error = %error, "Pre-rollback snapshot failed, rollback aborted");
                self.lock().counters.rollback_failures += 1;
                return Err(ResilienceError::SnapshotFailed(error));
            }
        };

        let mut tried = 0;
        let mut invalidated = Vec::new();
        let mut last_error = None;

        for id in &candidates {
            tried += 1;
            match self.restore_candidate(id, &pre_rollback) {
                Ok(()) => {
                    let previously_active = {
                        let mut state = self.lock();
                        let previously_active = state.active_id();
                        if let Some(prev) = previously_active.as_deref() {
                            if let Some(entry) = state.find_mut(prev) {
                                entry.status = CheckpointStatus::Valid;
                            }
                        }
                        if let Some(entry) = state.find_mut(id) {
                            entry.status = CheckpointStatus::Active;
                        }
                        state.undo = Some(UndoSnapshot {
                            blob: pre_rollback.clone(),
                            previously_active: previously_active.clone(),
                        });
                        state.counters.rollbacks += 1;
                        previously_active
                    };

                    tracing::info!(
                        id = %id,
                        rollback_target = %target,
                        tried,
                        skipped = invalidated.len(),
                        previously_active = ?previously_active,
                        "Rollback complete"
                    );
                    self.emit(CheckpointEvent::RolledBack { id: id.clone() });

                    return Ok(RollbackReport {
                        checkpoint_id: id.clone(),
                        target,
                        reason: reason.to_string(),
                        tried,
                        invalidated,
                        undo_available: true,
                        restored_at: self.clock.wall(),
                    });
                }
                Err(CandidateFailure::Invalid(e)) => {
                    tracing::warn!(id = %id, error = %e, "Checkpoint unusable, marked INVALID");
                    self.invalidate(id, &e);
                    invalidated.push(id.clone());
                    last_error = Some(e);
                }
                Err(CandidateFailure::Store(e)) => {
                    tracing::warn!(id = %id, error = %e, "Checkpoint could not be read");
                    last_error = Some(e);
                }
            }
        }

        self.lock().counters.rollback_failures += 1;

        match target {
            RollbackTarget::Progressive => {
                tracing::error!(tried, reason, "Progressive rollback exhausted every checkpoint");
                self.emit(CheckpointEvent::RollbackExhausted { tried });
                Err(ResilienceError::RollbackExhausted { tried })
            }
            _ => Err(last_error.unwrap_or(ResilienceError::RollbackExhausted { tried })),
        }
    }

    fn enter_rollback(&self) -> ResilienceResult<RollbackGuard<'_>> {
        self.rollback_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                tracing::warn!("Rollback rejected: another rollback is in progress");
                ResilienceError::Busy
            })?;
        Ok(RollbackGuard(&self.rollback_in_progress))
    }

    /// Whether a rollback is executing right now
    pub fn is_rolling_back(&self) -> bool {
        self.rollback_in_progress.load(Ordering::Acquire)
    }

    fn restore_candidate(&self, id: &str, pre_rollback: &[u8]) -> Result<(), CandidateFailure> {
        let record = match self.store.get(id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(CandidateFailure::Invalid(ResilienceError::CheckpointNotFound(
                    id.to_string(),
                )))
            }
            Err(e) => return Err(CandidateFailure::Store(e)),
        };

        let snapshot = decompress(&record.compressed_snapshot).map_err(|_| {
            CandidateFailure::Invalid(ResilienceError::ChecksumMismatch { id: id.to_string() })
        })?;
        if sha256_hex(&snapshot) != record.checksum {
            return Err(CandidateFailure::Invalid(ResilienceError::ChecksumMismatch {
                id: id.to_string(),
            }));
        }

        {
            let mut state = self.lock();
            if let Some(entry) = state.find_mut(id) {
                if entry.status == CheckpointStatus::PendingValidation {
                    entry.status = CheckpointStatus::Valid;
                }
                entry.snapshot_bytes = snapshot.len();
            }
        }

        if let Err(e) = call_provider(|| self.provider.restore(&snapshot)) {
            let message = format!("{:#}", e);
            if let Err(undo) = call_provider(|| self.provider.restore(pre_rollback)) {
                let error = format!("{:#}", undo);
                tracing::error!(
                    id = %id,
                    error = %error,
                    "Re-applying the pre-rollback state failed after a failed restore"
                );
            }
            return Err(CandidateFailure::Invalid(ResilienceError::RestoreFailed(message)));
        }

        Ok(())
    }

    fn invalidate(&self, id: &str, error: &ResilienceError) {
        let mut state = self.lock();
        if let Some(entry) = state.find_mut(id) {
            entry.status = CheckpointStatus::Invalid;
            entry.invalid_reason = Some(error.to_string());
            state.counters.invalidated += 1;
        }
    }

    /// Put back the state captured before the most recent rollback
    pub fn undo_last_rollback(&self) -> ResilienceResult<()> {
        let _guard = self.enter_rollback()?;

        let undo = self
            .lock()
            .undo
            .take()
            .ok_or_else(|| ResilienceError::CheckpointNotFound("no rollback to undo".to_string()))?;

        if let Err(e) = call_provider(|| self.provider.restore(&undo.blob)) {
            let message = format!("{:#}", e);
            tracing::error!(error = %message, "Undoing rollback failed");
            self.lock().undo = Some(undo);
            return Err(ResilienceError::RestoreFailed(message));
        }

        let mut state = self.lock();
        if let Some(active) = state.active_id() {
            if let Some(entry) = state.find_mut(&active) {
                entry.status = CheckpointStatus::Valid;
            }
        }
        if let Some(prev) = undo.previously_active.as_deref() {
            if let Some(entry) = state.find_mut(prev) {
                if entry.status.is_usable() {
                    entry.status = CheckpointStatus::Active;
                }
            }
        }
        drop(state);

        tracing::info!("Rollback undone");
        Ok(())
    }

    /// Evict to free one slot if the store is full
    fn make_room(&self) -> ResilienceResult<()> {
        if self.store.len()? < self.store.capacity() {
            return Ok(());
        }
        self.enforce_retention()?;
        if self.store.len()? < self.store.capacity() {
            return Ok(());
        }

        let victim = {
            let state = self.lock();
            let protected = state.newest_usable();
            state
                .entries
                .values()
                .filter(|e| Some(e.sequence) != protected && e.status != CheckpointStatus::Active)
                .min_by_key(|e| (e.milestone, e.sequence))
                .map(|e| e.id.clone())
        };

        match victim {
            Some(id) => self.evict(&id, "store at capacity"),
            None => Err(ResilienceError::Store(format!(
                "store full (capacity {}) and nothing can be evicted",
                self.store.capacity()
            ))),
        }
    }

    /// Apply the retention policy; returns how many checkpoints were evicted.
    ///
    /// INVALID checkpoints always go. Regular checkpoints are evicted past
    /// `max_age_ms` or beyond the newest `max_checkpoints`; milestones only
    /// beyond the newest `max_milestones`. The newest usable checkpoint and
    /// the active one are never evicted.
    pub fn enforce_retention(&self) -> ResilienceResult<usize> {
        let max_age = Duration::from_millis(self.config.max_age_ms);
        self.evict_where(Some(max_age), true)
    }

    /// Evict regular checkpoints older than `max_age`
    pub fn cleanup_stale(&self, max_age: Duration) -> ResilienceResult<usize> {
        self.evict_where(Some(max_age), false)
    }

    fn evict_where(&self, max_age: Option<Duration>, enforce_counts: bool) -> ResilienceResult<usize> {
        let now = self.clock.wall();
        let victims: Vec<(String, &'static str)> = {
            let state = self.lock();
            let protected = state.newest_usable();
            let keep = |e: &IndexEntry| Some(e.sequence) == protected || e.status == CheckpointStatus::Active;

            let mut victims = Vec::new();
            let mut regular_kept = 0;
            let mut milestones_kept = 0;

            for entry in state.entries.values().rev() {
                if keep(entry) {
                    if entry.milestone {
                        milestones_kept += 1;
                    } else {
                        regular_kept += 1;
                    }
                    continue;
                }

                if entry.status == CheckpointStatus::Invalid {
                    if enforce_counts {
                        victims.push((entry.id.clone(), "invalid"));
                    }
                    continue;
                }

                if entry.milestone {
                    if enforce_counts && milestones_kept >= self.config.max_milestones {
                        victims.push((entry.id.clone(), "milestone limit"));
                    } else {
                        milestones_kept += 1;
                    }
                    continue;
                }

                let too_old = max_age
                    .and_then(|age| chrono::Duration::from_std(age).ok())
                    .map(|age| now.signed_duration_since(entry.timestamp) > age)
                    .unwrap_or(false);

                if too_old {
                    victims.push((entry.id.clone(), "expired"));
                } else if enforce_counts && regular_kept >= self.config.max_checkpoints {
                    victims.push((entry.id.clone(), "count limit"));
                } else {
                    regular_kept += 1;
                }
            }
            victims
        };

        let mut evicted = 0;
        for (id, why) in victims {
            self.evict(&id, why)?;
            evicted += 1;
        }
        Ok(evicted)
    }

    fn evict(&self, id: &str, why: &str) -> ResilienceResult<()> {
        self.store.delete(id)?;
        {
            let mut state = self.lock();
            let sequence = state.find(id).map(|e| e.sequence);
            if let Some(sequence) = sequence {
                state.entries.remove(&sequence);
            }
            state.counters.evicted += 1;
        }
        tracing::debug!(id = %id, reason = why, "Checkpoint evicted");
        self.emit(CheckpointEvent::Evicted { id: id.to_string() });
        Ok(())
    }

    /// Summaries of every indexed checkpoint, newest first
    pub fn list(&self) -> Vec<CheckpointSummary> {
        self.lock().entries.values().rev().map(IndexEntry::summary).collect()
    }

    pub fn get(&self, id: &str) -> Option<CheckpointSummary> {
        self.lock().find(id).map(IndexEntry::summary)
    }

    /// Newest checkpoint a rollback could use
    pub fn latest(&self) -> Option<CheckpointSummary> {
        let state = self.lock();
        let sequence = state.newest_usable()?;
        state.entries.get(&sequence).map(IndexEntry::summary)
    }

    /// Load and verify a checkpoint without restoring it
    pub fn load(&self, id: &str) -> ResilienceResult<Checkpoint> {
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| ResilienceError::CheckpointNotFound(id.to_string()))?;
        let snapshot = match decompress(&record.compressed_snapshot) {
            Ok(snapshot) if sha256_hex(&snapshot) == record.checksum => snapshot,
            _ => {
                let error = ResilienceError::ChecksumMismatch { id: id.to_string() };
                self.invalidate(id, &error);
                return Err(error);
            }
        };
        let validation = validate_snapshot(&snapshot, self.config.max_depth);

        Ok(Checkpoint {
            id: record.id,
            sequence: record.sequence,
            timestamp: record.timestamp,
            trigger: record.trigger,
            priority: record.priority,
            snapshot,
            checksum: record.checksum,
            validation,
        })
    }

    pub fn stats(&self) -> CheckpointStats {
        let deferred_requests = self.pending_requests();
        let state = self.lock();
        let count = |status: CheckpointStatus| state.entries.values().filter(|e| e.status == status).count();

        CheckpointStats {
            total: state.entries.len(),
            valid: count(CheckpointStatus::Valid) + count(CheckpointStatus::Active),
            invalid: count(CheckpointStatus::Invalid),
            pending_validation: count(CheckpointStatus::PendingValidation),
            milestones: state.entries.values().filter(|e| e.milestone).count(),
            active: state.active_id(),
            stored_bytes: state.stored_bytes(),
            capacity: self.store.capacity(),
            created: state.counters.created,
            rejected: state.counters.rejected,
            throttled: state.counters.throttled,
            evicted: state.counters.evicted,
            rollbacks: state.counters.rollbacks,
            rollback_failures: state.counters.rollback_failures,
            invalidated: state.counters.invalidated,
            last_created_at: state.last_created_at,
            undo_available: state.undo.is_some(),
            deferred_requests,
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }
}

/// Run a provider call, turning a panic into an error
fn call_provider<T>(op: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("state provider panicked")),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data).iter().map(|b| format!("{:02x}", b)).collect()
}

fn compress(data: &[u8], level: u32) -> ResilienceResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Uncompressed size recorded in the gzip trailer (mod 2^32)
fn gzip_isize(data: &[u8]) -> usize {
    match data.len().checked_sub(4) {
        Some(start) if data.len() >= 18 => {
            let mut trailer = [0u8; 4];
            trailer.copy_from_slice(&data[start..]);
            u32::from_le_bytes(trailer) as usize
        }
        _ => 0,
    }
}
