/// Retry strategies with exponential backoff and jitter, plus the timer queue
/// for deferred retries
///
/// Retries never block: a `RETRY_WITH_BACKOFF` decision only schedules an
/// entry, and the host's idle driver runs whatever is due.
use crate::classification::{Classification, FingerprintId};
use crate::config::RetryConfig;
use crate::event::ErrorEvent;
use crate::taxonomy::Category;
use std::collections::BTreeMap;
use std::time::Duration;

/// Retry strategy trait
pub trait RetryStrategy: Send + Sync {
    /// Determine if retry should be attempted
    fn should_retry(&self, attempt: u32, classification: &Classification) -> bool;

    /// Calculate delay before the given attempt
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Maximum number of retry attempts
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry strategy with jitter
///
/// delay = base * 2^attempt, capped, then ± `jitter_factor` of itself so
/// that many clients failing together do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay for the first retry
    base_delay: Duration,

    /// Maximum delay cap
    max_delay: Duration,

    /// Maximum retry attempts
    max_attempts: u32,

    /// Jitter factor (0.0 - 1.0)
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter_factor: 0.3,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
        .with_jitter(config.jitter)
    }

    /// Create with custom jitter factor
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = if jitter_factor.is_finite() {
            jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(2_u128.saturating_pow(attempt.min(64)));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis());

        let jitter_range = capped_ms as f64 * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        let final_ms = (capped_ms as f64 + jitter).max(0.0);

        Duration::from_millis(final_ms as u64)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, classification: &Classification) -> bool {
        attempt < self.max_attempts && classification.is_retryable()
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        self.calculate_delay(attempt)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// A retry waiting for its timer
#[derive(Debug, Clone)]
pub struct PendingRetry {
    pub id: u64,
    pub fingerprint: FingerprintId,
    pub category: Category,
    /// Monotonic milliseconds at which the retry becomes due
    pub due_ms: u64,
    /// 1-based attempt number this entry will perform
    pub attempt: u32,
    pub event: ErrorEvent,
    pub classification: Classification,
    /// Holds the category breaker's half-open trial
    pub trial: bool,
}

/// Timer queue of pending retries
#[derive(Debug, Default)]
pub struct RetryScheduler {
    pending: BTreeMap<u64, PendingRetry>,
    next_id: u64,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a retry, returning its id
    pub fn schedule(
        &mut self,
        classification: Classification,
        event: ErrorEvent,
        attempt: u32,
        due_ms: u64,
        trial: bool,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            PendingRetry {
                id,
                fingerprint: classification.fingerprint(),
                category: classification.category(),
                due_ms,
                attempt,
                event,
                classification,
                trial,
            },
        );
        id
    }

    /// Remove and return every entry due at `now_ms`, earliest first
    pub fn take_due(&mut self, now_ms: u64) -> Vec<PendingRetry> {
        let due_ids: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.due_ms <= now_ms)
            .map(|p| p.id)
            .collect();

        let mut due: Vec<PendingRetry> = due_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        due.sort_by_key(|p| (p.due_ms, p.id));
        due
    }

    /// Cancel every retry for a category
    pub fn cancel_category(&mut self, category: Category) -> Vec<PendingRetry> {
        let ids: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.category == category)
            .map(|p| p.id)
            .collect();
        ids.into_iter().filter_map(|id| self.pending.remove(&id)).collect()
    }

    /// Cancel every retry for a fingerprint
    pub fn cancel_fingerprint(&mut self, fingerprint: FingerprintId) -> Vec<PendingRetry> {
        let ids: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.fingerprint == fingerprint)
            .map(|p| p.id)
            .collect();
        ids.into_iter().filter_map(|id| self.pending.remove(&id)).collect()
    }

    pub fn cancel_all(&mut self) -> Vec<PendingRetry> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Earliest due time
    pub fn next_due(&self) -> Option<u64> {
        self.pending.values().map(|p| p.due_ms).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_for(&self, category: Category) -> usize {
        self.pending.values().filter(|p| p.category == category).count()
    }
}
