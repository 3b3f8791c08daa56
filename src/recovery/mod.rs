/// Strategy selection and execution under circuit-breaker discipline
pub mod circuit_breaker;
mod orchestrator;
pub mod retry;

pub use circuit_breaker::{BreakerBank, BreakerSnapshot, BreakerState, CircuitBreaker, Permit};
pub use orchestrator::{select_strategy, CheckpointPort, RecoveryOrchestrator, RecoveryPlan};
pub use retry::{ExponentialBackoff, PendingRetry, RetryScheduler, RetryStrategy};

use crate::classification::FingerprintId;
use crate::event::ErrorEvent;
use crate::taxonomy::{Category, Strategy};
use serde::Serialize;

/// Host-supplied effects behind each strategy
#[cfg_attr(test, mockall::automock)]
pub trait RecoveryActions: Send + Sync {
    /// Re-run the operation that failed
    fn retry(&self, event: &ErrorEvent, attempt: u32) -> anyhow::Result<()>;

    /// Switch the category to its degraded mode
    fn fallback(&self, category: Category, event: &ErrorEvent) -> anyhow::Result<()>;

    /// Tear down and re-initialise the subsystem behind a category
    fn restart_subsystem(&self, category: Category) -> anyhow::Result<()>;
}

/// Succeeds at everything without doing anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecoveryActions;

impl RecoveryActions for NoopRecoveryActions {
    fn retry(&self, _event: &ErrorEvent, _attempt: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn fallback(&self, _category: Category, _event: &ErrorEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn restart_subsystem(&self, _category: Category) -> anyhow::Result<()> {
        Ok(())
    }
}

/// How a recovery attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStatus {
    /// The failed operation or subsystem is working again
    Recovered,
    /// The error was contained (degraded mode or deliberately ignored)
    Mitigated,
    /// A retry was queued; the verdict arrives when its timer fires
    Scheduled,
    /// Every applicable strategy failed
    Failed,
    /// A critical error exhausted every strategy
    Emergency,
}

impl RecoveryStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryStatus::Recovered | RecoveryStatus::Mitigated)
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, RecoveryStatus::Failed | RecoveryStatus::Emergency)
    }
}

/// Result of executing (or short-circuiting) recovery for one error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub fingerprint: FingerprintId,
    pub category: Category,
    /// Strategy chosen before any escalation
    pub planned: Strategy,
    /// Strategy that produced the final status
    pub strategy: Strategy,
    pub status: RecoveryStatus,
    /// Underlying actions invoked (retries, fallback, restart, rollback)
    pub attempts: u32,
    /// The breaker was open and the hinted action was never attempted
    pub short_circuited: bool,
    /// Breaker state after accounting for this outcome
    pub breaker_state: BreakerState,
    pub detail: Option<String>,
}
