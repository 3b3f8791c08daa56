/// Error resilience engine
///
/// Classifies runtime failures, chooses and executes a recovery strategy under
/// per-category circuit breakers, and creates, validates and rolls back
/// application-state checkpoints.
///
/// # Architecture
///
/// ```text
/// ┌──────────────────────────────────────────┐
/// │   ErrorResilienceController (façade)      │
/// └───────┬─────────────────┬────────────────┘
///         │                 │
///         ↓                 ↓
/// ┌───────────────┐  ┌─────────────────────┐
/// │ErrorClassifier│  │ RecoveryOrchestrator │
/// │ patterns      │  │ breaker bank         │
/// │ rules         │  │ retry scheduler      │
/// │ fingerprints  │  └─────────┬───────────┘
/// └───────────────┘            │
///                              ↓
///                   ┌─────────────────────┐
///                   │ CheckpointManager    │
///                   │ validation + store   │
///                   └─────────────────────┘
/// ```
///
/// # Usage Example
///
/// ```rust,ignore
/// use resilience_engine::checkpoint::JsonFileState;
/// use resilience_engine::{ControllerBuilder, ErrorEvent};
/// use std::sync::Arc;
///
/// let state = Arc::new(JsonFileState::new("save.json"));
/// let controller = ControllerBuilder::new(state).build()?;
///
/// controller.report_error(
///     ErrorEvent::new("QuotaExceededError: localStorage is full")
///         .with_stack("at SaveManager.write (save.js:120:15)"),
/// );
///
/// println!("{}", serde_json::to_string_pretty(&controller.export_diagnostics())?);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub mod checkpoint;
pub mod classification;
pub mod clock;
pub mod config;
pub mod controller;
pub mod event;
pub mod logging;
pub mod recovery;
pub mod sinks;
pub mod taxonomy;

// Re-export main types for convenience
pub use checkpoint::{
    Checkpoint, CheckpointManager, CheckpointPriority, CheckpointStatus, CheckpointStore,
    CheckpointSummary, CheckpointTicket, RollbackReport, RollbackTarget, StateSnapshotProvider,
    TriggerType,
};
pub use classification::{Classification, ErrorClassifier, FingerprintId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ResilienceConfig;
pub use controller::{
    ControllerBuilder, Diagnostics, ErrorResilienceController, LifecycleEvent, LifecycleKind,
    RollbackResult,
};
pub use event::ErrorEvent;
pub use recovery::{BreakerState, CircuitBreaker, RecoveryActions, RecoveryOrchestrator};
pub use sinks::{EmergencyHandler, MetricsSink, NotificationSink};
pub use taxonomy::{Category, Severity, Strategy};

use thiserror::Error;

/// Errors raised inside the engine.
///
/// None of these escape `ErrorResilienceController::report_error`; they surface
/// only from the explicit checkpoint/rollback/configuration APIs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    #[error("Snapshot provider failed: {0}")]
    SnapshotFailed(String),

    #[error("Snapshot validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("Checksum mismatch for checkpoint {id}")]
    ChecksumMismatch { id: String },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint creation throttled, next allowed in {remaining_ms}ms")]
    Throttled { remaining_ms: u64 },

    #[error("Rollback exhausted: no valid checkpoint among {tried} candidates")]
    RollbackExhausted { tried: usize },

    #[error("Another rollback is already in progress")]
    Busy,

    #[error("Restoring state failed: {0}")]
    RestoreFailed(String),

    #[error("Checkpoint store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled before completion")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ResilienceError {
    fn from(err: anyhow::Error) -> Self {
        ResilienceError::Internal(format!("{:#}", err))
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(err: std::io::Error) -> Self {
        ResilienceError::Store(err.to_string())
    }
}

impl From<rusqlite::Error> for ResilienceError {
    fn from(err: rusqlite::Error) -> Self {
        ResilienceError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ResilienceError {
    fn from(err: serde_json::Error) -> Self {
        ResilienceError::Store(format!("serialization: {}", err))
    }
}

impl From<::config::ConfigError> for ResilienceError {
    fn from(err: ::config::ConfigError) -> Self {
        ResilienceError::Config(err.to_string())
    }
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;

#[cfg(test)]
mod lib_tests;
