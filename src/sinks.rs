/// Outbound collaborator interfaces: notifications, metrics, emergency signal
///
/// These traits are implemented by the host (UI layer, monitoring dashboard,
/// minimal-fallback mode). The engine ships no-op and tracing-backed
/// implementations so the façade can run with none of them wired.
use crate::checkpoint::CheckpointSummary;
use crate::classification::FingerprintId;
use crate::recovery::RecoveryOutcome;
use crate::taxonomy::{Category, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Receives sanitized, user-facing text
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Receives structured engine events for dashboards
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &MetricEvent);
}

/// Consumes the terminal emergency signal
#[cfg_attr(test, mockall::automock)]
pub trait EmergencyHandler: Send + Sync {
    fn enter_emergency(&self, signal: &EmergencySignal);
}

/// Summary of one classification, free of raw message/stack text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedEvent {
    pub fingerprint: FingerprintId,
    pub category: Category,
    pub severity: Severity,
    pub confidence: u8,
    pub unstable: bool,
    pub rule_short_circuit: bool,
}

/// Checkpoint lifecycle facts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CheckpointEvent {
    Created(CheckpointSummary),
    Rejected { reason: String },
    Throttled { remaining_ms: u64 },
    Evicted { id: String },
    RolledBack { id: String },
    RollbackExhausted { tried: usize },
}

/// Everything a `MetricsSink` receives
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetricEvent {
    Classified(ClassifiedEvent),
    Recovery(RecoveryOutcome),
    Checkpoint(CheckpointEvent),
}

/// Terminal signal raised when every strategy is exhausted or error
/// handling itself recursed too deeply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencySignal {
    pub reason: String,
    pub category: Option<Category>,
    pub fingerprint: Option<FingerprintId>,
    pub depth: u32,
    pub timestamp: DateTime<Utc>,
}

/// Drops every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifications;

impl NotificationSink for NoopNotifications {
    fn notify(&self, _message: &str, _severity: Severity) {}
}

/// Forwards metric events to `tracing` at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, event: &MetricEvent) {
        match event {
            MetricEvent::Classified(c) => tracing::debug!(
                fingerprint = %c.fingerprint,
                category = %c.category,
                severity = %c.severity,
                confidence = c.confidence,
                "metric: classified"
            ),
            MetricEvent::Recovery(o) => tracing::debug!(
                category = %o.category,
                strategy = %o.strategy,
                status = ?o.status,
                "metric: recovery"
            ),
            MetricEvent::Checkpoint(c) => tracing::debug!(event = ?c, "metric: checkpoint"),
        }
    }
}

/// Logs the emergency at error level and does nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEmergencyHandler;

impl EmergencyHandler for LoggingEmergencyHandler {
    fn enter_emergency(&self, signal: &EmergencySignal) {
        tracing::error!(
            reason = %signal.reason,
            category = ?signal.category,
            depth = signal.depth,
            "EMERGENCY: error resilience exhausted, handing over to minimal fallback mode"
        );
    }
}

/// Fixed, non-technical text shown to the player for a category
pub fn user_message(category: Category, severity: Severity) -> &'static str {
    match (category, severity) {
        (_, Severity::Critical) => {
            "Something went seriously wrong. Your progress has been protected and the game is recovering."
        }
        (Category::Save, _) => "We had trouble saving your progress. Restoring your last safe point.",
        (Category::Progression, _) => "Your progress looked inconsistent, so it was restored to a safe point.",
        (Category::Network, _) => "Connection hiccup. Retrying in the background.",
        (Category::Memory, _) => "The game is running low on memory and is freeing resources.",
        (Category::Ui, _) => "Part of the interface failed to load and was reset.",
        (Category::Core, _) => "The game hit a snag and restarted the affected system.",
        (Category::Unknown, _) => "An unexpected problem occurred. The game is still running.",
    }
}
