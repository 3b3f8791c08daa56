/// Diagnostics retained for external dashboards
///
/// Raw messages and stacks never reach the user; they are kept here, in a
/// bounded ring, and only leave through `export_diagnostics`.
use crate::checkpoint::CheckpointStats;
use crate::classification::{Classification, ClassificationStats};
use crate::recovery::{BreakerSnapshot, RecoveryOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Longest message or stack text retained per record
const MAX_RETAINED_TEXT: usize = 2048;

/// One reported error as seen by the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
    pub stack: Option<String>,
    pub depth: u32,
    /// `None` when classification was bypassed
    pub classification: Option<Classification>,
    /// `None` when classification was bypassed or handling panicked
    pub outcome: Option<RecoveryOutcome>,
}

impl ErrorRecord {
    pub fn new(timestamp: DateTime<Utc>, message: Option<&str>, stack: Option<&str>, depth: u32) -> Self {
        Self {
            timestamp,
            message: message.map(clip),
            stack: stack.map(clip),
            depth,
            classification: None,
            outcome: None,
        }
    }
}

fn clip(text: &str) -> String {
    if text.len() <= MAX_RETAINED_TEXT {
        return text.to_string();
    }
    let mut end = MAX_RETAINED_TEXT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Bounded ring of recent error records
#[derive(Debug)]
pub struct DiagnosticsLog {
    capacity: usize,
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl DiagnosticsLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, record: ErrorRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot returned by `export_diagnostics`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub generated_at: DateTime<Utc>,
    pub breaker_states: Vec<BreakerSnapshot>,
    pub classification_stats: ClassificationStats,
    pub checkpoint_stats: CheckpointStats,
    pub pending_retries: usize,
    pub next_retry_due_ms: Option<u64>,
    pub total_reported: u64,
    pub emergencies: u64,
    pub subscriber_panics: u64,
    pub handling_panics: u64,
    pub shut_down: bool,
    pub recent_errors: Vec<ErrorRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let log = DiagnosticsLog::new(2);
        for i in 0..3 {
            log.push(ErrorRecord::new(Utc::now(), Some(&format!("e{}", i)), None, 0));
        }
        let messages: Vec<_> = log.recent().into_iter().filter_map(|r| r.message).collect();
        assert_eq!(messages, vec!["e1", "e2"]);
    }

    #[test]
    fn test_long_text_is_clipped_on_char_boundary() {
        let long = "é".repeat(MAX_RETAINED_TEXT);
        let record = ErrorRecord::new(Utc::now(), Some(&long), None, 0);
        let kept = record.message.unwrap();
        assert!(kept.len() <= MAX_RETAINED_TEXT + '…'.len_utf8());
        assert!(kept.ends_with('…'));
    }
}
