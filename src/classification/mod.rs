/// Error classification
///
/// ```text
///   ErrorEvent
///       │
///       ▼
///   normalize ──► message / template / frames
///       │
///       ▼
///   ClassificationRuleEngine ──(confidence ≥ threshold)──┐
///       │                                                │
///       ▼                                                │
///   PatternLibrary scan (plausible categories only)      │
///       │                                                │
///       ▼                                                ▼
///   combine ──► fingerprint ──► history adjustment ──► Classification
///                                     │
///                                     ▼
///                            PromotionTracker (Unknown only)
/// ```
mod classifier;
pub mod fingerprint;
pub mod learning;
pub mod patterns;
pub mod rules;

pub use classifier::{ClassificationStats, ErrorClassifier};
pub use fingerprint::{FingerprintEngine, FingerprintHistory, FingerprintId, HistoryEntry, RecordedOutcome};
pub use patterns::{default_patterns, Matcher, Pattern, PatternId, PatternLibrary, PatternSet};
pub use rules::{default_rules, ClassificationRule, ClassificationRuleEngine, RuleId, RulePredicate};

use crate::taxonomy::{Category, Severity, Strategy};
use serde::Serialize;

/// Verdict for one error event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    severity: Severity,
    category: Category,
    strategy_hint: Strategy,
    confidence: u8,
    fingerprint: FingerprintId,
    matched_patterns: Vec<PatternId>,
    matched_rule: Option<RuleId>,
    retryable: bool,
    unstable: bool,
    malformed: bool,
    pattern_set_version: u64,
}

impl Classification {
    /// Build a classification; confidence is clamped to 0..=100
    pub fn new(
        severity: Severity,
        category: Category,
        strategy_hint: Strategy,
        confidence: u8,
        fingerprint: FingerprintId,
    ) -> Self {
        Self {
            severity,
            category,
            strategy_hint,
            confidence: confidence.min(100),
            fingerprint,
            matched_patterns: Vec::new(),
            matched_rule: None,
            retryable: category.is_transient() && severity != Severity::Critical,
            unstable: false,
            malformed: false,
            pattern_set_version: 0,
        }
    }

    /// The fixed verdict for events with no usable message or stack
    pub fn malformed(fingerprint: FingerprintId) -> Self {
        let mut classification = Self::new(Severity::Medium, Category::Unknown, Strategy::Ignore, 0, fingerprint);
        classification.malformed = true;
        classification
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable && self.severity != Severity::Critical;
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<PatternId>) -> Self {
        self.matched_patterns = patterns;
        self
    }

    pub fn with_rule(mut self, rule: RuleId) -> Self {
        self.matched_rule = Some(rule);
        self
    }

    pub(crate) fn with_unstable(mut self, unstable: bool) -> Self {
        self.unstable = unstable;
        self
    }

    pub(crate) fn with_pattern_set_version(mut self, version: u64) -> Self {
        self.pattern_set_version = version;
        self
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn strategy_hint(&self) -> Strategy {
        self.strategy_hint
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }

    pub fn fingerprint(&self) -> FingerprintId {
        self.fingerprint
    }

    pub fn matched_patterns(&self) -> &[PatternId] {
        &self.matched_patterns
    }

    pub fn matched_rule(&self) -> Option<&str> {
        self.matched_rule.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The fingerprint has been classified inconsistently and has not yet
    /// settled
    pub fn is_unstable(&self) -> bool {
        self.unstable
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed
    }

    pub fn pattern_set_version(&self) -> u64 {
        self.pattern_set_version
    }
}
