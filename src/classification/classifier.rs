/// The classifier: rules, patterns, fingerprint history, learning
use super::fingerprint::{FingerprintEngine, FingerprintHistory, FingerprintId, HistoryEntry, RecordedOutcome};
use super::learning::PromotionTracker;
use super::patterns::{MatchInput, Pattern, PatternId, PatternLibrary, PatternScan};
use super::rules::{ClassificationRuleEngine, RuleId, RuleMatch};
use super::Classification;
use crate::config::ClassifierConfig;
use crate::event::ErrorEvent;
use crate::taxonomy::{Category, Severity, Strategy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Classifications slower than this are counted and logged
const SLOW_CLASSIFICATION_MICROS: u64 = 1_000;

/// Context keys that name the subsystem an error came from
const HINT_KEYS: [&str; 3] = ["category", "subsystem", "module"];

/// Running counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassificationStats {
    pub total: u64,
    pub malformed: u64,
    pub rule_short_circuits: u64,
    pub exact_pattern_hits: u64,
    pub unmatched: u64,
    pub unstable: u64,
    pub panics: u64,
    pub by_category: BTreeMap<Category, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub outcomes_succeeded: u64,
    pub outcomes_failed: u64,
    pub learned_patterns: u64,
    pub slow_classifications: u64,
    pub max_classify_micros: u64,
    pub fingerprints_tracked: usize,
    pub pattern_set_version: u64,
}

struct LearningState {
    history: FingerprintHistory,
    promotion: PromotionTracker,
    stats: ClassificationStats,
}

#[derive(Debug, Clone)]
struct Candidate {
    category: Category,
    severity: Severity,
    strategy: Strategy,
    confidence: u8,
    retryable: bool,
    patterns: Vec<PatternId>,
    rule: Option<RuleId>,
}

impl Candidate {
    fn from_rule(rule: &RuleMatch) -> Self {
        Self {
            category: rule.category,
            severity: rule.severity,
            strategy: rule.strategy,
            confidence: rule.confidence,
            retryable: rule.retryable,
            patterns: Vec::new(),
            rule: Some(rule.id.clone()),
        }
    }
}

/// Thread-safe error classifier.
///
/// `classify` never fails: malformed input yields a fixed low-confidence
/// verdict and an internal panic is contained and reported as the same.
pub struct ErrorClassifier {
    config: ClassifierConfig,
    library: Arc<PatternLibrary>,
    rules: ClassificationRuleEngine,
    fingerprints: FingerprintEngine,
    state: Mutex<LearningState>,
}

impl ErrorClassifier {
    /// Classifier with the shipped patterns and rules
    pub fn new(config: ClassifierConfig) -> Self {
        let rules = ClassificationRuleEngine::with_defaults(config.max_rules, config.short_circuit_confidence);
        Self::with_parts(config, Arc::new(PatternLibrary::with_defaults()), rules)
    }

    pub fn with_parts(
        config: ClassifierConfig,
        library: Arc<PatternLibrary>,
        rules: ClassificationRuleEngine,
    ) -> Self {
        let state = LearningState {
            history: FingerprintHistory::new(config.history_capacity),
            promotion: PromotionTracker::new(config.history_capacity, config.promotion_threshold),
            stats: ClassificationStats::default(),
        };
        Self {
            fingerprints: FingerprintEngine::new(config.fingerprint_frames),
            config,
            library,
            rules,
            state: Mutex::new(state),
        }
    }

    pub fn library(&self) -> &Arc<PatternLibrary> {
        &self.library
    }

    pub fn rules(&self) -> &ClassificationRuleEngine {
        &self.rules
    }

    pub fn fingerprint_engine(&self) -> &FingerprintEngine {
        &self.fingerprints
    }

    /// Classify one event
    pub fn classify(&self, event: &ErrorEvent) -> Classification {
        let started = Instant::now();

        let classification = match panic::catch_unwind(AssertUnwindSafe(|| self.classify_inner(event))) {
            Ok(classification) => classification,
            Err(_) => {
                tracing::error!("Classifier panicked, falling back to the malformed verdict");
                self.lock_state().stats.panics += 1;
                Classification::malformed(self.fingerprints.malformed())
            }
        };

        let elapsed = started.elapsed().as_micros() as u64;
        let mut state = self.lock_state();
        let stats = &mut state.stats;
        stats.total += 1;
        *stats.by_category.entry(classification.category()).or_default() += 1;
        *stats.by_severity.entry(classification.severity().to_string()).or_default() += 1;
        if classification.is_unstable() {
            stats.unstable += 1;
        }
        stats.max_classify_micros = stats.max_classify_micros.max(elapsed);
        if elapsed > SLOW_CLASSIFICATION_MICROS {
            stats.slow_classifications += 1;
            tracing::debug!(
                micros = elapsed,
                fingerprint = %classification.fingerprint(),
                "Slow classification"
            );
        }

        classification
    }

    fn classify_inner(&self, event: &ErrorEvent) -> Classification {
        if event.is_malformed() {
            let fingerprint = self.fingerprints.malformed();
            let mut state = self.lock_state();
            state.history.record_only(fingerprint, event.timestamp);
            state.stats.malformed += 1;
            tracing::debug!("Malformed error event, no message or stack");
            return Classification::malformed(fingerprint);
        }

        let input = self.build_input(event);
        let patterns = self.library.snapshot();
        let rule_outcome = self.rules.evaluate(&input);

        let candidate = match (&rule_outcome.matched, rule_outcome.short_circuit) {
            (Some(rule), true) => {
                self.lock_state().stats.rule_short_circuits += 1;
                Candidate::from_rule(rule)
            }
            (rule, _) => {
                let (plausible, hint) = plausible_categories(event);
                let scan = patterns.scan(&input, &plausible, self.config.exact_match_score);
                if scan.exact.is_some() {
                    self.lock_state().stats.exact_pattern_hits += 1;
                }
                self.combine(&scan, rule.as_ref(), hint)
            }
        };

        let fingerprint = self
            .fingerprints
            .fingerprint(candidate.category, &input.template, &input.frames);

        let (adjustment, promoted) = {
            let mut state = self.lock_state();
            let adjustment = state.history.observe(
                fingerprint,
                candidate.severity,
                candidate.strategy,
                &self.config,
                event.timestamp,
            );
            let promoted = if self.config.learning_enabled && candidate.category == Category::Unknown {
                state.promotion.observe(fingerprint, &input.template, &input.frames)
            } else {
                None
            };
            (adjustment, promoted)
        };

        if let Some(pattern) = promoted {
            self.publish(pattern);
        }

        let confidence = if self.config.learning_enabled {
            (candidate.confidence as i32 + adjustment.delta).clamp(0, 100) as u8
        } else {
            candidate.confidence
        };

        let mut classification = Classification::new(
            candidate.severity,
            candidate.category,
            candidate.strategy,
            confidence,
            fingerprint,
        )
        .with_retryable(candidate.retryable)
        .with_patterns(candidate.patterns)
        .with_unstable(adjustment.unstable)
        .with_pattern_set_version(patterns.version());
        if let Some(rule) = candidate.rule {
            classification = classification.with_rule(rule);
        }

        tracing::trace!(
            fingerprint = %fingerprint,
            category = %classification.category(),
            severity = %classification.severity(),
            confidence = classification.confidence(),
            "Classified error"
        );

        classification
    }

    fn build_input<'a>(&self, event: &'a ErrorEvent) -> MatchInput<'a> {
        let raw = event.message_text().unwrap_or_default();
        let message = truncate_chars(raw, self.config.max_message_len).to_lowercase();
        let template = self.fingerprints.normalize_message(&message);
        let frames = event
            .stack_text()
            .map(|stack| self.fingerprints.normalize_frames(stack, self.config.max_stack_frames))
            .unwrap_or_default();

        MatchInput {
            message,
            template,
            frames,
            event,
        }
    }

    /// Pick the best category from pattern scores and a non-decisive rule.
    ///
    /// A rule landing on a category that patterns also matched is blended in
    /// as an independent signal: `1 - (1 - a)(1 - b)`. Ties go to the higher
    /// severity, then to the earlier category.
    fn combine(&self, scan: &PatternScan, rule: Option<&RuleMatch>, hint: Option<Category>) -> Candidate {
        let mut candidates: Vec<Candidate> = Category::ALL
            .iter()
            .filter_map(|category| {
                let slot = &scan.per_category[category.index()];
                let (_, best) = slot.best.as_ref()?;
                Some(Candidate {
                    category: *category,
                    severity: slot.severity.unwrap_or(best.severity),
                    strategy: best.strategy,
                    confidence: to_percent(slot.score),
                    retryable: best.retryable,
                    patterns: slot.matched.clone(),
                    rule: None,
                })
            })
            .collect();

        if let Some(rule) = rule {
            match candidates.iter_mut().find(|c| c.category == rule.category) {
                Some(candidate) => {
                    candidate.confidence = blend(candidate.confidence, rule.confidence);
                    candidate.severity = candidate.severity.max(rule.severity);
                    candidate.strategy = rule.strategy;
                    candidate.retryable = rule.retryable;
                    candidate.rule = Some(rule.id.clone());
                }
                None => candidates.push(Candidate::from_rule(rule)),
            }
        }

        candidates
            .into_iter()
            .max_by(|a, b| {
                a.confidence
                    .cmp(&b.confidence)
                    .then(a.severity.rank().cmp(&b.severity.rank()))
                    .then(b.category.index().cmp(&a.category.index()))
            })
            .unwrap_or_else(|| self.unmatched(hint))
    }

    fn unmatched(&self, hint: Option<Category>) -> Candidate {
        self.lock_state().stats.unmatched += 1;
        match hint {
            Some(category) => Candidate {
                category,
                severity: Severity::Medium,
                strategy: category.default_strategy(),
                confidence: self.config.subsystem_hint_confidence,
                retryable: category.is_transient(),
                patterns: Vec::new(),
                rule: None,
            },
            None => Candidate {
                category: Category::Unknown,
                severity: Severity::Medium,
                strategy: Category::Unknown.default_strategy(),
                confidence: self.config.unmatched_confidence,
                retryable: false,
                patterns: Vec::new(),
                rule: None,
            },
        }
    }

    /// Feed back how recovery went for a fingerprint
    pub fn record_outcome(&self, fingerprint: FingerprintId, strategy: Strategy, success: bool) {
        let promoted = {
            let mut state = self.lock_state();
            let outcome = if success {
                state.stats.outcomes_succeeded += 1;
                RecordedOutcome::Success
            } else {
                state.stats.outcomes_failed += 1;
                RecordedOutcome::Failure
            };
            state.history.record_outcome(fingerprint, outcome);

            if self.config.learning_enabled {
                state.promotion.record_outcome(fingerprint, strategy, success)
            } else {
                None
            }
        };

        if let Some(pattern) = promoted {
            self.publish(pattern);
        }
    }

    /// Host confirmation of what an unknown fingerprint really is.
    ///
    /// Returns `true` if this promoted the fingerprint into a learned pattern.
    pub fn confirm(
        &self,
        fingerprint: FingerprintId,
        category: Category,
        severity: Severity,
        strategy: Strategy,
    ) -> bool {
        if !self.config.learning_enabled {
            return false;
        }

        let promoted = self
            .lock_state()
            .promotion
            .confirm(fingerprint, category, severity, strategy);

        match promoted {
            Some(pattern) => self.publish(pattern),
            None => false,
        }
    }

    fn publish(&self, pattern: Pattern) -> bool {
        let id = pattern.id.clone();
        match self.library.append(pattern) {
            Some(version) => {
                self.lock_state().stats.learned_patterns += 1;
                tracing::info!(pattern = %id, version, "Learned pattern published");
                true
            }
            None => {
                tracing::debug!(pattern = %id, "Learned pattern already present");
                false
            }
        }
    }

    /// History entry for a fingerprint, if still retained
    pub fn history(&self, fingerprint: &FingerprintId) -> Option<HistoryEntry> {
        self.lock_state().history.peek(fingerprint).cloned()
    }

    pub fn stats(&self) -> ClassificationStats {
        let state = self.lock_state();
        let mut stats = state.stats.clone();
        stats.fingerprints_tracked = state.history.len();
        stats.pattern_set_version = self.library.version();
        stats
    }

    fn lock_state(&self) -> MutexGuard<'_, LearningState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

fn plausible_categories(event: &ErrorEvent) -> (Vec<Category>, Option<Category>) {
    let hint = HINT_KEYS
        .iter()
        .find_map(|key| event.context_str(key).and_then(|v| v.parse::<Category>().ok()));

    match hint {
        Some(category) if category != Category::Unknown => (vec![category, Category::Unknown], Some(category)),
        _ => (Category::ALL.to_vec(), None),
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn to_percent(score: f64) -> u8 {
    (score.clamp(0.0, 1.0) * 100.0).round() as u8
}

fn blend(a: u8, b: u8) -> u8 {
    let a = a.min(100) as f64 / 100.0;
    let b = b.min(100) as f64 / 100.0;
    to_percent(1.0 - (1.0 - a) * (1.0 - b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::patterns::Matcher;
    use std::thread;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::default()
    }

    #[test]
    fn test_malformed_event_gets_fixed_verdict() {
        let c = classifier().classify(&ErrorEvent::empty());
        assert_eq!(c.severity(), Severity::Medium);
        assert_eq!(c.category(), Category::Unknown);
        assert_eq!(c.strategy_hint(), Strategy::Ignore);
        assert_eq!(c.confidence(), 0);
    }

    #[test]
    fn test_quota_during_save() {
        let event = ErrorEvent::new("QuotaExceededError: The quota has been exceeded.")
            .with_stack("at SaveManager.persist (save.js:88:3)")
            .with_context("operation", "save");

        let c = classifier().classify(&event);
        assert_eq!(c.category(), Category::Save);
        assert_eq!(c.severity(), Severity::High);
        assert_eq!(c.strategy_hint(), Strategy::CheckpointRollback);
        assert_eq!(c.matched_rule(), Some("save-quota-exceeded"));
        assert!(c.confidence() >= 90);
    }

    #[test]
    fn test_network_timeout() {
        let c = classifier().classify(&ErrorEvent::new("Request timeout after 3000ms"));
        assert_eq!(c.category(), Category::Network);
        assert_eq!(c.strategy_hint(), Strategy::RetryWithBackoff);
        assert!(c.is_retryable());
        assert_eq!(c.matched_patterns(), &["network-timeout".to_string()]);
    }

    #[test]
    fn test_rule_blends_with_patterns() {
        let event = ErrorEvent::new("TypeError: Failed to fetch").with_stack("at fetchLeaderboard (net.js:1:1)");
        let c = classifier().classify(&event);
        assert_eq!(c.category(), Category::Network);
        assert_eq!(c.matched_rule(), Some("network-offline"));
        assert!(c.confidence() > 90);
    }

    #[test]
    fn test_unmatched_is_low_confidence_unknown() {
        let c = classifier().classify(&ErrorEvent::new("zorp"));
        assert_eq!(c.category(), Category::Unknown);
        assert_eq!(c.confidence(), 15);
        assert_eq!(c.strategy_hint(), Strategy::Ignore);
    }

    #[test]
    fn test_subsystem_hint_without_match() {
        let c = classifier().classify(&ErrorEvent::new("zorp").in_subsystem("ui"));
        assert_eq!(c.category(), Category::Ui);
        assert_eq!(c.confidence(), 30);
        assert_eq!(c.strategy_hint(), Strategy::Fallback);
    }

    #[test]
    fn test_fingerprint_stable_across_dynamic_values() {
        let classifier = classifier();
        let a = classifier.classify(&ErrorEvent::new("Request timeout after 3000ms"));
        let b = classifier.classify(&ErrorEvent::new("Request timeout after 45ms"));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(classifier.history(&a.fingerprint()).unwrap().count, 2);
    }

    #[test]
    fn test_consistent_repeats_raise_confidence() {
        let classifier = classifier();
        let event = ErrorEvent::new("Request timeout");
        let first = classifier.classify(&event).confidence();
        let mut last = first;
        for _ in 0..5 {
            last = classifier.classify(&event).confidence();
        }
        assert!(last > first);
    }

    #[test]
    fn test_failed_outcome_lowers_confidence() {
        let classifier = classifier();
        let event = ErrorEvent::new("Request timeout");
        let first = classifier.classify(&event);
        classifier.record_outcome(first.fingerprint(), first.strategy_hint(), false);
        let second = classifier.classify(&event);
        assert!(second.confidence() < first.confidence());
    }

    #[test]
    fn test_confirmed_unknown_is_promoted() {
        let classifier = classifier();
        let event = ErrorEvent::new("the flux capacitor hiccuped");

        let mut fingerprint = None;
        for _ in 0..3 {
            let c = classifier.classify(&event);
            assert_eq!(c.category(), Category::Unknown);
            fingerprint = Some(c.fingerprint());
        }

        let version = classifier.library().version();
        assert!(classifier.confirm(fingerprint.unwrap(), Category::Ui, Severity::Low, Strategy::Fallback));
        assert_eq!(classifier.library().version(), version + 1);

        let learned = classifier.classify(&event);
        assert_eq!(learned.category(), Category::Ui);
        assert_eq!(learned.strategy_hint(), Strategy::Fallback);
        assert_eq!(learned.pattern_set_version(), version + 1);
        assert_eq!(classifier.stats().learned_patterns, 1);
    }

    #[test]
    fn test_learning_disabled_never_promotes() {
        let config = ClassifierConfig {
            learning_enabled: false,
            ..Default::default()
        };
        let classifier = ErrorClassifier::new(config);
        let event = ErrorEvent::new("the flux capacitor hiccuped");
        let fp = classifier.classify(&event).fingerprint();
        for _ in 0..5 {
            classifier.classify(&event);
        }
        assert!(!classifier.confirm(fp, Category::Ui, Severity::Low, Strategy::Fallback));
    }

    #[test]
    fn test_custom_library_and_rules() {
        let library = Arc::new(PatternLibrary::new(vec![Pattern::new(
            "boss-fight",
            Category::Progression,
            Severity::High,
            Strategy::CheckpointRollback,
        )
        .with_matcher(Matcher::message("boss"))]));
        let classifier = ErrorClassifier::with_parts(
            ClassifierConfig::default(),
            library,
            ClassificationRuleEngine::new(8, 90),
        );

        let c = classifier.classify(&ErrorEvent::new("Boss state desync"));
        assert_eq!(c.category(), Category::Progression);
        assert_eq!(c.confidence(), 100);
    }

    #[test]
    fn test_equal_scores_break_toward_higher_severity() {
        let library = Arc::new(PatternLibrary::new(vec![
            Pattern::new("core-boom", Category::Core, Severity::Low, Strategy::RestartSubsystem)
                .with_matcher(Matcher::message("boom")),
            Pattern::new("save-boom", Category::Save, Severity::Critical, Strategy::CheckpointRollback)
                .with_matcher(Matcher::message("boom")),
        ]));
        let classifier = ErrorClassifier::with_parts(
            ClassifierConfig::default(),
            library,
            ClassificationRuleEngine::new(8, 90),
        );

        let c = classifier.classify(&ErrorEvent::new("boom"));
        assert_eq!(c.category(), Category::Save);
        assert_eq!(c.severity(), Severity::Critical);
        assert_eq!(c.confidence(), 100);
        assert_eq!(classifier.stats().exact_pattern_hits, 1);
    }

    #[test]
    fn test_oversized_message_is_truncated() {
        let classifier = classifier();
        let message = format!("timeout {}", "x".repeat(100_000));
        let c = classifier.classify(&ErrorEvent::new(message));
        assert_eq!(c.category(), Category::Network);
    }

    #[test]
    fn test_concurrent_classification() {
        let classifier = Arc::new(classifier());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let classifier = Arc::clone(&classifier);
                thread::spawn(move || {
                    for j in 0..50 {
                        classifier.classify(&ErrorEvent::new(format!("Request timeout {}", i * j)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(classifier.stats().total, 400);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }

    #[test]
    fn test_blend() {
        assert_eq!(blend(50, 50), 75);
        assert_eq!(blend(0, 85), 85);
        assert_eq!(blend(100, 10), 100);
    }
}
