/// Promotion of recurring unknown errors into learned patterns
///
/// An `Unknown` fingerprint that keeps recurring becomes a candidate. Once it
/// has been seen `promotion_threshold` times and either the host confirmed its
/// classification or the same strategy succeeded `promotion_threshold` times
/// in a row, a pattern matching its template (and top frame) is synthesized.
use super::fingerprint::FingerprintId;
use super::patterns::{Matcher, Pattern};
use crate::taxonomy::{Category, Severity, Strategy};
use lru::LruCache;
use std::num::NonZeroUsize;

/// Weight given to synthesized patterns
pub const LEARNED_PATTERN_WEIGHT: f64 = 0.9;

#[derive(Debug, Clone)]
struct Candidate {
    template: String,
    top_frame: Option<String>,
    occurrences: u32,
    confirmed: Option<(Category, Severity, Strategy)>,
    successes: u32,
    last_success_strategy: Option<Strategy>,
    promoted: bool,
}

/// Tracks unknown fingerprints until they qualify for promotion
pub struct PromotionTracker {
    candidates: LruCache<FingerprintId, Candidate>,
    threshold: u32,
}

impl PromotionTracker {
    pub fn new(capacity: usize, threshold: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            candidates: LruCache::new(capacity),
            threshold: threshold.max(1),
        }
    }

    /// Count one occurrence of an unclassified error
    pub fn observe(&mut self, fingerprint: FingerprintId, template: &str, frames: &[String]) -> Option<Pattern> {
        if !self.candidates.contains(&fingerprint) {
            self.candidates.put(
                fingerprint,
                Candidate {
                    template: template.to_string(),
                    top_frame: frames.first().cloned(),
                    occurrences: 0,
                    confirmed: None,
                    successes: 0,
                    last_success_strategy: None,
                    promoted: false,
                },
            );
        }
        if let Some(candidate) = self.candidates.get_mut(&fingerprint) {
            candidate.occurrences = candidate.occurrences.saturating_add(1);
        }
        self.try_promote(fingerprint)
    }

    /// Host-confirmed classification for a fingerprint
    pub fn confirm(
        &mut self,
        fingerprint: FingerprintId,
        category: Category,
        severity: Severity,
        strategy: Strategy,
    ) -> Option<Pattern> {
        let candidate = self.candidates.get_mut(&fingerprint)?;
        candidate.confirmed = Some((category, severity, strategy));
        self.try_promote(fingerprint)
    }

    /// Feed back a recovery result
    pub fn record_outcome(&mut self, fingerprint: FingerprintId, strategy: Strategy, success: bool) -> Option<Pattern> {
        let candidate = self.candidates.get_mut(&fingerprint)?;
        if success {
            if candidate.last_success_strategy == Some(strategy) {
                candidate.successes = candidate.successes.saturating_add(1);
            } else {
                candidate.successes = 1;
                candidate.last_success_strategy = Some(strategy);
            }
        } else {
            candidate.successes = 0;
            candidate.last_success_strategy = None;
        }
        self.try_promote(fingerprint)
    }

    pub fn is_tracked(&self, fingerprint: &FingerprintId) -> bool {
        self.candidates.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn try_promote(&mut self, fingerprint: FingerprintId) -> Option<Pattern> {
        let threshold = self.threshold;
        let candidate = self.candidates.get_mut(&fingerprint)?;
        if candidate.promoted || candidate.occurrences < threshold {
            return None;
        }

        let (category, severity, strategy) = match (candidate.confirmed, candidate.last_success_strategy) {
            (Some(confirmed), _) => confirmed,
            (None, Some(strategy)) if candidate.successes >= threshold => {
                (Category::Unknown, Severity::Medium, strategy)
            }
            _ => return None,
        };

        candidate.promoted = true;

        let mut pattern = Pattern::new(&format!("learned-{}", fingerprint), category, severity, strategy)
            .with_matcher(Matcher::MessageTemplate(candidate.template.clone()))
            .with_weight(LEARNED_PATTERN_WEIGHT)
            .learned();
        if let Some(frame) = &candidate.top_frame {
            pattern = pattern.with_matcher(Matcher::StackFrame(frame.clone()));
        }

        tracing::info!(
            fingerprint = %fingerprint,
            category = %category,
            strategy = %strategy,
            occurrences = candidate.occurrences,
            "Promoting recurring error to learned pattern"
        );

        Some(pattern)
    }
}
