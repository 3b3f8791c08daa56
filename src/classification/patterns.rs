/// Pattern library: weighted matchers grouped by category
///
/// The active pattern set is immutable once published. Learning and host
/// updates replace it wholesale (copy-on-write) so a classification already in
/// progress keeps scoring against the set it started with.
use crate::event::ErrorEvent;
use crate::taxonomy::{Category, Severity, Strategy};
use regex::{Regex, RegexBuilder};
use std::sync::{Arc, PoisonError, RwLock};

pub type PatternId = String;

/// Normalized view of an event that matchers and rules run against
#[derive(Debug)]
pub struct MatchInput<'a> {
    /// Lowercased message, truncated to the configured maximum
    pub message: String,
    /// Normalized message template
    pub template: String,
    /// Lowercased `function@file` frames, top first
    pub frames: Vec<String>,
    pub event: &'a ErrorEvent,
}

/// A single check against an event
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Case-insensitive substring of the message
    MessageContains(String),
    /// Case-insensitive regex over the message
    MessageRegex(Regex),
    /// Exact normalized template, used by learned patterns
    MessageTemplate(String),
    /// Substring of any stack frame
    StackFrame(String),
    /// Frames appearing in this order (not necessarily adjacent)
    StackSequence(Vec<String>),
    /// Context value equals
    ContextEquals {
        key: String,
        value: serde_json::Value,
    },
    /// Numeric context value strictly above a threshold
    ContextAbove { key: String, threshold: f64 },
    /// `key / window_key` (a count over a window in milliseconds) exceeds a
    /// per-second rate
    ContextRate {
        key: String,
        window_key: String,
        per_second: f64,
    },
}

impl Matcher {
    pub fn message(needle: &str) -> Self {
        Matcher::MessageContains(needle.to_lowercase())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()
            .map(Matcher::MessageRegex)
    }

    pub fn frame(needle: &str) -> Self {
        Matcher::StackFrame(needle.to_lowercase())
    }

    pub fn context_equals(key: &str, value: impl Into<serde_json::Value>) -> Self {
        Matcher::ContextEquals {
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn context_above(key: &str, threshold: f64) -> Self {
        Matcher::ContextAbove {
            key: key.to_string(),
            threshold,
        }
    }

    pub fn matches(&self, input: &MatchInput<'_>) -> bool {
        match self {
            Matcher::MessageContains(needle) => input.message.contains(needle.as_str()),
            Matcher::MessageRegex(re) => re.is_match(&input.message),
            Matcher::MessageTemplate(template) => input.template == *template,
            Matcher::StackFrame(needle) => input.frames.iter().any(|f| f.contains(needle.as_str())),
            Matcher::StackSequence(sequence) => {
                let mut frames = input.frames.iter();
                sequence
                    .iter()
                    .all(|needle| frames.any(|f| f.contains(needle.as_str())))
            }
            Matcher::ContextEquals { key, value } => match (input.event.context.get(key), value) {
                (Some(serde_json::Value::String(actual)), serde_json::Value::String(expected)) => {
                    actual.eq_ignore_ascii_case(expected)
                }
                (Some(actual), expected) => actual == expected,
                (None, _) => false,
            },
            Matcher::ContextAbove { key, threshold } => input
                .event
                .context_number(key)
                .map(|v| v > *threshold)
                .unwrap_or(false),
            Matcher::ContextRate {
                key,
                window_key,
                per_second,
            } => match (input.event.context_number(key), input.event.context_number(window_key)) {
                (Some(count), Some(window_ms)) if window_ms > 0.0 => {
                    count / (window_ms / 1000.0) > *per_second
                }
                _ => false,
            },
        }
    }
}

/// A weighted signature for one kind of error
#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: PatternId,
    pub category: Category,
    pub severity: Severity,
    pub strategy: Strategy,
    pub matchers: Vec<Matcher>,
    /// 0..=1, the score of a pattern whose matchers all fire
    pub weight: f64,
    pub retryable: bool,
    /// Synthesized from fingerprint history rather than shipped
    pub learned: bool,
}

impl Pattern {
    pub fn new(id: &str, category: Category, severity: Severity, strategy: Strategy) -> Self {
        Self {
            id: id.to_string(),
            category,
            severity,
            strategy,
            matchers: Vec::new(),
            weight: 1.0,
            retryable: category.is_transient(),
            learned: false,
        }
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = if weight.is_finite() { weight.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub(crate) fn learned(mut self) -> Self {
        self.learned = true;
        self
    }

    /// `weight × matched / total`, zero when nothing matched
    pub fn score(&self, input: &MatchInput<'_>) -> f64 {
        if self.matchers.is_empty() {
            return 0.0;
        }
        let matched = self.matchers.iter().filter(|m| m.matches(input)).count();
        if matched == 0 {
            return 0.0;
        }
        self.weight * matched as f64 / self.matchers.len() as f64
    }
}

/// Aggregated match result for one category
#[derive(Debug, Clone, Default)]
pub struct CategoryScore {
    /// Sum of pattern scores, capped at 1
    pub score: f64,
    /// Highest-scoring pattern and its score
    pub best: Option<(f64, Arc<Pattern>)>,
    /// Highest severity among matched patterns
    pub severity: Option<Severity>,
    pub matched: Vec<PatternId>,
}

/// Result of scanning one pattern set
#[derive(Debug, Clone)]
pub struct PatternScan {
    pub per_category: [CategoryScore; Category::COUNT],
    /// Most severe near-exact match, if any
    pub exact: Option<Arc<Pattern>>,
    pub evaluated: usize,
}

/// Immutable, versioned pattern collection
#[derive(Debug, Default)]
pub struct PatternSet {
    version: u64,
    patterns: Vec<Arc<Pattern>>,
    by_category: [Vec<usize>; Category::COUNT],
}

impl PatternSet {
    pub fn new(version: u64, patterns: Vec<Arc<Pattern>>) -> Self {
        let mut by_category: [Vec<usize>; Category::COUNT] = Default::default();
        for (index, pattern) in patterns.iter().enumerate() {
            by_category[pattern.category.index()].push(index);
        }
        Self {
            version,
            patterns,
            by_category,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[Arc<Pattern>] {
        &self.patterns
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Pattern>> {
        self.patterns.iter().find(|p| p.id == id)
    }

    /// Score every pattern of the plausible categories.
    ///
    /// Once one pattern scores at least `exact_score`, accumulation stops:
    /// the rest of the set is only checked for other near-exact hits, so a
    /// tie between categories can still be decided by severity. `exact` is
    /// the most severe of those hits.
    pub fn scan(&self, input: &MatchInput<'_>, plausible: &[Category], exact_score: f64) -> PatternScan {
        let mut per_category: [CategoryScore; Category::COUNT] = Default::default();
        let mut exact: Option<Arc<Pattern>> = None;
        let mut evaluated = 0;

        for category in plausible {
            let slot = &mut per_category[category.index()];
            for &index in &self.by_category[category.index()] {
                let pattern = &self.patterns[index];
                evaluated += 1;

                let score = pattern.score(input);
                if score <= 0.0 || (exact.is_some() && score < exact_score) {
                    continue;
                }

                slot.score = (slot.score + score).min(1.0);
                slot.severity = Some(match slot.severity {
                    Some(current) => current.max(pattern.severity),
                    None => pattern.severity,
                });
                slot.matched.push(pattern.id.clone());
                if slot.best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                    slot.best = Some((score, Arc::clone(pattern)));
                }

                if score >= exact_score
                    && exact.as_ref().map(|e| pattern.severity.rank() > e.severity.rank()).unwrap_or(true)
                {
                    exact = Some(Arc::clone(pattern));
                }
            }
        }

        PatternScan {
            per_category,
            exact,
            evaluated,
        }
    }
}

/// Holder of the current pattern set
#[derive(Debug)]
pub struct PatternLibrary {
    current: RwLock<Arc<PatternSet>>,
}

impl PatternLibrary {
    pub fn new(patterns: Vec<Pattern>) -> Self {
        let patterns = patterns.into_iter().map(Arc::new).collect();
        Self {
            current: RwLock::new(Arc::new(PatternSet::new(1, patterns))),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_patterns())
    }

    /// The set a classification should run against
    pub fn snapshot(&self) -> Arc<PatternSet> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().get(id).is_some()
    }

    /// Publish a new set with `pattern` appended.
    ///
    /// Returns the new version, or `None` if a pattern with the same id exists.
    pub fn append(&self, pattern: Pattern) -> Option<u64> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.get(&pattern.id).is_some() {
            return None;
        }

        let mut patterns = current.patterns().to_vec();
        patterns.push(Arc::new(pattern));
        let version = current.version() + 1;
        *current = Arc::new(PatternSet::new(version, patterns));
        Some(version)
    }
}

impl Default for PatternLibrary {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Patterns shipped with the engine
pub fn default_patterns() -> Vec<Pattern> {
    use Category::*;
    use Severity::*;
    use Strategy::*;

    let mut patterns = vec![
        // Core
        Pattern::new("core-undefined-property", Core, High, RestartSubsystem)
            .with_matcher(Matcher::message("cannot read propert"))
            .with_matcher(Matcher::frame("engine"))
            .with_weight(0.7),
        Pattern::new("core-not-a-function", Core, High, RestartSubsystem)
            .with_matcher(Matcher::message("is not a function"))
            .with_weight(0.6),
        Pattern::new("core-game-loop", Core, Critical, RestartSubsystem)
            .with_matcher(Matcher::frame("gameloop"))
            .with_matcher(Matcher::frame("tick"))
            .with_weight(0.8),
        // Save
        Pattern::new("save-quota", Save, High, CheckpointRollback)
            .with_matcher(Matcher::message("quota"))
            .with_matcher(Matcher::frame("save"))
            .with_weight(0.9),
        Pattern::new("save-serialize", Save, High, CheckpointRollback)
            .with_matcher(Matcher::message("converting circular structure to json"))
            .with_weight(0.9),
        Pattern::new("save-storage-access", Save, Medium, Fallback)
            .with_matcher(Matcher::message("localstorage"))
            .with_matcher(Matcher::frame("storage"))
            .with_weight(0.7),
        Pattern::new("save-frame", Save, Medium, CheckpointRollback)
            .with_matcher(Matcher::frame("save"))
            .with_weight(0.5),
        // Progression
        Pattern::new("progression-negative-resource", Progression, High, CheckpointRollback)
            .with_matcher(Matcher::message("negative"))
            .with_matcher(Matcher::context_equals("subsystem", "progression"))
            .with_weight(0.8),
        Pattern::new("progression-frame", Progression, Medium, CheckpointRollback)
            .with_matcher(Matcher::frame("cultivation"))
            .with_weight(0.5),
        // UI
        Pattern::new("ui-render", Ui, Medium, Fallback)
            .with_matcher(Matcher::frame("render"))
            .with_weight(0.6),
        Pattern::new("ui-dom-missing", Ui, Low, Fallback)
            .with_matcher(Matcher::message("getelementbyid"))
            .with_weight(0.6),
        Pattern::new("ui-component", Ui, Medium, Fallback)
            .with_matcher(Matcher::frame("component"))
            .with_matcher(Matcher::frame("render"))
            .with_weight(0.8),
        // Network
        Pattern::new("network-timeout", Network, Low, RetryWithBackoff)
            .with_matcher(Matcher::message("timeout"))
            .with_weight(0.8),
        Pattern::new("network-status", Network, Medium, RetryWithBackoff)
            .with_matcher(Matcher::context_above("http_status", 499.0))
            .with_weight(0.8),
        Pattern::new("network-connection", Network, Low, RetryWithBackoff)
            .with_matcher(Matcher::message("connection"))
            .with_matcher(Matcher::frame("fetch"))
            .with_weight(0.8),
        Pattern::new("network-fetch-frame", Network, Low, RetryWithBackoff)
            .with_matcher(Matcher::frame("fetch"))
            .with_weight(0.5),
        // Memory
        Pattern::new("memory-growth", Memory, High, RestartSubsystem)
            .with_matcher(Matcher::context_above("memory_delta_mb", 50.0))
            .with_weight(0.9),
        Pattern::new("memory-heap-limit", Memory, Critical, RestartSubsystem)
            .with_matcher(Matcher::context_above("heap_used_ratio", 0.9))
            .with_weight(0.9),
        Pattern::new("memory-allocation-rate", Memory, Medium, RestartSubsystem)
            .with_matcher(Matcher::ContextRate {
                key: "allocations".to_string(),
                window_key: "window_ms".to_string(),
                per_second: 10_000.0,
            })
            .with_weight(0.7),
    ];

    if let Ok(matcher) = Matcher::regex(r"\b(nan|infinity)\b") {
        patterns.push(
            Pattern::new("progression-invalid-value", Progression, High, CheckpointRollback)
                .with_matcher(matcher)
                .with_matcher(Matcher::frame("progress"))
                .with_weight(0.8),
        );
    }

    if let Ok(matcher) = Matcher::regex(r"\b(webgl|canvas)\b.*\b(context|lost)\b") {
        patterns.push(
            Pattern::new("ui-graphics-context", Ui, High, Fallback)
                .with_matcher(matcher)
                .with_weight(0.8),
        );
    }

    patterns
}
