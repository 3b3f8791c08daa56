/// Error fingerprinting and bounded occurrence history
///
/// A fingerprint is a stable SHA-256-derived identity over
/// `(category, normalized message template, top-N stack frames)`. Dynamic
/// tokens (numbers, ids, urls, paths, timestamps, long quoted strings) are
/// stripped from the message first so repeated occurrences of the same failure
/// collapse onto one fingerprint.
use crate::config::ClassifierConfig;
use crate::taxonomy::{Category, Severity, Strategy};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

lazy_static! {
    static ref RE_URL: Regex =
        Regex::new(r"(?:https?|file|webpack|chrome-extension|moz-extension)://[^\s)'\x22]+")
            .expect("valid url regex");
    static ref RE_TIMESTAMP: Regex =
        Regex::new(r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:z|[+-]\d{2}:?\d{2})?")
            .expect("valid timestamp regex");
    static ref RE_UUID: Regex =
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
            .expect("valid uuid regex");
    static ref RE_PATH: Regex = Regex::new(r"(?:/[\w.\-]+)+\.\w+").expect("valid path regex");
    static ref RE_QUOTED: Regex =
        Regex::new(r#""[^"]{20,}"|'[^']{20,}'|`[^`]{20,}`"#).expect("valid quoted regex");
    static ref RE_HEX: Regex =
        Regex::new(r"\b0x[0-9a-f]+\b|\b[0-9a-f]*\d[0-9a-f]*[a-f][0-9a-f]*\b|\b[0-9a-f]*[a-f][0-9a-f]*\d[0-9a-f]*\b")
            .expect("valid hex regex");
    static ref RE_NUMBER: Regex = Regex::new(r"\d+(?:\.\d+)?").expect("valid number regex");
    static ref RE_WHITESPACE: Regex = Regex::new(r"\s+").expect("valid whitespace regex");
    static ref RE_LINE_COL: Regex = Regex::new(r"(?::\d+)+$").expect("valid line:col regex");
    static ref RE_RUST_FRAME: Regex = Regex::new(r"^\d+:\s+(.+)$").expect("valid frame regex");
}

/// Stable identity of an error signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FingerprintId(u64);

impl FingerprintId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FingerprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for FingerprintId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16)
            .map(FingerprintId)
            .map_err(|e| format!("invalid fingerprint '{}': {}", s, e))
    }
}

impl From<FingerprintId> for String {
    fn from(id: FingerprintId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for FingerprintId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Normalizes messages/stacks and derives fingerprints
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    /// Number of top frames folded into the fingerprint
    frames: usize,
}

impl FingerprintEngine {
    pub fn new(frames: usize) -> Self {
        Self { frames }
    }

    /// Replace dynamic tokens with placeholders
    pub fn normalize_message(&self, message: &str) -> String {
        let normalized = message.to_lowercase();
        let normalized = RE_URL.replace_all(&normalized, "<url>");
        let normalized = RE_TIMESTAMP.replace_all(&normalized, "<time>");
        let normalized = RE_UUID.replace_all(&normalized, "<id>");
        let normalized = RE_PATH.replace_all(&normalized, "<path>");
        let normalized = RE_QUOTED.replace_all(&normalized, "<str>");
        let normalized = RE_HEX.replace_all(&normalized, "<id>");
        let normalized = RE_NUMBER.replace_all(&normalized, "<num>");
        let normalized = RE_WHITESPACE.replace_all(&normalized, " ");
        normalized.trim().to_string()
    }

    /// Parse up to `limit` frames out of a V8, SpiderMonkey/JSC or Rust-style stack.
    ///
    /// Frames are lowercased and reduced to `function@file` with line and column
    /// numbers removed. Lines that do not look like frames (the leading message
    /// line, blank lines) are skipped.
    pub fn normalize_frames(&self, stack: &str, limit: usize) -> Vec<String> {
        stack
            .lines()
            .filter_map(parse_frame)
            .take(limit)
            .collect()
    }

    /// Derive the fingerprint from already-normalized parts
    pub fn fingerprint(&self, category: Category, template: &str, frames: &[String]) -> FingerprintId {
        let mut hasher = Sha256::new();
        hasher.update(category.to_string().as_bytes());
        hasher.update([0x1f]);
        hasher.update(template.as_bytes());
        for frame in frames.iter().take(self.frames) {
            hasher.update([0x1e]);
            hasher.update(frame.as_bytes());
        }
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        FingerprintId(u64::from_be_bytes(prefix))
    }

    /// Fingerprint for events with neither message nor stack
    pub fn malformed(&self) -> FingerprintId {
        self.fingerprint(Category::Unknown, "", &[])
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self::new(5)
    }
}

fn parse_frame(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    // V8: "at fn (location)" or "at location"
    if let Some(rest) = line.strip_prefix("at ") {
        return Some(match rest.rsplit_once(" (") {
            Some((function, location)) => {
                join_frame(function, location.trim_end_matches(')'))
            }
            None => join_frame("<anonymous>", rest),
        });
    }

    // SpiderMonkey / JavaScriptCore: "fn@location"
    if let Some((function, location)) = line.split_once('@') {
        if location.contains(':') || location.contains('/') {
            let function = if function.is_empty() { "<anonymous>" } else { function };
            return Some(join_frame(function, location));
        }
    }

    // Rust backtraces: "  3: crate::module::function"
    if let Some(captures) = RE_RUST_FRAME.captures(line) {
        return captures.get(1).map(|m| m.as_str().to_lowercase());
    }

    None
}

fn join_frame(function: &str, location: &str) -> String {
    let file = location
        .rsplit('/')
        .next()
        .unwrap_or(location)
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let file = RE_LINE_COL.replace(file, "");

    let function = function.trim().to_lowercase();
    if file.is_empty() {
        function
    } else {
        format!("{}@{}", function, file.to_lowercase())
    }
}

/// Result of a recovery attempt, as remembered per fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordedOutcome {
    Success,
    Failure,
}

/// Per-fingerprint occurrence record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub count: u64,
    /// Consecutive occurrences classified the same way, including the latest
    pub streak: u32,
    /// Occurrences whose classification differed from the previous one
    pub disagreements: u32,
    pub last_severity: Severity,
    pub last_strategy: Strategy,
    pub last_outcome: Option<RecordedOutcome>,
    pub last_confidence_adjustment: i32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Confidence change computed from history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Adjustment {
    pub delta: i32,
    pub unstable: bool,
}

/// Bounded LRU map of fingerprint history
pub struct FingerprintHistory {
    entries: LruCache<FingerprintId, HistoryEntry>,
}

impl FingerprintHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up prior occurrences, compute the confidence adjustment, then record
    /// this occurrence.
    ///
    /// Agreement means the same severity and strategy as the previous occurrence.
    /// Once `consistency_threshold` prior occurrences agreed, each further agreeing
    /// occurrence adds `agreement_boost` (capped at `max_boost`). A fingerprint
    /// with recorded disagreements whose current streak is still below the
    /// threshold is unstable and loses `disagreement_penalty` per disagreement
    /// (capped at `max_penalty`). A failed last recovery costs `failure_penalty`.
    pub fn observe(
        &mut self,
        fingerprint: FingerprintId,
        severity: Severity,
        strategy: Strategy,
        config: &ClassifierConfig,
        now: DateTime<Utc>,
    ) -> Adjustment {
        let Some(entry) = self.entries.get_mut(&fingerprint) else {
            self.entries.put(
                fingerprint,
                HistoryEntry {
                    count: 1,
                    streak: 1,
                    disagreements: 0,
                    last_severity: severity,
                    last_strategy: strategy,
                    last_outcome: None,
                    last_confidence_adjustment: 0,
                    first_seen: now,
                    last_seen: now,
                },
            );
            return Adjustment::default();
        };

        let agrees = entry.last_severity == severity && entry.last_strategy == strategy;
        let prior_streak = entry.streak;

        entry.count += 1;
        entry.last_seen = now;
        if agrees {
            entry.streak = entry.streak.saturating_add(1);
        } else {
            entry.streak = 1;
            entry.disagreements = entry.disagreements.saturating_add(1);
        }

        let mut delta = 0i32;

        let threshold = config.consistency_threshold.max(1);
        if agrees && prior_streak >= threshold {
            let steps = saturating_i32(prior_streak - threshold + 1);
            delta += i32::from(config.agreement_boost)
                .saturating_mul(steps)
                .min(i32::from(config.max_boost));
        }

        let unstable = entry.disagreements > 0 && entry.streak < threshold;
        if unstable {
            let penalty = i32::from(config.disagreement_penalty).saturating_mul(saturating_i32(entry.disagreements));
            delta -= penalty.min(i32::from(config.max_penalty));
        }

        if entry.last_outcome == Some(RecordedOutcome::Failure) {
            delta -= i32::from(config.failure_penalty);
        }

        entry.last_severity = severity;
        entry.last_strategy = strategy;
        entry.last_confidence_adjustment = delta;

        Adjustment { delta, unstable }
    }

    /// Count an occurrence without learning (malformed events)
    pub fn record_only(&mut self, fingerprint: FingerprintId, now: DateTime<Utc>) {
        match self.entries.get_mut(&fingerprint) {
            Some(entry) => {
                entry.count += 1;
                entry.last_seen = now;
            }
            None => {
                self.entries.put(
                    fingerprint,
                    HistoryEntry {
                        count: 1,
                        streak: 1,
                        disagreements: 0,
                        last_severity: Severity::Medium,
                        last_strategy: Strategy::Ignore,
                        last_outcome: None,
                        last_confidence_adjustment: 0,
                        first_seen: now,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Remember how recovery went for a fingerprint
    pub fn record_outcome(&mut self, fingerprint: FingerprintId, outcome: RecordedOutcome) -> bool {
        match self.entries.get_mut(&fingerprint) {
            Some(entry) => {
                entry.last_outcome = Some(outcome);
                true
            }
            None => false,
        }
    }

    /// Read an entry without touching LRU order
    pub fn peek(&self, fingerprint: &FingerprintId) -> Option<&HistoryEntry> {
        self.entries.peek(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

fn saturating_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
