/// Engine configuration with layered loading
///
/// Sources are merged in order: built-in defaults, an optional config file
/// (format inferred from its extension), then `RESILIENCE__SECTION__KEY`
/// environment variables.
use crate::taxonomy::Severity;
use crate::{ResilienceError, ResilienceResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "RESILIENCE";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub classifier: ClassifierConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub checkpoint: CheckpointConfig,
    pub controller: ControllerConfig,
    pub logging: LoggingConfig,
}

/// Classification, fingerprinting and learning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Maximum fingerprints kept in the LRU history
    pub history_capacity: usize,
    /// Consistent prior classifications needed before confidence is raised
    pub consistency_threshold: u32,
    /// Confidence added per consistent occurrence past the threshold
    pub agreement_boost: u8,
    /// Upper bound on the total learning boost
    pub max_boost: u8,
    /// Confidence removed per recorded disagreement
    pub disagreement_penalty: u8,
    /// Upper bound on the total disagreement penalty
    pub max_penalty: u8,
    /// Confidence removed when the last recovery for the fingerprint failed
    pub failure_penalty: u8,
    /// Rule confidence at or above which pattern scoring is skipped
    pub short_circuit_confidence: u8,
    /// Pattern score (0..=1) that ends the pattern scan early
    pub exact_match_score: f64,
    /// Confidence reported for well-formed events nothing matched
    pub unmatched_confidence: u8,
    /// Confidence reported when only a subsystem hint identified the category
    pub subsystem_hint_confidence: u8,
    /// Rules beyond this count are never evaluated
    pub max_rules: usize,
    /// Messages are truncated to this many bytes before matching
    pub max_message_len: usize,
    /// Stack frames parsed for matching
    pub max_stack_frames: usize,
    /// Top stack frames folded into the fingerprint
    pub fingerprint_frames: usize,
    /// Occurrences before an unclassified fingerprint may be promoted
    pub promotion_threshold: u32,
    /// Enable confidence learning and pattern promotion
    pub learning_enabled: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1024,
            consistency_threshold: 3,
            agreement_boost: 5,
            max_boost: 20,
            disagreement_penalty: 10,
            max_penalty: 40,
            failure_penalty: 5,
            short_circuit_confidence: 90,
            exact_match_score: 0.95,
            unmatched_confidence: 15,
            subsystem_hint_confidence: 30,
            max_rules: 64,
            max_message_len: 4096,
            max_stack_frames: 32,
            fingerprint_frames: 5,
            promotion_threshold: 3,
            learning_enabled: true,
        }
    }
}

/// Circuit breaker parameters, shared by every category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub threshold: u32,
    /// Initial cool-down before a half-open trial
    pub reset_timeout_ms: u64,
    /// Cap for the doubled cool-down
    pub max_reset_timeout_ms: u64,
    /// Factor applied to the cool-down after a failed trial
    pub backoff_multiplier: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            reset_timeout_ms: 30_000,
            max_reset_timeout_ms: 300_000,
            backoff_multiplier: 2,
        }
    }
}

/// Retry parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Synchronous attempts made by IMMEDIATE_RETRY
    pub immediate_attempts: u32,
    /// First backoff delay
    pub base_delay_ms: u64,
    /// Backoff delay cap
    pub max_delay_ms: u64,
    /// Attempts made by RETRY_WITH_BACKOFF
    pub max_attempts: u32,
    /// Jitter factor in 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            immediate_attempts: 2,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: 0.3,
        }
    }
}

/// Checkpoint creation and retention parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Minimum spacing between non-HIGH checkpoints
    pub min_interval_ms: u64,
    /// Regular (non-milestone) checkpoints retained
    pub max_checkpoints: usize,
    /// Milestone checkpoints retained
    pub max_milestones: usize,
    /// Regular checkpoints older than this are evicted
    pub max_age_ms: u64,
    /// Record capacity of the default store
    pub store_capacity: usize,
    /// gzip level 0..=9
    pub compression_level: u32,
    /// Nesting deeper than this is rejected as self-referential
    pub max_depth: usize,
    /// Take a HIGH priority checkpoint before RESTART_SUBSYSTEM
    pub pre_recovery_checkpoints: bool,
    /// Directory for the file store; `None` keeps checkpoints in memory
    pub directory: Option<PathBuf>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 30_000,
            max_checkpoints: 10,
            max_milestones: 3,
            max_age_ms: 24 * 60 * 60 * 1000,
            store_capacity: 32,
            compression_level: 6,
            max_depth: 64,
            pre_recovery_checkpoints: true,
            directory: None,
        }
    }
}

/// Façade parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Reports nested deeper than this bypass classification entirely
    pub max_handling_depth: u32,
    /// Recent raw error records kept for diagnostics
    pub diagnostics_capacity: usize,
    /// Notifications below this severity are suppressed
    pub notify_min_severity: Severity,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_handling_depth: 3,
            diagnostics_capacity: 100,
            notify_min_severity: Severity::Medium,
        }
    }
}

/// Logging parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Also write a daily rolling log file into this directory
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl ResilienceConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> ResilienceResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ResilienceError::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(config::File::from(default_path).required(false));
                }
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: ResilienceConfig = settings.try_deserialize()?;
        loaded.validate()?;

        tracing::debug!(config = ?path, "Configuration loaded");

        Ok(loaded)
    }

    /// Reject values that would disable core invariants
    pub fn validate(&self) -> ResilienceResult<()> {
        let mut problems = Vec::new();

        if self.breaker.threshold == 0 {
            problems.push("breaker.threshold must be at least 1");
        }
        if self.breaker.max_reset_timeout_ms < self.breaker.reset_timeout_ms {
            problems.push("breaker.max_reset_timeout_ms must be >= reset_timeout_ms");
        }
        if self.breaker.backoff_multiplier == 0 {
            problems.push("breaker.backoff_multiplier must be at least 1");
        }
        if self.classifier.history_capacity == 0 {
            problems.push("classifier.history_capacity must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.classifier.exact_match_score) {
            problems.push("classifier.exact_match_score must be within 0.0..=1.0");
        }
        if self.checkpoint.max_checkpoints == 0 {
            problems.push("checkpoint.max_checkpoints must be at least 1");
        }
        if self.checkpoint.store_capacity
            < self.checkpoint.max_checkpoints + self.checkpoint.max_milestones
        {
            problems.push("checkpoint.store_capacity must hold max_checkpoints + max_milestones");
        }
        if self.checkpoint.compression_level > 9 {
            problems.push("checkpoint.compression_level must be within 0..=9");
        }
        if self.controller.diagnostics_capacity == 0 {
            problems.push("controller.diagnostics_capacity must be at least 1");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ResilienceError::Config(problems.join("; ")))
        }
    }
}

/// Platform config file location, e.g. `~/.config/resilience-engine/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "resilience", "resilience-engine")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Platform data directory for file-backed checkpoints
pub fn default_checkpoint_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "resilience", "resilience-engine")
        .map(|dirs| dirs.data_dir().join("checkpoints"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.breaker.threshold, 3);
        assert_eq!(config.checkpoint.min_interval_ms, 30_000);
        assert_eq!(config.classifier.consistency_threshold, 3);
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = ResilienceConfig::default();
        config.breaker.threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("breaker.threshold"));
    }

    #[test]
    fn test_validate_rejects_small_store() {
        let mut config = ResilienceConfig::default();
        config.checkpoint.store_capacity = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[breaker]\nthreshold = 5\n\n[checkpoint]\nmax_checkpoints = 4\nmin_interval_ms = 1000"
        )
        .unwrap();

        let config = ResilienceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.checkpoint.max_checkpoints, 4);
        assert_eq!(config.checkpoint.min_interval_ms, 1000);
        // Untouched sections keep their defaults
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[breaker]\nthreshold = 5").unwrap();

        std::env::set_var("RESILIENCE__BREAKER__THRESHOLD", "7");
        let config = ResilienceConfig::load(Some(file.path()));
        std::env::remove_var("RESILIENCE__BREAKER__THRESHOLD");

        assert_eq!(config.unwrap().breaker.threshold, 7);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let result = ResilienceConfig::load(Some(Path::new("/nonexistent/resilience.toml")));
        assert!(matches!(result, Err(ResilienceError::Config(_))));
    }
}
