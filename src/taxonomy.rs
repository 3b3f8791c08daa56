/// Severity, category and strategy taxonomy shared by every component.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How bad an error is for the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// The application cannot continue in its current state
    Critical,
    /// A subsystem is broken or user progress is at risk
    High,
    /// Degraded behaviour, the application keeps running
    Medium,
    /// Cosmetic or self-correcting
    Low,
    /// Noise worth recording but not acting on
    Info,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    /// Numeric rank, higher is more severe. Used for tie-breaking.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
            Severity::Info => 0,
        }
    }

    /// Return the more severe of two severities
    pub fn max(self, other: Severity) -> Severity {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn index(&self) -> usize {
        4 - self.rank() as usize
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "info" => Ok(Severity::Info),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Subsystem an error belongs to. Each category owns one circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Core,
    Save,
    Progression,
    Ui,
    Network,
    Memory,
    Unknown,
}

impl Category {
    pub const COUNT: usize = 7;

    pub const ALL: [Category; Category::COUNT] = [
        Category::Core,
        Category::Save,
        Category::Progression,
        Category::Ui,
        Category::Network,
        Category::Memory,
        Category::Unknown,
    ];

    /// Position in `Category::ALL`, used for enum-indexed arrays
    pub fn index(&self) -> usize {
        match self {
            Category::Core => 0,
            Category::Save => 1,
            Category::Progression => 2,
            Category::Ui => 3,
            Category::Network => 4,
            Category::Memory => 5,
            Category::Unknown => 6,
        }
    }

    /// Human-readable description of the subsystem
    pub fn description(&self) -> &'static str {
        match self {
            Category::Core => "Game loop and engine core",
            Category::Save => "Save data persistence",
            Category::Progression => "Player progression state",
            Category::Ui => "User interface rendering",
            Category::Network => "Remote services and fetches",
            Category::Memory => "Memory pressure and leaks",
            Category::Unknown => "Unclassified failure",
        }
    }

    /// Strategy to use when nothing more specific is known
    pub fn default_strategy(&self) -> Strategy {
        match self {
            Category::Core => Strategy::RestartSubsystem,
            Category::Save => Strategy::CheckpointRollback,
            Category::Progression => Strategy::CheckpointRollback,
            Category::Ui => Strategy::Fallback,
            Category::Network => Strategy::RetryWithBackoff,
            Category::Memory => Strategy::RestartSubsystem,
            Category::Unknown => Strategy::Ignore,
        }
    }

    /// Whether failures in this category are usually transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Category::Network)
    }

    /// Whether this category owns application state that a checkpoint can restore
    pub fn is_state_bearing(&self) -> bool {
        matches!(self, Category::Save | Category::Progression)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Core => write!(f, "CORE"),
            Category::Save => write!(f, "SAVE"),
            Category::Progression => write!(f, "PROGRESSION"),
            Category::Ui => write!(f, "UI"),
            Category::Network => write!(f, "NETWORK"),
            Category::Memory => write!(f, "MEMORY"),
            Category::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "core" | "engine" | "game" | "gameloop" => Ok(Category::Core),
            "save" | "storage" | "persistence" => Ok(Category::Save),
            "progression" | "cultivation" | "progress" => Ok(Category::Progression),
            "ui" | "render" | "interface" => Ok(Category::Ui),
            "network" | "net" | "fetch" => Ok(Category::Network),
            "memory" | "mem" | "performance" => Ok(Category::Memory),
            "unknown" => Ok(Category::Unknown),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

/// Recovery action chosen for a classified error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    ImmediateRetry,
    RetryWithBackoff,
    Fallback,
    CheckpointRollback,
    RestartSubsystem,
    Ignore,
}

impl Strategy {
    /// Whether the strategy re-runs the failed operation
    pub fn is_retry(&self) -> bool {
        matches!(self, Strategy::ImmediateRetry | Strategy::RetryWithBackoff)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::ImmediateRetry => write!(f, "IMMEDIATE_RETRY"),
            Strategy::RetryWithBackoff => write!(f, "RETRY_WITH_BACKOFF"),
            Strategy::Fallback => write!(f, "FALLBACK"),
            Strategy::CheckpointRollback => write!(f, "CHECKPOINT_ROLLBACK"),
            Strategy::RestartSubsystem => write!(f, "RESTART_SUBSYSTEM"),
            Strategy::Ignore => write!(f, "IGNORE"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "immediate_retry" => Ok(Strategy::ImmediateRetry),
            "retry_with_backoff" | "backoff" => Ok(Strategy::RetryWithBackoff),
            "fallback" => Ok(Strategy::Fallback),
            "checkpoint_rollback" | "rollback" => Ok(Strategy::CheckpointRollback),
            "restart_subsystem" | "restart" => Ok(Strategy::RestartSubsystem),
            "ignore" => Ok(Strategy::Ignore),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}
