/// Per-category circuit breakers
///
/// States:
/// - Closed: normal operation, recovery attempts proceed
/// - Open: too many consecutive failures, attempts are short-circuited
/// - HalfOpen: one trial attempt decides between Closed and Open
///
/// The reset timeout grows by `backoff_multiplier` every time a trial fails
/// (capped at `max_reset_timeout_ms`) and snaps back to its base value once
/// the breaker closes again.
use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::taxonomy::Category;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Normal operation
    Closed,

    /// Too many failures, fail fast
    Open,

    /// Testing whether the category recovered
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Answer to "may I attempt recovery now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Breaker closed, attempt normally
    Granted,
    /// The single half-open trial; its result decides the next state
    Trial,
    /// Breaker open (or trial already in flight), do not attempt
    Rejected,
    /// No attempt is being made, the breaker was not consulted
    Skipped,
}

impl Permit {
    /// State the caller observed when the permit was issued
    pub fn observed_state(&self) -> BreakerState {
        match self {
            Permit::Granted | Permit::Skipped => BreakerState::Closed,
            Permit::Trial => BreakerState::HalfOpen,
            Permit::Rejected => BreakerState::Open,
        }
    }
}

/// Point-in-time view of one breaker, for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub category: Category,
    pub state: BreakerState,
    pub failure_count: u32,
    pub threshold: u32,
    pub reset_timeout_ms: u64,
    /// Monotonic milliseconds of the last state change
    pub last_transition_ms: Option<u64>,
    /// Time left before an open breaker admits a trial
    pub remaining_open_ms: Option<u64>,
    /// Incremented on every state change
    pub generation: u64,
    pub times_opened: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone)]
struct BreakerInner {
    state: BreakerState,

    /// Consecutive failures while closed
    failure_count: u32,

    /// Current reset timeout (grows on failed trials)
    reset_timeout_ms: u64,

    last_transition_ms: Option<u64>,

    /// A half-open trial is outstanding
    trial_in_flight: bool,

    generation: u64,
    times_opened: u64,
    rejected: u64,
}

/// Circuit breaker for one category
pub struct CircuitBreaker {
    category: Category,

    /// Consecutive failures before opening
    threshold: u32,

    base_reset_timeout_ms: u64,
    max_reset_timeout_ms: u64,
    backoff_multiplier: u32,

    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(category: Category, config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            category,
            threshold: config.threshold.max(1),
            base_reset_timeout_ms: config.reset_timeout_ms,
            max_reset_timeout_ms: config.max_reset_timeout_ms.max(config.reset_timeout_ms),
            backoff_multiplier: config.backoff_multiplier.max(1),
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                reset_timeout_ms: config.reset_timeout_ms,
                last_transition_ms: None,
                trial_in_flight: false,
                generation: 0,
                times_opened: 0,
                rejected: 0,
            }),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Ask to attempt recovery.
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open and
    /// hands out exactly one `Trial`; everything else while open or while the
    /// trial is outstanding is `Rejected`.
    pub fn acquire(&self) -> Permit {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => Permit::Granted,
            BreakerState::Open => {
                let opened_at = inner.last_transition_ms.unwrap_or(now);
                if now.saturating_sub(opened_at) >= inner.reset_timeout_ms {
                    self.transition(&mut inner, BreakerState::HalfOpen, now);
                    inner.trial_in_flight = true;
                    tracing::info!(category = %self.category, "Circuit breaker transitioning to HalfOpen");
                    Permit::Trial
                } else {
                    inner.rejected += 1;
                    Permit::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected += 1;
                    Permit::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Permit::Trial
                }
            }
        }
    }

    /// Record a successful recovery
    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                inner.reset_timeout_ms = self.base_reset_timeout_ms;
                self.transition(&mut inner, BreakerState::Closed, now);
                tracing::info!(category = %self.category, "Circuit breaker CLOSED after successful trial");
            }
            BreakerState::Open => {
                // A late result from before the breaker opened; the open period stands
                tracing::debug!(category = %self.category, "Success recorded while circuit was OPEN - ignored");
            }
        }
    }

    /// Record a failed recovery (or a new failure in the category)
    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.threshold {
                    self.transition(&mut inner, BreakerState::Open, now);
                    inner.times_opened += 1;
                    tracing::warn!(
                        category = %self.category,
                        failures = inner.failure_count,
                        reset_timeout = %humantime::format_duration(Duration::from_millis(inner.reset_timeout_ms)),
                        "Circuit breaker OPENED"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.reset_timeout_ms = inner
                    .reset_timeout_ms
                    .saturating_mul(self.backoff_multiplier as u64)
                    .min(self.max_reset_timeout_ms);
                self.transition(&mut inner, BreakerState::Open, now);
                inner.times_opened += 1;
                tracing::warn!(
                    category = %self.category,
                    reset_timeout = %humantime::format_duration(Duration::from_millis(inner.reset_timeout_ms)),
                    "Circuit breaker REOPENED after failed trial"
                );
            }
            BreakerState::Open => {
                inner.failure_count = inner.failure_count.saturating_add(1);
            }
        }
    }

    /// Give back a trial permit without a verdict (the attempt was abandoned)
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Current state without triggering any transition
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now_ms();
        let inner = self.lock();

        let remaining_open_ms = match (inner.state, inner.last_transition_ms) {
            (BreakerState::Open, Some(at)) => Some(inner.reset_timeout_ms.saturating_sub(now.saturating_sub(at))),
            _ => None,
        };

        BreakerSnapshot {
            category: self.category,
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.threshold,
            reset_timeout_ms: inner.reset_timeout_ms,
            last_transition_ms: inner.last_transition_ms,
            remaining_open_ms,
            generation: inner.generation,
            times_opened: inner.times_opened,
            rejected: inner.rejected,
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        inner.reset_timeout_ms = self.base_reset_timeout_ms;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed, now);
        }
        tracing::info!(category = %self.category, "Circuit breaker manually reset to CLOSED");
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, now: u64) {
        tracing::debug!(category = %self.category, from = %inner.state, to = %to, "Breaker transition");
        inner.state = to;
        inner.last_transition_ms = Some(now);
        inner.generation += 1;
        if to != BreakerState::Closed {
            return;
        }
        inner.failure_count = 0;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One breaker per category, indexed by `Category::index`
pub struct BreakerBank {
    breakers: [CircuitBreaker; Category::COUNT],
}

impl BreakerBank {
    pub fn new(config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: Category::ALL.map(|category| CircuitBreaker::new(category, config, Arc::clone(&clock))),
        }
    }

    pub fn get(&self, category: Category) -> &CircuitBreaker {
        &self.breakers[category.index()]
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(CircuitBreaker::snapshot).collect()
    }

    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.reset();
        }
    }

    pub fn open_categories(&self) -> Vec<Category> {
        self.breakers
            .iter()
            .filter(|b| b.is_open())
            .map(CircuitBreaker::category)
            .collect()
    }
}
