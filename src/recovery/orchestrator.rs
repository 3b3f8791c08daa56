/// Recovery orchestration
///
/// `plan` consults the category breaker and picks a strategy, `execute` runs
/// it, escalating along `retry/restart → fallback → rollback` when an action
/// fails, and feeds the verdict back into the breaker.
use super::circuit_breaker::{BreakerBank, BreakerState, CircuitBreaker, Permit};
use super::retry::{ExponentialBackoff, PendingRetry, RetryScheduler, RetryStrategy};
use super::{RecoveryActions, RecoveryOutcome, RecoveryStatus};
use crate::classification::Classification;
use crate::clock::Clock;
use crate::config::ResilienceConfig;
use crate::event::ErrorEvent;
use crate::taxonomy::{Category, Severity, Strategy};
use crate::ResilienceResult;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Checkpoint operations the orchestrator needs, provided by the controller
#[cfg_attr(test, mockall::automock)]
pub trait CheckpointPort {
    /// Progressive rollback on behalf of `category`; returns the restored
    /// checkpoint id
    fn rollback(&self, category: Category, reason: &str) -> ResilienceResult<String>;

    /// Take a high-priority checkpoint before a disruptive recovery
    fn pre_recovery_checkpoint(&self, category: Category) -> ResilienceResult<()>;
}

/// Strategy decision plus the breaker permit it was made under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub strategy: Strategy,
    pub permit: Permit,
    pub short_circuited: bool,
}

/// Pick the strategy to run.
///
/// An open breaker dominates: the hinted action is replaced by
/// `CHECKPOINT_ROLLBACK` for critical or state-bearing errors and by
/// `FALLBACK` otherwise. Retries are reserved for retryable classifications;
/// critical and severe save errors go straight to rollback.
pub fn select_strategy(classification: &Classification, breaker: BreakerState) -> Strategy {
    let hint = classification.strategy_hint();
    let severity = classification.severity();
    let category = classification.category();

    if hint == Strategy::Ignore {
        return Strategy::Ignore;
    }

    if breaker == BreakerState::Open {
        return if hint == Strategy::CheckpointRollback
            || severity == Severity::Critical
            || category.is_state_bearing()
        {
            Strategy::CheckpointRollback
        } else {
            Strategy::Fallback
        };
    }

    if hint.is_retry() {
        if severity == Severity::Critical
            || (category == Category::Save && severity.rank() >= Severity::High.rank())
        {
            return Strategy::CheckpointRollback;
        }
        if !classification.is_retryable() {
            return Strategy::Fallback;
        }
    }

    hint
}

/// Next strategy after `strategy` failed, `None` when the chain is exhausted
fn next_in_chain(strategy: Strategy, classification: &Classification) -> Option<Strategy> {
    match strategy {
        Strategy::ImmediateRetry | Strategy::RetryWithBackoff | Strategy::RestartSubsystem => {
            Some(Strategy::Fallback)
        }
        Strategy::Fallback
            if classification.category().is_state_bearing()
                || classification.severity().rank() >= Severity::High.rank() =>
        {
            Some(Strategy::CheckpointRollback)
        }
        _ => None,
    }
}

struct ChainResult {
    strategy: Strategy,
    status: RecoveryStatus,
    attempts: u32,
    detail: Option<String>,
}

/// Selects and executes recovery strategies
pub struct RecoveryOrchestrator {
    breakers: BreakerBank,
    retry: Box<dyn RetryStrategy>,
    immediate_attempts: u32,
    actions: Arc<dyn RecoveryActions>,
    scheduler: Mutex<RetryScheduler>,
    clock: Arc<dyn Clock>,
}

impl RecoveryOrchestrator {
    pub fn new(config: &ResilienceConfig, actions: Arc<dyn RecoveryActions>, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: BreakerBank::new(&config.breaker, Arc::clone(&clock)),
            retry: Box::new(ExponentialBackoff::from_config(&config.retry)),
            immediate_attempts: config.retry.immediate_attempts.max(1),
            actions,
            scheduler: Mutex::new(RetryScheduler::new()),
            clock,
        }
    }

    pub fn breakers(&self) -> &BreakerBank {
        &self.breakers
    }

    pub fn breaker(&self, category: Category) -> &CircuitBreaker {
        self.breakers.get(category)
    }

    /// Consult the breaker and choose a strategy.
    ///
    /// `IGNORE` classifications do not attempt anything and leave the breaker
    /// untouched.
    pub fn plan(&self, classification: &Classification) -> RecoveryPlan {
        if classification.strategy_hint() == Strategy::Ignore {
            return RecoveryPlan {
                strategy: Strategy::Ignore,
                permit: Permit::Skipped,
                short_circuited: false,
            };
        }

        let permit = self.breakers.get(classification.category()).acquire();
        let strategy = select_strategy(classification, permit.observed_state());

        if permit == Permit::Rejected {
            tracing::info!(
                category = %classification.category(),
                hint = %classification.strategy_hint(),
                strategy = %strategy,
                "Breaker open, short-circuiting recovery"
            );
        }

        RecoveryPlan {
            strategy,
            permit,
            short_circuited: permit == Permit::Rejected,
        }
    }

    /// Run a plan and account for its outcome on the breaker
    pub fn execute(
        &self,
        plan: &RecoveryPlan,
        classification: &Classification,
        event: &ErrorEvent,
        port: &dyn CheckpointPort,
    ) -> RecoveryOutcome {
        let chain = self.run_chain(plan.strategy, plan.permit, classification, event, port);
        let breaker = self.breakers.get(classification.category());
        account(breaker, plan.permit, chain.status, chain.strategy != plan.strategy);

        RecoveryOutcome {
            fingerprint: classification.fingerprint(),
            category: classification.category(),
            planned: plan.strategy,
            strategy: chain.strategy,
            status: chain.status,
            attempts: chain.attempts,
            short_circuited: plan.short_circuited,
            breaker_state: breaker.state(),
            detail: chain.detail,
        }
    }

    /// `plan` followed by `execute`
    pub fn recover(
        &self,
        classification: &Classification,
        event: &ErrorEvent,
        port: &dyn CheckpointPort,
    ) -> RecoveryOutcome {
        let plan = self.plan(classification);
        self.execute(&plan, classification, event, port)
    }

    /// Run every retry whose timer has fired
    pub fn run_due_retries(&self, port: &dyn CheckpointPort) -> Vec<RecoveryOutcome> {
        let due = self.lock_scheduler().take_due(self.clock.now_ms());
        due.into_iter().map(|pending| self.run_retry(pending, port)).collect()
    }

    fn run_retry(&self, pending: PendingRetry, port: &dyn CheckpointPort) -> RecoveryOutcome {
        let breaker = self.breakers.get(pending.category);
        let permit = if pending.trial { Permit::Trial } else { breaker.acquire() };
        let classification = &pending.classification;

        if permit == Permit::Rejected {
            let strategy = select_strategy(classification, BreakerState::Open);
            let chain = self.run_chain(strategy, permit, classification, &pending.event, port);
            return RecoveryOutcome {
                fingerprint: pending.fingerprint,
                category: pending.category,
                planned: Strategy::RetryWithBackoff,
                strategy: chain.strategy,
                status: chain.status,
                attempts: chain.attempts,
                short_circuited: true,
                breaker_state: breaker.state(),
                detail: chain.detail,
            };
        }

        match guarded(|| self.actions.retry(&pending.event, pending.attempt)) {
            Ok(()) => {
                breaker.record_success();
                tracing::info!(
                    category = %pending.category,
                    fingerprint = %pending.fingerprint,
                    attempt = pending.attempt,
                    "Retry succeeded"
                );
                RecoveryOutcome {
                    fingerprint: pending.fingerprint,
                    category: pending.category,
                    planned: Strategy::RetryWithBackoff,
                    strategy: Strategy::RetryWithBackoff,
                    status: RecoveryStatus::Recovered,
                    attempts: 1,
                    short_circuited: false,
                    breaker_state: breaker.state(),
                    detail: Some(format!("succeeded on attempt {}", pending.attempt)),
                }
            }
            Err(reason) => {
                breaker.record_failure();
                tracing::warn!(
                    category = %pending.category,
                    attempt = pending.attempt,
                    reason = %reason,
                    "Retry failed"
                );

                if self.retry.should_retry(pending.attempt, classification) && !breaker.is_open() {
                    let delay = self.retry.next_delay(pending.attempt);
                    let due = self.clock.now_ms().saturating_add(delay.as_millis() as u64);
                    self.lock_scheduler().schedule(
                        classification.clone(),
                        pending.event.clone(),
                        pending.attempt + 1,
                        due,
                        false,
                    );
                    return RecoveryOutcome {
                        fingerprint: pending.fingerprint,
                        category: pending.category,
                        planned: Strategy::RetryWithBackoff,
                        strategy: Strategy::RetryWithBackoff,
                        status: RecoveryStatus::Scheduled,
                        attempts: 1,
                        short_circuited: false,
                        breaker_state: breaker.state(),
                        detail: Some(format!(
                            "attempt {} failed ({}), next in {}",
                            pending.attempt,
                            reason,
                            humantime::format_duration(delay)
                        )),
                    };
                }

                // Out of attempts (or the breaker opened): escalate, already accounted above
                let chain = self.run_chain(
                    Strategy::Fallback,
                    Permit::Skipped,
                    classification,
                    &pending.event,
                    port,
                );
                RecoveryOutcome {
                    fingerprint: pending.fingerprint,
                    category: pending.category,
                    planned: Strategy::RetryWithBackoff,
                    strategy: chain.strategy,
                    status: chain.status,
                    attempts: chain.attempts + 1,
                    short_circuited: false,
                    breaker_state: breaker.state(),
                    detail: chain.detail,
                }
            }
        }
    }

    fn run_chain(
        &self,
        first: Strategy,
        permit: Permit,
        classification: &Classification,
        event: &ErrorEvent,
        port: &dyn CheckpointPort,
    ) -> ChainResult {
        let mut strategy = first;
        let mut attempts = 0;
        let mut failures = Vec::new();

        loop {
            match self.attempt(strategy, permit, classification, event, port, &mut attempts) {
                Ok((status, detail)) => {
                    return ChainResult {
                        strategy,
                        status,
                        attempts,
                        detail,
                    }
                }
                Err(reason) => {
                    tracing::warn!(
                        category = %classification.category(),
                        strategy = %strategy,
                        reason = %reason,
                        "Recovery strategy failed"
                    );
                    failures.push(format!("{}: {}", strategy, reason));

                    match next_in_chain(strategy, classification) {
                        Some(next) => strategy = next,
                        None => {
                            let status = if classification.severity() == Severity::Critical {
                                RecoveryStatus::Emergency
                            } else {
                                RecoveryStatus::Failed
                            };
                            return ChainResult {
                                strategy,
                                status,
                                attempts,
                                detail: Some(failures.join("; ")),
                            };
                        }
                    }
                }
            }
        }
    }

    fn attempt(
        &self,
        strategy: Strategy,
        permit: Permit,
        classification: &Classification,
        event: &ErrorEvent,
        port: &dyn CheckpointPort,
        attempts: &mut u32,
    ) -> Result<(RecoveryStatus, Option<String>), String> {
        let category = classification.category();

        match strategy {
            Strategy::Ignore => Ok((RecoveryStatus::Mitigated, None)),
            Strategy::ImmediateRetry => {
                let mut last_error = String::new();
                for attempt in 1..=self.immediate_attempts {
                    *attempts += 1;
                    match guarded(|| self.actions.retry(event, attempt)) {
                        Ok(()) => {
                            return Ok((
                                RecoveryStatus::Recovered,
                                Some(format!("succeeded on attempt {}", attempt)),
                            ))
                        }
                        Err(e) => last_error = e,
                    }
                }
                Err(last_error)
            }
            Strategy::RetryWithBackoff => {
                if !self.retry.should_retry(0, classification) {
                    return Err("classification is not retryable".to_string());
                }
                let delay = self.retry.next_delay(0);
                let due = self.clock.now_ms().saturating_add(delay.as_millis() as u64);
                let id = self.lock_scheduler().schedule(
                    classification.clone(),
                    event.clone(),
                    1,
                    due,
                    permit == Permit::Trial,
                );
                tracing::debug!(
                    category = %category,
                    retry_id = id,
                    delay = %humantime::format_duration(delay),
                    "Retry scheduled"
                );
                Ok((
                    RecoveryStatus::Scheduled,
                    Some(format!("retry in {}", humantime::format_duration(delay))),
                ))
            }
            Strategy::Fallback => {
                *attempts += 1;
                guarded(|| self.actions.fallback(category, event)).map(|()| (RecoveryStatus::Mitigated, None))
            }
            Strategy::CheckpointRollback => {
                *attempts += 1;
                let cancelled = self.cancel_retries(category);
                if cancelled > 0 {
                    tracing::info!(category = %category, cancelled, "Rollback supersedes pending retries");
                }
                let reason = format!("{} recovery for {}", category, classification.fingerprint());
                port.rollback(category, &reason)
                    .map(|id| (RecoveryStatus::Recovered, Some(format!("restored checkpoint {}", id))))
                    .map_err(|e| e.to_string())
            }
            Strategy::RestartSubsystem => {
                if let Err(e) = port.pre_recovery_checkpoint(category) {
                    tracing::warn!(category = %category, error = %e, "Pre-recovery checkpoint failed, restarting anyway");
                }
                *attempts += 1;
                guarded(|| self.actions.restart_subsystem(category)).map(|()| (RecoveryStatus::Recovered, None))
            }
        }
    }

    /// Cancel pending retries for a category, releasing any held trial
    pub fn cancel_retries(&self, category: Category) -> usize {
        let cancelled = self.lock_scheduler().cancel_category(category);
        if cancelled.iter().any(|p| p.trial) {
            self.breakers.get(category).release_trial();
        }
        cancelled.len()
    }

    /// Cancel everything (shutdown)
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.lock_scheduler().cancel_all();
        for pending in cancelled.iter().filter(|p| p.trial) {
            self.breakers.get(pending.category).release_trial();
        }
        cancelled.len()
    }

    pub fn pending_retries(&self) -> usize {
        self.lock_scheduler().len()
    }

    pub fn next_retry_due(&self) -> Option<u64> {
        self.lock_scheduler().next_due()
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, RetryScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Feed an outcome into the breaker.
///
/// Closed: only a full recovery counts as success, anything else means the
/// category failed again. Half-open trial: only the planned strategy itself
/// succeeding closes the breaker; an outcome reached by escalating past it is
/// a failed trial, and a scheduled retry keeps the trial pending. Rejected or
/// skipped attempts are not accounted.
fn account(breaker: &CircuitBreaker, permit: Permit, status: RecoveryStatus, escalated: bool) {
    match (permit, status) {
        (Permit::Rejected | Permit::Skipped, _) => {}
        (Permit::Trial, RecoveryStatus::Scheduled) => {}
        (Permit::Trial, RecoveryStatus::Recovered | RecoveryStatus::Mitigated) if !escalated => {
            breaker.record_success()
        }
        (Permit::Trial, _) => breaker.record_failure(),
        (Permit::Granted, RecoveryStatus::Recovered) => breaker.record_success(),
        (Permit::Granted, _) => breaker.record_failure(),
    }
}

/// Run a host action, turning a panic into an ordinary failure
fn guarded<F>(action: F) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err("recovery action panicked".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::FingerprintEngine;
    use crate::clock::ManualClock;
    use crate::recovery::MockRecoveryActions;
    use crate::ResilienceError;
    use test_case::test_case;

    fn classification(category: Category, severity: Severity, hint: Strategy) -> Classification {
        let fp = FingerprintEngine::default().fingerprint(category, "test", &[]);
        Classification::new(severity, category, hint, 80, fp)
    }

    fn orchestrator(actions: MockRecoveryActions) -> (RecoveryOrchestrator, ManualClock) {
        let clock = ManualClock::new();
        let orchestrator = RecoveryOrchestrator::new(
            &ResilienceConfig::default(),
            Arc::new(actions),
            Arc::new(clock.clone()),
        );
        (orchestrator, clock)
    }

    fn idle_port() -> MockCheckpointPort {
        let mut port = MockCheckpointPort::new();
        port.expect_pre_recovery_checkpoint().returning(|_| Ok(()));
        port
    }

    #[test_case(Category::Network, Severity::Low, Strategy::RetryWithBackoff, BreakerState::Closed => Strategy::RetryWithBackoff ; "retryable network keeps its hint")]
    #[test_case(Category::Network, Severity::Low, Strategy::RetryWithBackoff, BreakerState::Open => Strategy::Fallback ; "open breaker forces fallback")]
    #[test_case(Category::Save, Severity::Medium, Strategy::Fallback, BreakerState::Open => Strategy::CheckpointRollback ; "open breaker on state-bearing category rolls back")]
    #[test_case(Category::Core, Severity::Critical, Strategy::RestartSubsystem, BreakerState::Open => Strategy::CheckpointRollback ; "open breaker with critical rolls back")]
    #[test_case(Category::Network, Severity::Critical, Strategy::RetryWithBackoff, BreakerState::Closed => Strategy::CheckpointRollback ; "critical never retries")]
    #[test_case(Category::Save, Severity::High, Strategy::ImmediateRetry, BreakerState::Closed => Strategy::CheckpointRollback ; "severe save error never retries")]
    #[test_case(Category::Ui, Severity::Low, Strategy::ImmediateRetry, BreakerState::Closed => Strategy::Fallback ; "non-retryable retry hint falls back")]
    #[test_case(Category::Ui, Severity::Info, Strategy::Ignore, BreakerState::Open => Strategy::Ignore ; "ignore stays ignore")]
    #[test_case(Category::Core, Severity::High, Strategy::RestartSubsystem, BreakerState::HalfOpen => Strategy::RestartSubsystem ; "half open trial uses hint")]
    fn test_select_strategy(category: Category, severity: Severity, hint: Strategy, state: BreakerState) -> Strategy {
        select_strategy(&classification(category, severity, hint), state)
    }

    #[test]
    fn test_open_network_breaker_short_circuits_to_fallback() {
        let mut actions = MockRecoveryActions::new();
        actions.expect_retry().never();
        actions.expect_fallback().times(2).returning(|_, _| Ok(()));
        let (orchestrator, _clock) = orchestrator(actions);
        let port = MockCheckpointPort::new();
        let c = classification(Category::Network, Severity::Low, Strategy::RetryWithBackoff);
        let event = ErrorEvent::new("timeout");

        for i in 0..3 {
            let outcome = orchestrator.recover(&c, &event, &port);
            assert_eq!(outcome.status, RecoveryStatus::Scheduled);
            let expected = if i < 2 { BreakerState::Closed } else { BreakerState::Open };
            assert_eq!(outcome.breaker_state, expected);
        }

        for _ in 0..2 {
            let outcome = orchestrator.recover(&c, &event, &port);
            assert!(outcome.short_circuited);
            assert_eq!(outcome.strategy, Strategy::Fallback);
            assert_eq!(outcome.status, RecoveryStatus::Mitigated);
        }
    }

    #[test]
    fn test_immediate_retry_recovers() {
        let mut actions = MockRecoveryActions::new();
        let mut calls = 0;
        actions.expect_retry().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(anyhow::anyhow!("still broken"))
            } else {
                Ok(())
            }
        });
        let (orchestrator, _clock) = orchestrator(actions);
        let c = classification(Category::Network, Severity::Low, Strategy::ImmediateRetry);

        let outcome = orchestrator.recover(&c, &ErrorEvent::new("x"), &MockCheckpointPort::new());
        assert_eq!(outcome.status, RecoveryStatus::Recovered);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(orchestrator.breaker(Category::Network).snapshot().failure_count, 0);
    }

    #[test]
    fn test_restart_escalates_to_rollback() {
        let mut actions = MockRecoveryActions::new();
        actions
            .expect_restart_subsystem()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("restart failed")));
        actions
            .expect_fallback()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("no fallback")));
        let (orchestrator, _clock) = orchestrator(actions);

        let mut port = idle_port();
        port.expect_rollback().times(1).returning(|_, _| Ok("cp-7".to_string()));

        let c = classification(Category::Core, Severity::High, Strategy::RestartSubsystem);
        let outcome = orchestrator.recover(&c, &ErrorEvent::new("x"), &port);

        assert_eq!(outcome.planned, Strategy::RestartSubsystem);
        assert_eq!(outcome.strategy, Strategy::CheckpointRollback);
        assert_eq!(outcome.status, RecoveryStatus::Recovered);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.detail.as_deref(), Some("restored checkpoint cp-7"));
    }

    #[test]
    fn test_critical_exhaustion_is_emergency() {
        let actions = MockRecoveryActions::new();
        let (orchestrator, _clock) = orchestrator(actions);
        let mut port = MockCheckpointPort::new();
        port.expect_rollback()
            .times(1)
            .returning(|_, _| Err(ResilienceError::RollbackExhausted { tried: 3 }));

        let c = classification(Category::Save, Severity::Critical, Strategy::CheckpointRollback);
        let outcome = orchestrator.recover(&c, &ErrorEvent::new("corrupt"), &port);

        assert_eq!(outcome.status, RecoveryStatus::Emergency);
        assert!(outcome.detail.unwrap().contains("Rollback exhausted"));
    }

    #[test]
    fn test_low_severity_fallback_failure_does_not_roll_back() {
        let mut actions = MockRecoveryActions::new();
        actions
            .expect_fallback()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("no fallback")));
        let (orchestrator, _clock) = orchestrator(actions);
        let mut port = MockCheckpointPort::new();
        port.expect_rollback().never();

        let c = classification(Category::Ui, Severity::Low, Strategy::Fallback);
        let outcome = orchestrator.recover(&c, &ErrorEvent::new("x"), &port);
        assert_eq!(outcome.status, RecoveryStatus::Failed);
    }

    #[test]
    fn test_scheduled_retry_runs_when_due() {
        let mut actions = MockRecoveryActions::new();
        actions.expect_retry().times(1).returning(|_, _| Ok(()));
        let (orchestrator, clock) = orchestrator(actions);
        let port = MockCheckpointPort::new();
        let c = classification(Category::Network, Severity::Low, Strategy::RetryWithBackoff);

        orchestrator.recover(&c, &ErrorEvent::new("timeout"), &port);
        assert_eq!(orchestrator.pending_retries(), 1);
        assert!(orchestrator.run_due_retries(&port).is_empty());

        clock.advance_ms(1_000);
        let outcomes = orchestrator.run_due_retries(&port);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, RecoveryStatus::Recovered);
        assert_eq!(orchestrator.breaker(Category::Network).snapshot().failure_count, 0);
        assert_eq!(orchestrator.pending_retries(), 0);
    }

    #[test]
    fn test_retry_exhaustion_escalates_to_fallback() {
        let mut actions = MockRecoveryActions::new();
        actions
            .expect_retry()
            .returning(|_, _| Err(anyhow::anyhow!("offline")));
        actions.expect_fallback().times(1).returning(|_, _| Ok(()));

        let clock = ManualClock::new();
        let mut config = ResilienceConfig::default();
        config.retry.max_attempts = 2;
        config.breaker.threshold = 100;
        let orchestrator = RecoveryOrchestrator::new(&config, Arc::new(actions), Arc::new(clock.clone()));
        let port = MockCheckpointPort::new();
        let c = classification(Category::Network, Severity::Low, Strategy::RetryWithBackoff);

        orchestrator.recover(&c, &ErrorEvent::new("timeout"), &port);

        let mut last = None;
        for _ in 0..5 {
            clock.advance_ms(60_000);
            last = orchestrator.run_due_retries(&port).pop().or(last);
        }

        let outcome = last.unwrap();
        assert_eq!(outcome.strategy, Strategy::Fallback);
        assert_eq!(outcome.status, RecoveryStatus::Mitigated);
        assert_eq!(orchestrator.pending_retries(), 0);
    }

    #[test]
    fn test_rollback_cancels_pending_retries_for_category() {
        let mut actions = MockRecoveryActions::new();
        actions.expect_retry().never();
        let (orchestrator, clock) = orchestrator(actions);
        let mut port = MockCheckpointPort::new();
        port.expect_rollback().times(1).returning(|_, _| Ok("cp".to_string()));

        let retry = classification(Category::Save, Severity::Low, Strategy::RetryWithBackoff).with_retryable(true);
        orchestrator.recover(&retry, &ErrorEvent::new("busy"), &port);
        assert_eq!(orchestrator.pending_retries(), 1);

        let rollback = classification(Category::Save, Severity::Medium, Strategy::CheckpointRollback);
        orchestrator.recover(&rollback, &ErrorEvent::new("bad"), &port);
        assert_eq!(orchestrator.pending_retries(), 0);

        clock.advance_ms(60_000);
        assert!(orchestrator.run_due_retries(&port).is_empty());
    }

    #[test]
    fn test_half_open_trial_via_scheduled_retry() {
        let mut actions = MockRecoveryActions::new();
        actions.expect_retry().times(1).returning(|_, _| Ok(()));
        actions.expect_fallback().returning(|_, _| Ok(()));
        let (orchestrator, clock) = orchestrator(actions);
        let port = MockCheckpointPort::new();
        let c = classification(Category::Network, Severity::Low, Strategy::RetryWithBackoff);
        let event = ErrorEvent::new("timeout");

        for _ in 0..3 {
            orchestrator.recover(&c, &event, &port);
        }
        assert_eq!(orchestrator.cancel_retries(Category::Network), 3);
        assert!(orchestrator.breaker(Category::Network).is_open());

        clock.advance_ms(30_000);
        let trial = orchestrator.recover(&c, &event, &port);
        assert_eq!(trial.status, RecoveryStatus::Scheduled);
        assert_eq!(trial.breaker_state, BreakerState::HalfOpen);

        let rejected = orchestrator.recover(&c, &event, &port);
        assert!(rejected.short_circuited);
        assert_eq!(rejected.strategy, Strategy::Fallback);

        clock.advance_ms(1_000);
        let outcomes = orchestrator.run_due_retries(&port);
        assert_eq!(outcomes[0].status, RecoveryStatus::Recovered);
        assert_eq!(outcomes[0].breaker_state, BreakerState::Closed);
    }

    #[test]
    fn test_escalated_trial_reopens_breaker() {
        let mut actions = MockRecoveryActions::new();
        actions.expect_retry().never();
        actions.expect_fallback().times(4).returning(|_, _| Ok(()));

        let clock = ManualClock::new();
        let mut config = ResilienceConfig::default();
        config.retry.max_attempts = 0;
        let orchestrator = RecoveryOrchestrator::new(&config, Arc::new(actions), Arc::new(clock.clone()));
        let port = MockCheckpointPort::new();
        let c = classification(Category::Network, Severity::Low, Strategy::RetryWithBackoff);
        let event = ErrorEvent::new("timeout");

        for _ in 0..3 {
            let outcome = orchestrator.recover(&c, &event, &port);
            assert_eq!(outcome.strategy, Strategy::Fallback);
            assert_eq!(outcome.status, RecoveryStatus::Mitigated);
        }
        let breaker = orchestrator.breaker(Category::Network);
        assert!(breaker.is_open());
        let base_timeout = breaker.snapshot().reset_timeout_ms;

        clock.advance_ms(base_timeout);
        let trial = orchestrator.recover(&c, &event, &port);

        // The fallback mitigated the error, but the retry under trial never ran
        assert_eq!(trial.planned, Strategy::RetryWithBackoff);
        assert_eq!(trial.strategy, Strategy::Fallback);
        assert_eq!(trial.status, RecoveryStatus::Mitigated);
        assert_eq!(trial.breaker_state, BreakerState::Open);
        assert!(breaker.snapshot().reset_timeout_ms > base_timeout);
    }

    #[test]
    fn test_planned_fallback_trial_closes_breaker() {
        let mut actions = MockRecoveryActions::new();
        let mut calls = 0;
        actions.expect_fallback().times(4).returning(move |_, _| {
            calls += 1;
            if calls <= 3 {
                Err(anyhow::anyhow!("overlay unavailable"))
            } else {
                Ok(())
            }
        });
        let (orchestrator, clock) = orchestrator(actions);
        let port = MockCheckpointPort::new();
        let c = classification(Category::Ui, Severity::Low, Strategy::Fallback);
        let event = ErrorEvent::new("render failed");

        for _ in 0..3 {
            assert_eq!(orchestrator.recover(&c, &event, &port).status, RecoveryStatus::Failed);
        }
        assert!(orchestrator.breaker(Category::Ui).is_open());

        clock.advance_ms(orchestrator.breaker(Category::Ui).snapshot().reset_timeout_ms);
        let trial = orchestrator.recover(&c, &event, &port);
        assert_eq!(trial.strategy, Strategy::Fallback);
        assert_eq!(trial.status, RecoveryStatus::Mitigated);
        assert_eq!(trial.breaker_state, BreakerState::Closed);
    }

    #[test]
    fn test_ignore_does_not_touch_breaker() {
        let actions = MockRecoveryActions::new();
        let (orchestrator, _clock) = orchestrator(actions);
        let c = classification(Category::Ui, Severity::Info, Strategy::Ignore);

        for _ in 0..10 {
            let outcome = orchestrator.recover(&c, &ErrorEvent::new("noise"), &MockCheckpointPort::new());
            assert_eq!(outcome.status, RecoveryStatus::Mitigated);
        }
        assert_eq!(orchestrator.breaker(Category::Ui).snapshot().failure_count, 0);
    }

    struct PanickingActions;

    impl RecoveryActions for PanickingActions {
        fn retry(&self, _event: &ErrorEvent, _attempt: u32) -> anyhow::Result<()> {
            panic!("host bug")
        }

        fn fallback(&self, _category: Category, _event: &ErrorEvent) -> anyhow::Result<()> {
            panic!("host bug")
        }

        fn restart_subsystem(&self, _category: Category) -> anyhow::Result<()> {
            panic!("host bug")
        }
    }

    #[test]
    fn test_panicking_action_is_contained() {
        let orchestrator = RecoveryOrchestrator::new(
            &ResilienceConfig::default(),
            Arc::new(PanickingActions),
            Arc::new(ManualClock::new()),
        );

        let c = classification(Category::Ui, Severity::Medium, Strategy::Fallback);
        let outcome = orchestrator.recover(&c, &ErrorEvent::new("x"), &MockCheckpointPort::new());
        assert_eq!(outcome.status, RecoveryStatus::Failed);
        assert!(outcome.detail.unwrap().contains("panicked"));
    }
}
