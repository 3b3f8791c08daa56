/// The façade host applications talk to
///
/// ```text
/// report_error(event)
///     │
///     ├─ depth > limit? ──→ EMERGENCY (classification bypassed)
///     │
///     ↓
/// ErrorClassifier::classify ──→ CLASSIFIED
///     ↓
/// RecoveryOrchestrator::plan ──→ STRATEGY_SELECTED
///     ↓
/// RecoveryOrchestrator::execute ←──→ CheckpointManager (rollback, pre-recovery)
///     ↓
/// outcome ──→ classifier learning, metrics, notification,
///             RECOVERY_SUCCESS | RECOVERY_FAILED | EMERGENCY
/// ```
///
/// `report_error` never panics and never returns an error. Anything that goes
/// wrong while handling an error is itself reported one level deeper; past
/// `max_handling_depth` the engine stops classifying and raises the terminal
/// emergency signal instead.
pub mod diagnostics;
pub mod events;

pub use diagnostics::{Diagnostics, DiagnosticsLog, ErrorRecord};
pub use events::{EventBus, LifecycleEvent, LifecycleKind, SubscriptionId};

use crate::checkpoint::{
    CheckpointManager, CheckpointPriority, CheckpointStore, CheckpointSummary, CheckpointTicket,
    FileCheckpointStore, MemoryCheckpointStore, RollbackReport, RollbackTarget, StateSnapshotProvider,
    TriggerType,
};
use crate::classification::{Classification, ErrorClassifier, FingerprintId};
use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::event::ErrorEvent;
use crate::recovery::{
    CheckpointPort, NoopRecoveryActions, RecoveryActions, RecoveryOrchestrator, RecoveryOutcome,
    RecoveryStatus,
};
use crate::sinks::{
    user_message, ClassifiedEvent, EmergencyHandler, EmergencySignal, LoggingEmergencyHandler,
    MetricEvent, MetricsSink, NoopNotifications, NotificationSink, TracingMetrics,
};
use crate::taxonomy::{Category, Severity, Strategy};
use crate::{ResilienceError, ResilienceResult};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Outcome of `rollback_to_checkpoint`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackResult {
    Restored(RollbackReport),
    /// Another rollback was in flight; nothing was done
    Busy,
    /// No candidate checkpoint could be restored; state is unchanged
    Exhausted { tried: usize },
    Failed { error: String },
}

impl RollbackResult {
    pub fn is_restored(&self) -> bool {
        matches!(self, RollbackResult::Restored(_))
    }

    fn from_result(result: ResilienceResult<RollbackReport>) -> Self {
        match result {
            Ok(report) => RollbackResult::Restored(report),
            Err(ResilienceError::Busy) => RollbackResult::Busy,
            Err(ResilienceError::RollbackExhausted { tried }) => RollbackResult::Exhausted { tried },
            Err(e) => RollbackResult::Failed { error: e.to_string() },
        }
    }
}

/// Work done by one `run_idle` pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdleReport {
    pub retries_run: usize,
    pub retries_recovered: usize,
    pub checkpoints_created: usize,
    pub checkpoints_failed: usize,
}

/// Per-thread count of error reports currently being handled
#[derive(Debug, Default)]
struct Nesting {
    depths: Mutex<HashMap<ThreadId, u32>>,
}

impl Nesting {
    fn current(&self) -> u32 {
        self.depths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread::current().id())
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self) -> NestingGuard<'_> {
        let id = thread::current().id();
        *self
            .depths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(0) += 1;
        NestingGuard { nesting: self, id }
    }
}

struct NestingGuard<'a> {
    nesting: &'a Nesting,
    id: ThreadId,
}

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        let mut depths = self.nesting.depths.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(depth) = depths.get_mut(&self.id) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                depths.remove(&self.id);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    reported: AtomicU64,
    emergencies: AtomicU64,
    handling_panics: AtomicU64,
    dropped: AtomicU64,
}

/// Wires classifier, orchestrator and checkpoint manager together
pub struct ErrorResilienceController {
    config: ResilienceConfig,
    classifier: ErrorClassifier,
    orchestrator: RecoveryOrchestrator,
    checkpoints: CheckpointManager,
    events: EventBus,
    diagnostics: DiagnosticsLog,
    notifications: Arc<dyn NotificationSink>,
    metrics: Arc<dyn MetricsSink>,
    emergency: Arc<dyn EmergencyHandler>,
    clock: Arc<dyn Clock>,
    nesting: Nesting,
    counters: Counters,
    shut_down: AtomicBool,
}

impl ErrorResilienceController {
    /// Report a failure. Never panics, never fails.
    ///
    /// Reports made while another report is being handled on the same thread
    /// (from a subscriber, a sink or a recovery action) count as nested.
    pub fn report_error(&self, event: ErrorEvent) {
        let depth = self.nesting.current();
        self.report_error_at_depth(event, depth);
    }

    /// Report a failure raised while handling another one, `depth` levels deep
    pub fn report_error_at_depth(&self, event: ErrorEvent, depth: u32) {
        if self.shut_down.load(Ordering::Acquire) {
            tracing::debug!("Error reported after shutdown, ignoring");
            return;
        }

        self.counters.reported.fetch_add(1, Ordering::Relaxed);
        let depth = depth.max(self.nesting.current());
        let limit = self.config.controller.max_handling_depth;

        if depth > limit.saturating_add(1) {
            // The emergency signal for this chain has already been raised
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(depth, "Dropping error nested below the emergency level");
            return;
        }

        let _nested = self.nesting.enter();

        if depth > limit {
            self.bypass(&event, depth, limit);
            return;
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.handle(&event, depth))) {
            let detail = panic_message(payload.as_ref());
            self.counters.handling_panics.fetch_add(1, Ordering::Relaxed);
            tracing::error!(depth, detail = %detail, "Error handling panicked");

            self.diagnostics.push(ErrorRecord::new(
                self.clock.wall(),
                event.message_text(),
                event.stack_text(),
                depth,
            ));
            self.report_error_at_depth(
                ErrorEvent::new(format!("Error handler panicked: {}", detail))
                    .in_subsystem("core")
                    .with_context("handler_panic", true),
                depth + 1,
            );
        }
    }

    fn handle(&self, event: &ErrorEvent, depth: u32) {
        let classification = self.classifier.classify(event);
        let mut record = ErrorRecord::new(self.clock.wall(), event.message_text(), event.stack_text(), depth);
        record.classification = Some(classification.clone());

        tracing::debug!(
            fingerprint = %classification.fingerprint(),
            category = %classification.category(),
            severity = %classification.severity(),
            confidence = classification.confidence(),
            depth,
            "Error classified"
        );

        self.record_metric(MetricEvent::Classified(ClassifiedEvent {
            fingerprint: classification.fingerprint(),
            category: classification.category(),
            severity: classification.severity(),
            confidence: classification.confidence(),
            unstable: classification.is_unstable(),
            rule_short_circuit: classification.matched_rule().is_some()
                && classification.matched_patterns().is_empty(),
        }));
        self.events.emit(LifecycleEvent::Classified(classification.clone()));

        let plan = self.orchestrator.plan(&classification);
        self.events.emit(LifecycleEvent::StrategySelected {
            fingerprint: classification.fingerprint(),
            category: classification.category(),
            strategy: plan.strategy,
            short_circuited: plan.short_circuited,
        });

        let port = ControllerPort { controller: self };
        let outcome = self.orchestrator.execute(&plan, &classification, event, &port);

        self.settle(&outcome, depth);
        self.notify(&classification, plan.strategy);

        record.outcome = Some(outcome);
        self.diagnostics.push(record);
    }

    /// Feed an outcome to learning, metrics, subscribers and, if terminal,
    /// the emergency handler
    fn settle(&self, outcome: &RecoveryOutcome, depth: u32) {
        if outcome.status != RecoveryStatus::Scheduled && outcome.strategy != Strategy::Ignore {
            self.classifier
                .record_outcome(outcome.fingerprint, outcome.strategy, outcome.status.is_success());
        }

        self.record_metric(MetricEvent::Recovery(outcome.clone()));

        match outcome.status {
            RecoveryStatus::Scheduled => {}
            _ if outcome.strategy == Strategy::Ignore => {}
            status if status.is_success() => {
                self.events.emit(LifecycleEvent::RecoverySuccess(outcome.clone()));
            }
            _ => self.events.emit(LifecycleEvent::RecoveryFailed(outcome.clone())),
        }

        if outcome.status == RecoveryStatus::Emergency {
            self.raise_emergency(EmergencySignal {
                reason: format!(
                    "every recovery strategy failed for a critical {} error",
                    outcome.category
                ),
                category: Some(outcome.category),
                fingerprint: Some(outcome.fingerprint),
                depth,
                timestamp: self.clock.wall(),
            });
        }
    }

    fn notify(&self, classification: &Classification, strategy: Strategy) {
        let severity = classification.severity();
        if strategy == Strategy::Ignore
            || classification.is_malformed()
            || severity.rank() < self.config.controller.notify_min_severity.rank()
        {
            return;
        }

        let message = user_message(classification.category(), severity);
        let sink = &self.notifications;
        if panic::catch_unwind(AssertUnwindSafe(|| sink.notify(message, severity))).is_err() {
            tracing::warn!("Notification sink panicked");
        }
    }

    fn bypass(&self, event: &ErrorEvent, depth: u32, limit: u32) {
        tracing::error!(
            depth,
            limit,
            message = event.message_text().unwrap_or("<none>"),
            "Error handling nested too deeply, bypassing classification"
        );
        self.diagnostics.push(ErrorRecord::new(
            self.clock.wall(),
            event.message_text(),
            event.stack_text(),
            depth,
        ));
        self.raise_emergency(EmergencySignal {
            reason: format!("error handling nested {} levels deep (limit {})", depth, limit),
            category: None,
            fingerprint: None,
            depth,
            timestamp: self.clock.wall(),
        });
    }

    fn raise_emergency(&self, signal: EmergencySignal) {
        self.counters.emergencies.fetch_add(1, Ordering::Relaxed);
        let handler = &self.emergency;
        if panic::catch_unwind(AssertUnwindSafe(|| handler.enter_emergency(&signal))).is_err() {
            tracing::error!("Emergency handler panicked");
        }
        self.events.emit(LifecycleEvent::Emergency(signal));
    }

    fn record_metric(&self, event: MetricEvent) {
        let metrics = &self.metrics;
        if panic::catch_unwind(AssertUnwindSafe(|| metrics.record(&event))).is_err() {
            tracing::warn!("Metrics sink panicked");
        }
    }

    /// Take a checkpoint now
    pub fn create_checkpoint(
        &self,
        trigger: TriggerType,
        priority: CheckpointPriority,
    ) -> ResilienceResult<CheckpointSummary> {
        let checkpoint = self.checkpoints.create(trigger, priority)?;
        let summary = self
            .checkpoints
            .get(&checkpoint.id)
            .unwrap_or_else(|| checkpoint.summary(crate::checkpoint::CheckpointStatus::Valid, 0));
        self.events.emit(LifecycleEvent::CheckpointCreated(summary.clone()));
        Ok(summary)
    }

    /// Queue a checkpoint for the next `run_idle`
    pub fn request_checkpoint(&self, trigger: TriggerType, priority: CheckpointPriority) -> CheckpointTicket {
        self.checkpoints.request_checkpoint(trigger, priority)
    }

    /// Restore a checkpoint, emitting ROLLBACK_STARTED and ROLLBACK_COMPLETE
    pub fn rollback_to_checkpoint(&self, target: RollbackTarget, reason: &str) -> RollbackResult {
        RollbackResult::from_result(self.run_rollback(target, reason))
    }

    fn run_rollback(&self, target: RollbackTarget, reason: &str) -> ResilienceResult<RollbackReport> {
        if self.checkpoints.is_rolling_back() {
            tracing::warn!(rollback_target = %target, "Rollback rejected, another is in progress");
            return Err(ResilienceError::Busy);
        }

        self.events.emit(LifecycleEvent::RollbackStarted {
            target: target.clone(),
            reason: reason.to_string(),
        });
        let result = self.checkpoints.rollback(target, reason);
        self.events
            .emit(LifecycleEvent::RollbackComplete(RollbackResult::from_result(result.clone())));
        result
    }

    /// Put back the state captured before the most recent rollback
    pub fn undo_last_rollback(&self) -> ResilienceResult<()> {
        self.checkpoints.undo_last_rollback()
    }

    /// Manually confirm what a fingerprint is, feeding pattern promotion.
    /// Returns whether a learned pattern was published.
    pub fn confirm_classification(
        &self,
        fingerprint: FingerprintId,
        category: Category,
        severity: Severity,
        strategy: Strategy,
    ) -> bool {
        self.classifier.confirm(fingerprint, category, severity, strategy)
    }

    /// Run due retry timers and deferred checkpoints
    pub fn run_idle(&self) -> IdleReport {
        if self.shut_down.load(Ordering::Acquire) {
            return IdleReport::default();
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.idle_pass())) {
            Ok(report) => report,
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                self.counters.handling_panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!(detail = %detail, "Idle pass panicked");
                IdleReport::default()
            }
        }
    }

    fn idle_pass(&self) -> IdleReport {
        let mut report = IdleReport::default();

        let port = ControllerPort { controller: self };
        for outcome in self.orchestrator.run_due_retries(&port) {
            report.retries_run += 1;
            if outcome.status.is_success() {
                report.retries_recovered += 1;
            }
            self.settle(&outcome, 0);
        }

        for result in self.checkpoints.run_pending() {
            match result {
                Ok(summary) => {
                    report.checkpoints_created += 1;
                    self.events.emit(LifecycleEvent::CheckpointCreated(summary));
                }
                Err(e) => {
                    report.checkpoints_failed += 1;
                    tracing::debug!(error = %e, "Deferred checkpoint not created");
                }
            }
        }

        if report != IdleReport::default() {
            tracing::debug!(
                retries = report.retries_run,
                recovered = report.retries_recovered,
                checkpoints = report.checkpoints_created,
                "Idle pass complete"
            );
        }
        report
    }

    /// Drive `run_idle` from a tokio interval until shutdown or drop
    pub fn spawn_idle_driver(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                if controller.is_shut_down() {
                    break;
                }
                controller.run_idle();
            }
            tracing::debug!("Idle driver stopped");
        })
    }

    /// Subscribe to one lifecycle event kind
    pub fn subscribe<F>(&self, kind: LifecycleKind, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Async stream of lifecycle events
    pub fn watch(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.events.watch()
    }

    pub fn export_diagnostics(&self) -> Diagnostics {
        Diagnostics {
            generated_at: self.clock.wall(),
            breaker_states: self.orchestrator.breakers().snapshots(),
            classification_stats: self.classifier.stats(),
            checkpoint_stats: self.checkpoints.stats(),
            pending_retries: self.orchestrator.pending_retries(),
            next_retry_due_ms: self.orchestrator.next_retry_due(),
            total_reported: self.counters.reported.load(Ordering::Relaxed),
            emergencies: self.counters.emergencies.load(Ordering::Relaxed),
            subscriber_panics: self.events.handler_panics(),
            handling_panics: self.counters.handling_panics.load(Ordering::Relaxed),
            shut_down: self.is_shut_down(),
            recent_errors: self.diagnostics.recent(),
        }
    }

    /// Cancel timers and deferred work; later reports are ignored
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let retries = self.orchestrator.cancel_all();
        let checkpoints = self.checkpoints.cancel_pending();
        tracing::info!(
            cancelled_retries = retries,
            cancelled_checkpoints = checkpoints,
            "Error resilience controller shut down"
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn orchestrator(&self) -> &RecoveryOrchestrator {
        &self.orchestrator
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }
}

/// Checkpoint operations offered to the orchestrator
struct ControllerPort<'a> {
    controller: &'a ErrorResilienceController,
}

impl CheckpointPort for ControllerPort<'_> {
    fn rollback(&self, category: Category, reason: &str) -> ResilienceResult<String> {
        let reason = format!("{} recovery: {}", category, reason);
        self.controller
            .run_rollback(RollbackTarget::Progressive, &reason)
            .map(|report| report.checkpoint_id)
    }

    fn pre_recovery_checkpoint(&self, _category: Category) -> ResilienceResult<()> {
        if !self.controller.config.checkpoint.pre_recovery_checkpoints {
            return Ok(());
        }
        self.controller
            .create_checkpoint(TriggerType::PreRecovery, CheckpointPriority::High)
            .map(|_| ())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Assembles an `ErrorResilienceController`
pub struct ControllerBuilder {
    provider: Arc<dyn StateSnapshotProvider>,
    config: ResilienceConfig,
    notifications: Option<Arc<dyn NotificationSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    emergency: Option<Arc<dyn EmergencyHandler>>,
    actions: Option<Arc<dyn RecoveryActions>>,
    store: Option<Arc<dyn CheckpointStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ControllerBuilder {
    pub fn new(provider: Arc<dyn StateSnapshotProvider>) -> Self {
        Self {
            provider,
            config: ResilienceConfig::default(),
            notifications: None,
            metrics: None,
            emergency: None,
            actions: None,
            store: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn emergency_handler(mut self, handler: Arc<dyn EmergencyHandler>) -> Self {
        self.emergency = Some(handler);
        self
    }

    pub fn recovery_actions(mut self, actions: Arc<dyn RecoveryActions>) -> Self {
        self.actions = Some(actions);
        self
    }

    /// Use this store instead of the one `checkpoint.directory` selects
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> ResilienceResult<ErrorResilienceController> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(TracingMetrics));
        let store: Arc<dyn CheckpointStore> = match (self.store, &config.checkpoint.directory) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileCheckpointStore::open(dir, config.checkpoint.store_capacity)?),
            (None, None) => Arc::new(MemoryCheckpointStore::new(config.checkpoint.store_capacity)),
        };

        let checkpoints = CheckpointManager::new(
            config.checkpoint.clone(),
            self.provider,
            store,
            Arc::clone(&clock),
        )?
        .with_metrics(Arc::clone(&metrics));

        let orchestrator = RecoveryOrchestrator::new(
            &config,
            self.actions.unwrap_or_else(|| Arc::new(NoopRecoveryActions)),
            Arc::clone(&clock),
        );

        tracing::info!(
            breaker_threshold = config.breaker.threshold,
            max_handling_depth = config.controller.max_handling_depth,
            checkpoints = checkpoints.list().len(),
            "Error resilience controller ready"
        );

        Ok(ErrorResilienceController {
            classifier: ErrorClassifier::new(config.classifier.clone()),
            orchestrator,
            checkpoints,
            events: EventBus::default(),
            diagnostics: DiagnosticsLog::new(config.controller.diagnostics_capacity),
            notifications: self.notifications.unwrap_or_else(|| Arc::new(NoopNotifications)),
            metrics,
            emergency: self.emergency.unwrap_or_else(|| Arc::new(LoggingEmergencyHandler)),
            clock,
            nesting: Nesting::default(),
            counters: Counters::default(),
            shut_down: AtomicBool::new(false),
            config,
        })
    }
}
