/// Shared fixtures for integration tests
use super::fakes::*;
use resilience_engine::checkpoint::MemoryCheckpointStore;
use resilience_engine::{
    CheckpointPriority, CheckpointStore, ControllerBuilder, ErrorEvent, ErrorResilienceController,
    ManualClock, ResilienceConfig, TriggerType,
};
use std::sync::Arc;

/// A controller wired to recording fakes and a manual clock
#[allow(dead_code)]
pub struct Harness {
    pub controller: ErrorResilienceController,
    pub state: Arc<RecordingState>,
    pub actions: Arc<CountingActions>,
    pub notifications: Arc<RecordingNotifications>,
    pub metrics: Arc<RecordingMetrics>,
    pub emergency: Arc<RecordingEmergency>,
    pub store: Arc<MemoryCheckpointStore>,
    pub clock: ManualClock,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(state_json: &str) -> Self {
        Self::with(ResilienceConfig::default(), CountingActions::default(), state_json)
    }

    pub fn with(config: ResilienceConfig, actions: CountingActions, state_json: &str) -> Self {
        let state = Arc::new(RecordingState::new(state_json));
        let actions = Arc::new(actions);
        let notifications = Arc::new(RecordingNotifications::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let emergency = Arc::new(RecordingEmergency::default());
        let store = Arc::new(MemoryCheckpointStore::new(config.checkpoint.store_capacity));
        let clock = ManualClock::new();

        let controller = ControllerBuilder::new(state.clone())
            .config(config)
            .recovery_actions(actions.clone())
            .notifications(notifications.clone())
            .metrics(metrics.clone())
            .emergency_handler(emergency.clone())
            .store(store.clone() as Arc<dyn CheckpointStore>)
            .clock(Arc::new(clock.clone()))
            .build()
            .expect("controller builds");

        Self {
            controller,
            state,
            actions,
            notifications,
            metrics,
            emergency,
            store,
            clock,
        }
    }

    /// Set the state and checkpoint it, stepping past the throttle window
    pub fn checkpoint(&self, json: &str) -> String {
        self.state.set(json);
        let summary = self
            .controller
            .create_checkpoint(TriggerType::Manual, CheckpointPriority::Normal)
            .expect("checkpoint created");
        self.clock
            .advance_ms(self.controller.config().checkpoint.min_interval_ms);
        summary.id
    }
}

#[allow(dead_code)]
pub fn network_offline() -> ErrorEvent {
    ErrorEvent::new("TypeError: Failed to fetch")
        .with_stack("at fetchLeaderboard (api.js:42:11)")
        .in_subsystem("network")
}

#[allow(dead_code)]
pub fn save_quota() -> ErrorEvent {
    ErrorEvent::new("QuotaExceededError: Failed to execute 'setItem' on 'Storage'")
        .with_stack("at SaveManager.persist (save.js:88:9)")
        .with_context("operation", "save")
}

#[allow(dead_code)]
pub fn stack_overflow() -> ErrorEvent {
    ErrorEvent::new("RangeError: Maximum call stack size exceeded")
        .with_stack("at GameLoop.tick (engine.js:10:3)")
}
