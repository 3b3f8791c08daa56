/// Hand-written fakes for the host-facing traits
///
/// Integration tests cannot see the `mockall` mocks generated inside the
/// library, so these record calls and let each test flip outcomes.
use anyhow::{anyhow, Result};
use resilience_engine::sinks::{EmergencySignal, MetricEvent};
use resilience_engine::{
    Category, EmergencyHandler, ErrorEvent, MetricsSink, NotificationSink, RecoveryActions, Severity,
    StateSnapshotProvider,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// Application state held as a JSON string
#[derive(Debug)]
pub struct RecordingState {
    current: Mutex<String>,
    restores: AtomicU32,
    /// Restores of snapshots containing this text fail
    poison: Mutex<Option<String>>,
    serialize_fails: AtomicBool,
}

#[allow(dead_code)]
impl RecordingState {
    pub fn new(json: &str) -> Self {
        Self {
            current: Mutex::new(json.to_string()),
            restores: AtomicU32::new(0),
            poison: Mutex::new(None),
            serialize_fails: AtomicBool::new(false),
        }
    }

    pub fn set(&self, json: &str) {
        *self.current.lock().unwrap() = json.to_string();
    }

    pub fn get(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    pub fn value(&self) -> serde_json::Value {
        serde_json::from_str(&self.get()).unwrap()
    }

    pub fn restores(&self) -> u32 {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn fail_restores_containing(&self, marker: &str) {
        *self.poison.lock().unwrap() = Some(marker.to_string());
    }

    pub fn fail_serialize(&self, fail: bool) {
        self.serialize_fails.store(fail, Ordering::SeqCst);
    }
}

impl StateSnapshotProvider for RecordingState {
    fn serialize(&self) -> Result<Vec<u8>> {
        if self.serialize_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("state is locked by the save system"));
        }
        Ok(self.get().into_bytes())
    }

    fn restore(&self, snapshot: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(snapshot)?;
        if let Some(marker) = self.poison.lock().unwrap().as_deref() {
            if text.contains(marker) {
                return Err(anyhow!("refusing to apply snapshot containing {}", marker));
            }
        }
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.set(text);
        Ok(())
    }
}

/// Recovery actions that succeed or fail on demand
#[derive(Debug, Default)]
pub struct CountingActions {
    pub retries: AtomicU32,
    pub fallbacks: AtomicU32,
    pub restarts: AtomicU32,
    pub retry_fails: AtomicBool,
    pub fallback_fails: AtomicBool,
    pub restart_fails: AtomicBool,
}

#[allow(dead_code)]
impl CountingActions {
    pub fn failing_retries() -> Self {
        let actions = Self::default();
        actions.retry_fails.store(true, Ordering::SeqCst);
        actions
    }

    pub fn failing_everything() -> Self {
        let actions = Self::failing_retries();
        actions.fallback_fails.store(true, Ordering::SeqCst);
        actions.restart_fails.store(true, Ordering::SeqCst);
        actions
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn fallbacks(&self) -> u32 {
        self.fallbacks.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

fn outcome(fails: &AtomicBool, what: &str) -> Result<()> {
    if fails.load(Ordering::SeqCst) {
        Err(anyhow!("{} failed", what))
    } else {
        Ok(())
    }
}

impl RecoveryActions for CountingActions {
    fn retry(&self, _event: &ErrorEvent, _attempt: u32) -> Result<()> {
        self.retries.fetch_add(1, Ordering::SeqCst);
        outcome(&self.retry_fails, "retry")
    }

    fn fallback(&self, _category: Category, _event: &ErrorEvent) -> Result<()> {
        self.fallbacks.fetch_add(1, Ordering::SeqCst);
        outcome(&self.fallback_fails, "fallback")
    }

    fn restart_subsystem(&self, _category: Category) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        outcome(&self.restart_fails, "restart")
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifications {
    pub sent: Mutex<Vec<(String, Severity)>>,
}

#[allow(dead_code)]
impl RecordingNotifications {
    pub fn sent(&self) -> Vec<(String, Severity)> {
        self.sent.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingNotifications {
    fn notify(&self, message: &str, severity: Severity) {
        self.sent.lock().unwrap().push((message.to_string(), severity));
    }
}

#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub events: Mutex<Vec<MetricEvent>>,
}

#[allow(dead_code)]
impl RecordingMetrics {
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, event: &MetricEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Debug, Default)]
pub struct RecordingEmergency {
    pub signals: Mutex<Vec<EmergencySignal>>,
}

#[allow(dead_code)]
impl RecordingEmergency {
    pub fn signals(&self) -> Vec<EmergencySignal> {
        self.signals.lock().unwrap().clone()
    }
}

impl EmergencyHandler for RecordingEmergency {
    fn enter_emergency(&self, signal: &EmergencySignal) {
        self.signals.lock().unwrap().push(signal.clone());
    }
}
