/// Integration tests for the controller façade
///
/// Tests the reporting pipeline end to end including:
/// - Malformed and hostile events
/// - Re-entrant reports and the handling-depth emergency
/// - Subscriber isolation
/// - Diagnostics export, metrics and notifications
/// - Learned pattern promotion through confirmation
/// - Shutdown and the async event stream
mod common;

use common::fakes::CountingActions;
use common::test_helpers::*;
use resilience_engine::sinks::MetricEvent;
use resilience_engine::{
    Category, ErrorEvent, ErrorResilienceController, LifecycleKind, ResilienceConfig, Severity, Strategy,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[test]
fn test_malformed_events_never_fail() {
    let harness = Harness::new(r#"{"v": 1}"#);

    harness.controller.report_error(ErrorEvent::empty());
    harness.controller.report_error(ErrorEvent::new(""));
    harness
        .controller
        .report_error(ErrorEvent::default().with_context("garbage", serde_json::json!([null, {}, 1e308])));

    let diagnostics = harness.controller.export_diagnostics();
    assert_eq!(diagnostics.total_reported, 3);
    assert_eq!(diagnostics.classification_stats.malformed, 3);
    for record in &diagnostics.recent_errors {
        let classification = record.classification.as_ref().unwrap();
        assert!(classification.is_malformed());
        assert_eq!(classification.category(), Category::Unknown);
        assert_eq!(classification.strategy_hint(), Strategy::Ignore);
    }
    assert!(harness.notifications.sent().is_empty());
}

#[test]
fn test_huge_messages_are_handled() {
    let harness = Harness::new(r#"{"v": 1}"#);
    let message = format!("TypeError: Failed to fetch {}", "x".repeat(200_000));
    let stack = "at fetchData (api.js:1:1)\n".repeat(5_000);

    harness
        .controller
        .report_error(ErrorEvent::new(message).with_stack(stack));

    let diagnostics = harness.controller.export_diagnostics();
    let record = &diagnostics.recent_errors[0];
    assert_eq!(record.classification.as_ref().unwrap().category(), Category::Network);
    assert!(record.message.as_ref().unwrap().len() < 4096);
}

#[test]
fn test_recursive_reports_end_in_single_emergency() {
    let harness = Harness::new(r#"{"v": 1}"#);
    let limit = harness.controller.config().controller.max_handling_depth;

    for depth in 0..=limit + 3 {
        harness
            .controller
            .report_error_at_depth(ErrorEvent::new("handler failed"), depth);
    }

    // Depth limit + 1 bypasses, deeper reports are dropped
    let signals = harness.emergency.signals();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].depth, limit + 1);
    assert!(signals[0].category.is_none());
    assert_eq!(
        harness.controller.export_diagnostics().classification_stats.total,
        u64::from(limit) + 1
    );
}

#[test]
fn test_subscriber_reporting_errors_is_bounded() {
    let harness = Harness::new(r#"{"v": 1}"#);
    let controller = Arc::new(harness.controller);
    let weak = Arc::downgrade(&controller);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    controller.subscribe(LifecycleKind::StrategySelected, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(controller) = weak.upgrade() {
            controller.report_error(ErrorEvent::new("overlay crashed while showing the error"));
        }
    });

    controller.report_error(ErrorEvent::new("Cannot read properties of undefined"));

    let limit = controller.config().controller.max_handling_depth;
    assert_eq!(calls.load(Ordering::SeqCst), limit + 1);
    assert_eq!(harness.emergency.signals().len(), 1);
}

#[test]
fn test_panicking_subscriber_does_not_break_reporting() {
    let harness = Harness::new(r#"{"v": 1}"#);
    let delivered = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&delivered);

    harness
        .controller
        .subscribe(LifecycleKind::Classified, |_| panic!("subscriber bug"));
    harness.controller.subscribe(LifecycleKind::Classified, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    harness.controller.report_error(network_offline());
    harness.controller.report_error(network_offline());

    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    let diagnostics = harness.controller.export_diagnostics();
    assert_eq!(diagnostics.subscriber_panics, 2);
    assert_eq!(diagnostics.total_reported, 2);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let harness = Harness::new(r#"{"v": 1}"#);
    let delivered = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&delivered);
    let id = harness.controller.subscribe_all(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    harness.controller.report_error(ErrorEvent::new("first"));
    let after_first = delivered.load(Ordering::SeqCst);
    assert!(after_first > 0);

    assert!(harness.controller.unsubscribe(id));
    harness.controller.report_error(ErrorEvent::new("second"));
    assert_eq!(delivered.load(Ordering::SeqCst), after_first);
}

#[test]
fn test_metrics_see_every_classification_and_outcome() {
    let harness = Harness::new(r#"{"v": 1}"#);

    harness.controller.report_error(network_offline());
    harness.controller.report_error(ErrorEvent::new("ResizeObserver loop limit exceeded"));

    let events = harness.metrics.events();
    let classified = events
        .iter()
        .filter(|e| matches!(e, MetricEvent::Classified(_)))
        .count();
    let recoveries = events
        .iter()
        .filter(|e| matches!(e, MetricEvent::Recovery(_)))
        .count();
    assert_eq!(classified, 2);
    assert_eq!(recoveries, 2);

    // The rule for the ResizeObserver noise is decisive on its own
    assert!(events.iter().any(|e| matches!(
        e,
        MetricEvent::Classified(c) if c.category == Category::Ui && c.rule_short_circuit
    )));
}

#[test]
fn test_notifications_are_sanitized_and_filtered() {
    let mut config = ResilienceConfig::default();
    config.controller.notify_min_severity = Severity::High;
    let harness = Harness::with(config, CountingActions::default(), r#"{"v": 1}"#);

    harness.controller.report_error(network_offline());
    harness.controller.report_error(save_quota());

    let sent = harness.notifications.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, Severity::High);
    assert!(!sent[0].0.contains("setItem"));
    assert!(!sent[0].0.contains(".js"));
}

#[test]
fn test_confirmed_unknown_error_becomes_learned_pattern() {
    let harness = Harness::new(r#"{"v": 1}"#);
    let event = || {
        ErrorEvent::new("Quest reward table missing entry 42").with_stack("at QuestBoard.claim (quests.js:5:1)")
    };

    for _ in 0..3 {
        harness.controller.report_error(event());
    }
    let diagnostics = harness.controller.export_diagnostics();
    let first = diagnostics.recent_errors[0].classification.clone().unwrap();
    assert_eq!(first.category(), Category::Unknown);

    let published = harness.controller.confirm_classification(
        first.fingerprint(),
        Category::Progression,
        Severity::High,
        Strategy::CheckpointRollback,
    );
    assert!(published);

    harness.controller.report_error(event());
    let diagnostics = harness.controller.export_diagnostics();
    let latest = diagnostics.recent_errors.last().unwrap().classification.clone().unwrap();
    assert_eq!(latest.category(), Category::Progression);
    assert_eq!(diagnostics.classification_stats.learned_patterns, 1);
}

#[test]
fn test_diagnostics_export_is_json() {
    let harness = Harness::new(r#"{"v": 1}"#);
    harness.checkpoint(r#"{"v": 1}"#);
    harness.controller.report_error(network_offline());

    let value = serde_json::to_value(harness.controller.export_diagnostics()).unwrap();
    assert_eq!(value["totalReported"], 1);
    assert_eq!(value["breakerStates"].as_array().unwrap().len(), Category::ALL.len());
    assert_eq!(value["checkpointStats"]["total"], 1);
    assert_eq!(value["pendingRetries"], 1);
}

#[test]
fn test_shutdown_cancels_retries_and_ignores_reports() {
    let harness = Harness::new(r#"{"v": 1}"#);
    harness.controller.report_error(network_offline());
    assert_eq!(harness.controller.orchestrator().pending_retries(), 1);

    harness.controller.shutdown();
    harness.controller.report_error(network_offline());

    let diagnostics = harness.controller.export_diagnostics();
    assert!(diagnostics.shut_down);
    assert_eq!(diagnostics.pending_retries, 0);
    assert_eq!(diagnostics.total_reported, 1);
    assert_eq!(harness.controller.run_idle(), Default::default());
}

#[tokio::test]
async fn test_watch_streams_lifecycle_events() {
    let harness = Harness::new(r#"{"v": 1}"#);
    let mut events = harness.controller.watch();

    harness.controller.report_error(ErrorEvent::new("ResizeObserver loop limit exceeded"));

    assert_eq!(events.recv().await.unwrap().kind(), LifecycleKind::Classified);
    assert_eq!(events.recv().await.unwrap().kind(), LifecycleKind::StrategySelected);
}

fn _assert_controller_is_shareable() {
    fn shareable<T: Send + Sync>() {}
    shareable::<ErrorResilienceController>();
}
