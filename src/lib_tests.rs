// Tests for lib.rs core types and re-exports
//
// Tests cover: ResilienceError display and conversions, taxonomy enums (all
// variants), serialization shapes shared with hosts, and default configuration.

use super::*;

// ==================== ERROR TYPE TESTS ====================

#[test]
fn test_error_display_messages() {
    assert_eq!(
        ResilienceError::ValidationFailed(vec!["a".into(), "b".into()]).to_string(),
        "Snapshot validation failed: a; b"
    );
    assert_eq!(
        ResilienceError::RollbackExhausted { tried: 3 }.to_string(),
        "Rollback exhausted: no valid checkpoint among 3 candidates"
    );
    assert_eq!(
        ResilienceError::Throttled { remaining_ms: 1500 }.to_string(),
        "Checkpoint creation throttled, next allowed in 1500ms"
    );
    assert_eq!(
        ResilienceError::ChecksumMismatch { id: "cp-1".into() }.to_string(),
        "Checksum mismatch for checkpoint cp-1"
    );
    assert_eq!(ResilienceError::Busy.to_string(), "Another rollback is already in progress");
}

#[test]
fn test_error_from_anyhow_keeps_context_chain() {
    let err = anyhow::anyhow!("disk gone").context("writing snapshot");
    match ResilienceError::from(err) {
        ResilienceError::Internal(message) => {
            assert!(message.contains("writing snapshot"));
            assert!(message.contains("disk gone"));
        }
        other => panic!("unexpected variant: {:?}", other),
    }
}

#[test]
fn test_error_from_io_is_store_error() {
    let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    assert!(matches!(ResilienceError::from(err), ResilienceError::Store(_)));
}

#[test]
fn test_error_from_serde_json() {
    let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let converted = ResilienceError::from(err);
    assert!(matches!(converted, ResilienceError::Store(ref m) if m.starts_with("serialization")));
}

#[test]
fn test_error_from_config_crate_error() {
    let err = ::config::ConfigError::NotFound("breaker.threshold".into());
    match ResilienceError::from(err) {
        ResilienceError::Config(message) => assert!(message.contains("breaker.threshold")),
        other => panic!("unexpected variant: {:?}", other),
    }
}

#[test]
fn test_error_clone_and_eq() {
    let err = ResilienceError::CheckpointNotFound("x".into());
    assert_eq!(err.clone(), err);
    assert_ne!(err, ResilienceError::Cancelled);
}

// ==================== TAXONOMY TESTS ====================

#[test]
fn test_severity_ranks_are_strictly_ordered() {
    let ranks: Vec<u8> = Severity::ALL.iter().map(|s| s.rank()).collect();
    assert_eq!(ranks, vec![4, 3, 2, 1, 0]);
}

#[test]
fn test_severity_max() {
    assert_eq!(Severity::Low.max(Severity::High), Severity::High);
    assert_eq!(Severity::Critical.max(Severity::Info), Severity::Critical);
}

#[test]
fn test_every_category_round_trips_through_display() {
    for category in Category::ALL {
        assert_eq!(category.to_string().parse::<Category>().unwrap(), category);
    }
}

#[test]
fn test_every_strategy_round_trips_through_display() {
    for strategy in [
        Strategy::ImmediateRetry,
        Strategy::RetryWithBackoff,
        Strategy::Fallback,
        Strategy::CheckpointRollback,
        Strategy::RestartSubsystem,
        Strategy::Ignore,
    ] {
        assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
    }
}

#[test]
fn test_unknown_category_is_ignored_by_default() {
    assert_eq!(Category::Unknown.default_strategy(), Strategy::Ignore);
    assert_eq!(Category::Network.default_strategy(), Strategy::RetryWithBackoff);
}

#[test]
fn test_only_network_is_transient() {
    let transient: Vec<_> = Category::ALL.into_iter().filter(|c| c.is_transient()).collect();
    assert_eq!(transient, vec![Category::Network]);
}

// ==================== SERIALIZATION TESTS ====================

#[test]
fn test_enums_serialize_screaming_snake_case() {
    assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"CRITICAL\"");
    assert_eq!(serde_json::to_string(&Category::Ui).unwrap(), "\"UI\"");
    assert_eq!(
        serde_json::to_string(&Strategy::CheckpointRollback).unwrap(),
        "\"CHECKPOINT_ROLLBACK\""
    );
    assert_eq!(serde_json::to_string(&TriggerType::PreRecovery).unwrap(), "\"PRE_RECOVERY\"");
}

#[test]
fn test_rollback_result_is_tagged() {
    let value = serde_json::to_value(RollbackResult::Exhausted { tried: 2 }).unwrap();
    assert_eq!(value, serde_json::json!({ "result": "EXHAUSTED", "tried": 2 }));

    let busy = serde_json::to_value(RollbackResult::Busy).unwrap();
    assert_eq!(busy, serde_json::json!({ "result": "BUSY" }));
}

#[test]
fn test_error_event_deserializes_with_missing_fields() {
    let event: ErrorEvent = serde_json::from_str(r#"{"message": "boom"}"#).unwrap();
    assert_eq!(event.message_text(), Some("boom"));
    assert!(event.stack.is_none());
    assert!(event.context.is_empty());
}

// ==================== CONFIGURATION TESTS ====================

#[test]
fn test_default_config_is_valid() {
    assert!(ResilienceConfig::default().validate().is_ok());
}

#[test]
fn test_default_config_matches_documented_defaults() {
    let config = ResilienceConfig::default();
    assert_eq!(config.breaker.threshold, 3);
    assert_eq!(config.breaker.reset_timeout_ms, 30_000);
    assert_eq!(config.checkpoint.min_interval_ms, 30_000);
    assert_eq!(config.checkpoint.max_checkpoints, 10);
    assert_eq!(config.checkpoint.max_milestones, 3);
    assert_eq!(config.controller.max_handling_depth, 3);
    assert_eq!(config.controller.notify_min_severity, Severity::Medium);
}
