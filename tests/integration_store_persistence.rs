/// Integration tests for persistent checkpoint stores
///
/// Tests checkpoints surviving a restart including:
/// - File store reopen and rollback
/// - SQLite store reopen and rollback
/// - Corruption on disk detected at rollback time
/// - The JSON state file provider
mod common;

use anyhow::Result;
use common::fakes::RecordingState;
use resilience_engine::checkpoint::{FileCheckpointStore, JsonFileState, SqliteCheckpointStore};
use resilience_engine::{
    CheckpointPriority, CheckpointStatus, CheckpointStore, ControllerBuilder, ErrorResilienceController,
    ResilienceConfig, RollbackResult, RollbackTarget, TriggerType,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn controller(state: Arc<RecordingState>, store: Arc<dyn CheckpointStore>) -> Result<ErrorResilienceController> {
    Ok(ControllerBuilder::new(state).store(store).build()?)
}

fn take(controller: &ErrorResilienceController, state: &RecordingState, json: &str) -> Result<String> {
    state.set(json);
    Ok(controller
        .create_checkpoint(TriggerType::Manual, CheckpointPriority::High)?
        .id)
}

#[test]
fn test_file_store_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let capacity = ResilienceConfig::default().checkpoint.store_capacity;
    let state = Arc::new(RecordingState::new(r#"{"v": 0}"#));

    let (first, second) = {
        let store = Arc::new(FileCheckpointStore::open(dir.path(), capacity)?);
        let controller = controller(state.clone(), store)?;
        (
            take(&controller, &state, r#"{"v": 1}"#)?,
            take(&controller, &state, r#"{"v": 2}"#)?,
        )
    };

    let store = Arc::new(FileCheckpointStore::open(dir.path(), capacity)?);
    let reopened = controller(state.clone(), store)?;
    let listed = reopened.checkpoints().list();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second);
    assert_eq!(listed[1].id, first);
    assert!(listed.iter().all(|c| c.status == CheckpointStatus::PendingValidation));

    state.set(r#"{"v": 3}"#);
    let result = reopened.rollback_to_checkpoint(RollbackTarget::Progressive, "after restart");
    assert!(result.is_restored());
    assert_eq!(state.value()["v"], 2);
    assert_eq!(
        reopened.checkpoints().get(&second).unwrap().status,
        CheckpointStatus::Active
    );
    Ok(())
}

#[test]
fn test_file_store_corruption_found_on_rollback() -> Result<()> {
    let dir = TempDir::new()?;
    let state = Arc::new(RecordingState::new(r#"{"v": 0}"#));

    let (first, second) = {
        let store = Arc::new(FileCheckpointStore::open(dir.path(), 16)?);
        let controller = controller(state.clone(), store)?;
        (
            take(&controller, &state, r#"{"v": 1}"#)?,
            take(&controller, &state, r#"{"v": 2}"#)?,
        )
    };

    fs::write(dir.path().join(format!("{}.gz", second)), b"bit rot")?;

    let store = Arc::new(FileCheckpointStore::open(dir.path(), 16)?);
    let reopened = controller(state.clone(), store)?;
    state.set(r#"{"v": 9}"#);

    match reopened.rollback_to_checkpoint(RollbackTarget::Progressive, "after restart") {
        RollbackResult::Restored(report) => {
            assert_eq!(report.checkpoint_id, first);
            assert_eq!(report.invalidated, vec![second]);
        }
        other => panic!("expected a restore, got {:?}", other),
    }
    assert_eq!(state.value()["v"], 1);
    Ok(())
}

#[test]
fn test_sqlite_store_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("nested").join("checkpoints.db");
    let state = Arc::new(RecordingState::new(r#"{"v": 0}"#));

    let id = {
        let store = Arc::new(SqliteCheckpointStore::open(&db, 16)?);
        let controller = controller(state.clone(), store)?;
        take(&controller, &state, r#"{"v": 1, "items": ["sword"]}"#)?
    };

    let store = Arc::new(SqliteCheckpointStore::open(&db, 16)?);
    let reopened = controller(state.clone(), store)?;
    assert_eq!(reopened.checkpoints().list().len(), 1);

    state.set(r#"{"v": 2}"#);
    let result = reopened.rollback_to_checkpoint(RollbackTarget::Id(id), "after restart");
    assert!(result.is_restored());
    assert_eq!(state.value()["items"][0], "sword");
    Ok(())
}

#[test]
fn test_json_file_state_round_trip_through_controller() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("save.json");
    fs::write(&path, r#"{"realm": 1, "qi": 10}"#)?;

    let provider = Arc::new(JsonFileState::new(&path).with_required_keys(["realm"]));
    let controller = ControllerBuilder::new(provider).build()?;
    controller.create_checkpoint(TriggerType::Manual, CheckpointPriority::High)?;

    fs::write(&path, r#"{"realm": 7, "qi": -1}"#)?;
    assert!(controller
        .rollback_to_checkpoint(RollbackTarget::Latest, "test")
        .is_restored());
    let restored: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
    assert_eq!(restored["realm"], 1);

    // Missing required key is rejected
    fs::write(&path, r#"{"qi": 3}"#)?;
    assert!(controller
        .create_checkpoint(TriggerType::Manual, CheckpointPriority::High)
        .is_err());
    Ok(())
}
