/// SQLite-backed checkpoint store
///
/// One row per checkpoint, the compressed snapshot kept as a BLOB. The
/// database runs in WAL mode for crash resilience, and every write goes through
/// a transaction.
use super::store::{CheckpointStore, StoredCheckpoint};
use crate::{ResilienceError, ResilienceResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Writes slower than this are logged
const SLOW_WRITE_MS: u128 = 100;

const SELECT_COLUMNS: &str = "id, sequence, timestamp, created_ms, trigger_type, priority, \
                              milestone, checksum, snapshot";

/// Checkpoint store over a single SQLite database file
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    capacity: usize,
}

impl SqliteCheckpointStore {
    /// Create or open a checkpoint database
    ///
    /// Creates the parent directory and schema if they don't exist.
    pub fn open(db_path: impl AsRef<Path>, capacity: usize) -> ResilienceResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create checkpoint database directory")?;
            }
        }

        let conn = Connection::open(&db_path).context("Failed to open checkpoint database")?;
        Self::with_connection(conn, db_path, capacity)
    }

    /// Private in-memory database, for tests
    pub fn in_memory(capacity: usize) -> ResilienceResult<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn, PathBuf::from(":memory:"), capacity)
    }

    fn with_connection(conn: Connection, db_path: PathBuf, capacity: usize) -> ResilienceResult<Self> {
        // Enable WAL mode for better concurrency and crash resilience
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode")?;

        // Set synchronous to NORMAL for better performance while maintaining safety
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                created_ms INTEGER NOT NULL,
                trigger_type TEXT NOT NULL,
                priority TEXT NOT NULL,
                milestone INTEGER NOT NULL DEFAULT 0,
                checksum TEXT NOT NULL,
                snapshot BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_sequence ON checkpoints(sequence);
            "#,
        )
        .context("Failed to create checkpoint schema")?;

        tracing::debug!(path = %db_path.display(), capacity, "Checkpoint database ready");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reclaim space after many evictions
    pub fn vacuum(&self) -> ResilienceResult<()> {
        self.lock()
            .execute("VACUUM", [])
            .context("Failed to vacuum database")?;
        Ok(())
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<StoredCheckpoint> {
    let timestamp: String = row.get(2)?;
    let trigger: String = row.get(4)?;
    let priority: String = row.get(5)?;

    Ok(StoredCheckpoint {
        id: row.get(0)?,
        sequence: row.get::<_, i64>(1)? as u64,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
            })?,
        created_ms: row.get::<_, i64>(3)? as u64,
        trigger: trigger.parse().map_err(|e: ResilienceError| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        priority: priority.parse().map_err(|e: ResilienceError| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        milestone: row.get::<_, i64>(6)? != 0,
        checksum: row.get(7)?,
        compressed_snapshot: row.get(8)?,
    })
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(&self, id: &str) -> ResilienceResult<Option<StoredCheckpoint>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM checkpoints WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                from_row,
            )
            .optional()
            .context("Failed to load checkpoint by ID")?;
        Ok(record)
    }

    fn set(&self, record: StoredCheckpoint) -> ResilienceResult<()> {
        let start = Instant::now();
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to start transaction")?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM checkpoints WHERE id = ?1)",
                params![record.id],
                |row| row.get(0),
            )
            .context("Failed to check checkpoint existence")?;
        if !exists {
            let count: i64 = tx
                .query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))
                .context("Failed to count checkpoints")?;
            if count as usize >= self.capacity {
                return Err(ResilienceError::Store(format!(
                    "store full (capacity {})",
                    self.capacity
                )));
            }
        }

        tx.execute(
            r#"
            INSERT OR REPLACE INTO checkpoints (
                id, sequence, timestamp, created_ms, trigger_type, priority,
                milestone, checksum, snapshot
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id,
                record.sequence as i64,
                record.timestamp.to_rfc3339(),
                record.created_ms as i64,
                record.trigger.as_str(),
                record.priority.as_str(),
                record.milestone as i64,
                record.checksum,
                record.compressed_snapshot,
            ],
        )
        .context("Failed to insert checkpoint")?;

        tx.commit().context("Failed to commit checkpoint transaction")?;

        let elapsed = start.elapsed();
        if elapsed.as_millis() > SLOW_WRITE_MS {
            tracing::warn!(
                id = %record.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Checkpoint write took longer than {}ms",
                SLOW_WRITE_MS
            );
        }

        Ok(())
    }

    fn delete(&self, id: &str) -> ResilienceResult<bool> {
        let deleted = self
            .lock()
            .execute("DELETE FROM checkpoints WHERE id = ?1", params![id])
            .context("Failed to delete checkpoint")?;
        Ok(deleted > 0)
    }

    fn list(&self) -> ResilienceResult<Vec<StoredCheckpoint>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM checkpoints ORDER BY sequence ASC",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare list query")?;

        let records = stmt
            .query_map([], from_row)
            .context("Failed to query checkpoints")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect checkpoints")?;

        Ok(records)
    }

    fn len(&self) -> ResilienceResult<usize> {
        let total: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))?;
        Ok(total as usize)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
