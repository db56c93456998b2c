use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use weft_core::EventBus;

use crate::record::EventRecord;

/// A persisted record with its assigned log position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub position: u64,
    pub record: EventRecord,
    pub recorded_at: DateTime<Utc>,
}

/// SQLite-backed append-only event log.
///
/// `append` returns only after the record is durable; callers mutate
/// in-memory state strictly afterwards. Positions start at 1 and are
/// dense; replay walks them in order with no gaps.
pub struct EventLog {
    state: Mutex<LogState>,
    bus: EventBus<LogEntry>,
}

struct LogState {
    conn: Connection,
    next_position: u64,
}

impl EventLog {
    /// Open or create the log at the given path.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WalError::Database(format!("Failed to create log directory: {}", e)))?;
        }
        let conn = Connection::open(path).map_err(|e| WalError::Database(e.to_string()))?;
        Self::initialize(conn)
    }

    /// In-memory log for tests.
    pub fn in_memory() -> Result<Self, WalError> {
        let conn = Connection::open_in_memory().map_err(|e| WalError::Database(e.to_string()))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, WalError> {
        // synchronous=FULL: an append must survive power loss before the
        // in-memory apply is allowed to happen.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;

             CREATE TABLE IF NOT EXISTS records (
                 position INTEGER PRIMARY KEY,
                 record_type TEXT NOT NULL,
                 record_json TEXT NOT NULL,
                 execution_id TEXT,
                 node_id TEXT,
                 recorded_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_records_execution
                 ON records(execution_id, position);",
        )
        .map_err(|e| WalError::Database(e.to_string()))?;

        let next_position: u64 = conn
            .query_row(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM records",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(|e| WalError::Database(e.to_string()))?;

        Ok(Self {
            state: Mutex::new(LogState {
                conn,
                next_position,
            }),
            bus: EventBus::default(),
        })
    }

    /// Durably append one record and return its position.
    pub fn append(&self, record: EventRecord) -> Result<u64, WalError> {
        let json = serde_json::to_string(&record)?;
        let recorded_at = Utc::now();

        let entry = {
            let mut state = self.state.lock().map_err(|e| WalError::Database(e.to_string()))?;
            let position = state.next_position;
            state
                .conn
                .execute(
                    "INSERT INTO records
                         (position, record_type, record_json, execution_id, node_id, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        position as i64,
                        record.record_type(),
                        json,
                        record.execution_id().map(|id| id.to_string()),
                        record.node_id().map(|id| id.to_string()),
                        recorded_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| WalError::Database(e.to_string()))?;
            state.next_position += 1;

            LogEntry {
                position,
                record,
                recorded_at,
            }
        };

        debug!(position = entry.position, record_type = entry.record.record_type(), "Record appended");
        self.bus.publish(entry.clone());
        Ok(entry.position)
    }

    /// Replay the whole log in position order.
    pub fn replay(&self) -> Result<Vec<LogEntry>, WalError> {
        self.replay_from(0)
    }

    /// Replay every record at or after `position`.
    pub fn replay_from(&self, position: u64) -> Result<Vec<LogEntry>, WalError> {
        let state = self.state.lock().map_err(|e| WalError::Database(e.to_string()))?;
        let mut stmt = state
            .conn
            .prepare(
                "SELECT position, record_json, recorded_at FROM records
                 WHERE position >= ?1 ORDER BY position",
            )
            .map_err(|e| WalError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![position as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| WalError::Database(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            let (position, json, recorded_at) = row.map_err(|e| WalError::Database(e.to_string()))?;
            entries.push(LogEntry {
                position: position as u64,
                record: serde_json::from_str(&json)?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map_err(|e| WalError::Database(e.to_string()))?
                    .with_timezone(&Utc),
            });
        }
        Ok(entries)
    }

    /// Records belonging to one execution, in position order.
    pub fn replay_execution(&self, execution_id: uuid::Uuid) -> Result<Vec<LogEntry>, WalError> {
        let state = self.state.lock().map_err(|e| WalError::Database(e.to_string()))?;
        let mut stmt = state
            .conn
            .prepare(
                "SELECT position, record_json, recorded_at FROM records
                 WHERE execution_id = ?1 ORDER BY position",
            )
            .map_err(|e| WalError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![execution_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| WalError::Database(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            let (position, json, recorded_at) = row.map_err(|e| WalError::Database(e.to_string()))?;
            entries.push(LogEntry {
                position: position as u64,
                record: serde_json::from_str(&json)?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map_err(|e| WalError::Database(e.to_string()))?
                    .with_timezone(&Utc),
            });
        }
        Ok(entries)
    }

    /// Position of the most recent record, or 0 if the log is empty.
    pub fn last_position(&self) -> Result<u64, WalError> {
        let state = self.state.lock().map_err(|e| WalError::Database(e.to_string()))?;
        Ok(state.next_position - 1)
    }

    pub fn count(&self) -> Result<u64, WalError> {
        let state = self.state.lock().map_err(|e| WalError::Database(e.to_string()))?;
        let count: i64 = state
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map_err(|e| WalError::Database(e.to_string()))?;
        Ok(count as u64)
    }

    /// Fold the SQLite WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<(), WalError> {
        let state = self.state.lock().map_err(|e| WalError::Database(e.to_string()))?;
        state
            .conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(|e| WalError::Database(e.to_string()))?;
        Ok(())
    }

    /// Live feed of appended records (mirroring, status streaming).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LogEntry> {
        self.bus.subscribe()
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("Event log database error: {0}")]
    Database(String),

    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Mirror error: {0}")]
    Mirror(String),
}
