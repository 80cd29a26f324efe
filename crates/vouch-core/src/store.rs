//! `SQLite`-backed append-only store.
//!
//! Three logical tables back the ledger: `events` keyed by `(run_id, seq)`,
//! `runs` with its `key_ranges` companion, and the `task_failures` counter.
//! WAL mode allows the verifier and the CLI to read concurrently while the
//! ledger worker writes. SQL triggers reject any update or delete on
//! `events`, so immutability holds even against a stray connection.

// SQLite returns i64 for counts and timestamps; the ledger never stores
// negative values in those columns.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;

use crate::event::{Event, EventType, TaskState};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An insert affected zero rows; the ledger cannot trust the write.
    #[error("append failed: insert for seq {seq} affected no rows")]
    AppendFailed {
        /// Sequence number of the rejected event.
        seq: u64,
    },

    /// An append would break sequence density for the run.
    #[error("out-of-order append: expected seq {expected}, got {got}")]
    OutOfOrder {
        /// The next dense sequence number for the run.
        expected: u64,
        /// The sequence number that was offered.
        got: u64,
    },
}

/// Run metadata, one row per proxy lifecycle.
#[derive(Debug, Clone)]
pub struct Run {
    /// Run identifier.
    pub run_id: String,
    /// Agent label supplied at startup.
    pub agent: String,
    /// Hash of the genesis event.
    pub genesis_hash: Vec<u8>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A `(seq_first, seq_last, public_key)` tuple describing which key signed
/// which sequence interval. `seq_last = None` marks the open range.
#[derive(Debug, Clone)]
pub struct KeyRange {
    /// First sequence signed by this key.
    pub seq_first: u64,
    /// Last sequence signed by this key; `None` while the range is open.
    pub seq_last: Option<u64>,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
}

impl KeyRange {
    /// Returns `true` if `seq` falls inside this range.
    #[must_use]
    pub fn covers(&self, seq: u64) -> bool {
        self.seq_first <= seq && self.seq_last.map_or(true, |last| seq <= last)
    }
}

/// The append-only store backing the ledger.
///
/// Clones share one connection; the ledger worker is the sole writer of
/// `events`, other holders only read.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens an existing store read-only (CLI and verifier use).
    ///
    /// # Errors
    ///
    /// Returns an error if the database does not exist or cannot be opened.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Path of the backing database file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Atomically appends a fully populated event.
    ///
    /// The event must carry the next dense sequence number for its run;
    /// duplicates and gaps are rejected before the insert. A successful
    /// return means the row is durable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OutOfOrder`] on a seq violation and
    /// [`StoreError::AppendFailed`] if the insert affected no rows.
    pub fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let head: Option<i64> = tx.query_row(
            "SELECT MAX(seq) FROM events WHERE run_id = ?1",
            params![event.run_id],
            |row| row.get(0),
        )?;
        let expected = head.map_or(0, |h| h as u64 + 1);
        if event.seq != expected {
            return Err(StoreError::OutOfOrder {
                expected,
                got: event.seq,
            });
        }

        let affected = tx.execute(
            "INSERT INTO events (run_id, seq, id, ts, type, method, params, response,
                                 task_id, task_state, parent_id, policy_id, risk_level,
                                 was_blocked, prev_hash, hash, sig, key_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                event.run_id,
                event.seq as i64,
                event.id,
                event.ts.timestamp_millis(),
                event.event_type.as_str(),
                event.method,
                event.params.to_string(),
                event.response.to_string(),
                event.task_id,
                event.task_state.as_str(),
                event.parent_id,
                event.policy_id,
                event.risk_level,
                event.was_blocked,
                event.prev_hash,
                event.hash,
                event.sig,
                event.key_id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::AppendFailed { seq: event.seq });
        }

        tx.commit()?;
        Ok(())
    }

    /// Returns the highest-seq event of a run, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub fn last_event(&self, run_id: &str) -> Result<Option<Event>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "{EVENT_SELECT} WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1"
        ))?;
        Ok(stmt.query_row(params![run_id], row_to_event).optional()?)
    }

    /// Returns the event at `seq` for a run, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub fn get_event(&self, run_id: &str, seq: u64) -> Result<Option<Event>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt =
            conn.prepare(&format!("{EVENT_SELECT} WHERE run_id = ?1 AND seq = ?2"))?;
        Ok(stmt
            .query_row(params![run_id, seq as i64], row_to_event)
            .optional()?)
    }

    /// Reads up to `limit` events of a run with `from_seq <= seq <= to_seq`
    /// in ascending order. Restartable from any checkpoint seq.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn range(
        &self,
        run_id: &str,
        from_seq: u64,
        to_seq: u64,
        limit: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "{EVENT_SELECT} WHERE run_id = ?1 AND seq >= ?2 AND seq <= ?3
             ORDER BY seq ASC LIMIT ?4"
        ))?;
        let events = stmt
            .query_map(
                params![run_id, from_seq as i64, to_seq as i64, limit as i64],
                row_to_event,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Returns the most recent `limit` events of a run in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn recent_events(&self, run_id: &str, limit: u64) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM ({EVENT_SELECT} WHERE run_id = ?1 ORDER BY seq DESC LIMIT ?2)
             ORDER BY seq ASC"
        ))?;
        let events = stmt
            .query_map(params![run_id, limit as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Returns the run id of the single stored run, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_run_id(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let run_id = conn
            .query_row(
                "SELECT run_id FROM runs ORDER BY created_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id)
    }

    /// Inserts run metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn put_run(&self, run: &Run) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO runs (run_id, agent, genesis_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run.run_id,
                run.agent,
                run.genesis_hash,
                run.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Returns run metadata by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let run = conn
            .query_row(
                "SELECT run_id, agent, genesis_hash, created_at FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    let millis: i64 = row.get(3)?;
                    Ok(Run {
                        run_id: row.get(0)?,
                        agent: row.get(1)?,
                        genesis_hash: row.get(2)?,
                        created_at: Utc
                            .timestamp_millis_opt(millis)
                            .single()
                            .unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(run)
    }

    /// Opens a new key range at `seq_first`, closing the currently open
    /// range at `seq_first - 1`.
    ///
    /// # Errors
    ///
    /// Returns an error if either statement fails.
    pub fn append_key_range(
        &self,
        run_id: &str,
        seq_first: u64,
        public_key: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        if seq_first > 0 {
            tx.execute(
                "UPDATE key_ranges SET seq_last = ?2 WHERE run_id = ?1 AND seq_last IS NULL",
                params![run_id, (seq_first - 1) as i64],
            )?;
        }
        tx.execute(
            "INSERT INTO key_ranges (run_id, seq_first, seq_last, public_key)
             VALUES (?1, ?2, NULL, ?3)",
            params![run_id, seq_first as i64, public_key],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns a run's key ranges ordered by `seq_first`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn key_ranges(&self, run_id: &str) -> Result<Vec<KeyRange>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT seq_first, seq_last, public_key FROM key_ranges
             WHERE run_id = ?1 ORDER BY seq_first ASC",
        )?;
        let ranges = stmt
            .query_map(params![run_id], |row| {
                Ok(KeyRange {
                    seq_first: row.get::<_, i64>(0)? as u64,
                    seq_last: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
                    public_key: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ranges)
    }

    /// Returns the failure count recorded for a task (0 if unknown).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_task_failure_count(&self, task_id: &str) -> Result<u32, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: Option<i64> = conn
            .query_row(
                "SELECT failure_count FROM task_failures WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u32)
    }

    /// Holds the connection lock, stalling every store operation until the
    /// guard drops. Lets tests wedge the ledger worker mid-commit.
    #[cfg(test)]
    pub(crate) fn test_lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Increments the failure counter for a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn record_task_failure(&self, task_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO task_failures (task_id, failure_count) VALUES (?1, 1)
             ON CONFLICT(task_id) DO UPDATE SET failure_count = failure_count + 1",
            params![task_id],
        )?;
        Ok(())
    }
}

const EVENT_SELECT: &str = "SELECT run_id, seq, id, ts, type, method, params, response,
    task_id, task_state, parent_id, policy_id, risk_level, was_blocked,
    prev_hash, hash, sig, key_id FROM events";

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let seq = row.get::<_, i64>(1)? as u64;
    let millis: i64 = row.get(3)?;
    let type_str: String = row.get(4)?;
    let event_type = EventType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown event type '{type_str}' at seq {seq}").into(),
        )
    })?;
    let params_str: String = row.get(6)?;
    let response_str: String = row.get(7)?;
    let task_state_str: String = row.get(9)?;

    Ok(Event {
        run_id: row.get(0)?,
        seq,
        id: row.get(2)?,
        ts: Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_default(),
        event_type,
        method: row.get(5)?,
        params: parse_json_column(6, seq, &params_str)?,
        response: parse_json_column(7, seq, &response_str)?,
        task_id: row.get(8)?,
        task_state: TaskState::parse(&task_state_str),
        parent_id: row.get(10)?,
        policy_id: row.get(11)?,
        risk_level: row.get(12)?,
        was_blocked: row.get(13)?,
        prev_hash: row.get(14)?,
        hash: row.get(15)?,
        sig: row.get(16)?,
        key_id: row.get(17)?,
    })
}

fn parse_json_column(idx: usize, seq: u64, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid JSON at seq {seq}: {e}").into(),
        )
    })
}
