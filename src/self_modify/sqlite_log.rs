//! # Stage: SQLite History Mirror
//!
//! ## Responsibility
//! Write-through persistence of the improvement history into a single SQLite
//! table, so a restarted loop can rehydrate its history and report.
//!
//! ```sql
//! CREATE TABLE improvements (
//!     id            TEXT PRIMARY KEY,
//!     category      TEXT NOT NULL,
//!     status        TEXT NOT NULL,
//!     created_at_ms INTEGER NOT NULL,
//!     record        TEXT NOT NULL   -- full Improvement as JSON
//! );
//! ```
//!
//! ## Guarantees
//! - Upsert by id, matching the in-memory history.
//! - Non-panicking: every SQLite error maps to [`LoopError::History`].

#![cfg(feature = "sqlite-log")]

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection};

use super::memory::HistorySink;
use crate::error::{LoopError, Result};
use crate::improvement::Improvement;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS improvements (
    id            TEXT PRIMARY KEY,
    category      TEXT NOT NULL,
    status        TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    record        TEXT NOT NULL
)";

fn history_err(e: impl std::fmt::Display) -> LoopError {
    LoopError::History(e.to_string())
}

/// [`HistorySink`] backed by a SQLite database.
pub struct SqliteHistoryLog {
    conn: Mutex<Connection>,
}

impl SqliteHistoryLog {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(history_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(history_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(history_err)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Every persisted improvement, oldest first.
    pub fn load_all(&self) -> Result<Vec<Improvement>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare("SELECT record FROM improvements ORDER BY created_at_ms, rowid")
            .map_err(history_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(history_err)?;

        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(history_err)?;
            out.push(serde_json::from_str(&json).map_err(history_err)?);
        }
        Ok(out)
    }
}

impl HistorySink for SqliteHistoryLog {
    fn persist(&self, improvement: &Improvement) -> Result<()> {
        let record = serde_json::to_string(improvement).map_err(history_err)?;
        let created = i64::try_from(improvement.created_at_ms()).unwrap_or(i64::MAX);
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO improvements (id, category, status, created_at_ms, record)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 category = excluded.category,
                 status = excluded.status,
                 created_at_ms = excluded.created_at_ms,
                 record = excluded.record",
            params![
                improvement.id(),
                improvement.category().to_string(),
                improvement.status().to_string(),
                created,
                record
            ],
        )
        .map_err(history_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
