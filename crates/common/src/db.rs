//! SQLite database for run record persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Run records (redacted JSON snapshot of the full record)
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                state TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                generation INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_runs_flow ON runs(flow_id);
            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Insert or replace a run record
    pub fn upsert_run<T: Serialize>(&self, id: &str, flow_id: &str, state: &str, record: &T) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO runs (id, flow_id, state, record, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                record = excluded.record,
                updated_at = excluded.updated_at,
                generation = generation + 1",
            params![id, flow_id, state, serde_json::to_string(record)?, now],
        )?;

        debug!("Persisted run {} in state {}", id, state);
        Ok(())
    }

    /// Get a run by ID
    pub fn get_run<T: DeserializeOwned>(&self, id: &str) -> Result<Option<RunRow<T>>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, flow_id, state, record, created_at, updated_at, generation
                 FROM runs WHERE id = ?1",
                params![id],
                RawRow::from_row,
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// List all runs, newest first
    pub fn list_runs<T: DeserializeOwned>(&self) -> Result<Vec<RunRow<T>>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, flow_id, state, record, created_at, updated_at, generation
             FROM runs ORDER BY created_at DESC, id",
        )?;

        let rows = stmt.query_map([], RawRow::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }

        Ok(results)
    }

    /// Delete a run
    pub fn delete_run(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;

        if rows > 0 {
            debug!("Deleted run {}", id);
        }

        Ok(rows > 0)
    }
}

/// Raw database row before parsing
struct RawRow {
    id: String,
    flow_id: String,
    state: String,
    record: String,
    created_at: i64,
    updated_at: i64,
    generation: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            state: row.get(2)?,
            record: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            generation: row.get(6)?,
        })
    }

    fn parse<T: DeserializeOwned>(self) -> Result<RunRow<T>> {
        Ok(RunRow {
            id: self.id,
            flow_id: self.flow_id,
            state: self.state,
            record: serde_json::from_str(&self.record)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            generation: self.generation,
        })
    }
}

/// Parsed run row
#[derive(Debug, Clone)]
pub struct RunRow<T> {
    pub id: String,
    pub flow_id: String,
    pub state: String,
    pub record: T,
    pub created_at: i64,
    pub updated_at: i64,
    pub generation: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        value: String,
    }

    #[test]
    fn test_run_crud() {
        let db = Database::open_memory().unwrap();

        let record = TestRecord { value: "first".to_string() };
        db.upsert_run("run-1", "checkout", "INIT", &record).unwrap();

        let row: RunRow<TestRecord> = db.get_run("run-1").unwrap().unwrap();
        assert_eq!(row.record.value, "first");
        assert_eq!(row.state, "INIT");
        assert_eq!(row.generation, 1);

        // Update bumps the generation
        let record = TestRecord { value: "second".to_string() };
        db.upsert_run("run-1", "checkout", "SESSION_CHECK", &record).unwrap();
        let row: RunRow<TestRecord> = db.get_run("run-1").unwrap().unwrap();
        assert_eq!(row.record.value, "second");
        assert_eq!(row.generation, 2);

        let rows: Vec<RunRow<TestRecord>> = db.list_runs().unwrap();
        assert_eq!(rows.len(), 1);

        assert!(db.delete_run("run-1").unwrap());
        assert!(db.get_run::<TestRecord>("run-1").unwrap().is_none());
    }
}
