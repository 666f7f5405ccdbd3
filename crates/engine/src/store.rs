//! Run record persistence
//!
//! Only redacted snapshots are stored. Persistence is best-effort: the
//! orchestrator logs failures and keeps running from memory.

use std::collections::HashMap;

use parking_lot::RwLock;
use qaflow_common::{Database, Result};

use crate::run::{RunSnapshot, RunSummary};

pub trait RunStore: Send + Sync {
    fn save(&self, snapshot: &RunSnapshot) -> Result<()>;

    fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>>;

    /// Newest first
    fn list(&self) -> Result<Vec<RunSummary>>;

    /// Whether a record was removed
    fn delete(&self, run_id: &str) -> Result<bool>;
}

/// SQLite-backed store
pub struct SqliteRunStore {
    db: Database,
}

impl SqliteRunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl RunStore for SqliteRunStore {
    fn save(&self, snapshot: &RunSnapshot) -> Result<()> {
        self.db
            .upsert_run(&snapshot.run_id, &snapshot.flow_id, snapshot.state.as_str(), snapshot)
    }

    fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        Ok(self.db.get_run::<RunSnapshot>(run_id)?.map(|row| row.record))
    }

    fn list(&self) -> Result<Vec<RunSummary>> {
        Ok(self
            .db
            .list_runs::<RunSnapshot>()?
            .into_iter()
            .map(|row| row.record.summary())
            .collect())
    }

    fn delete(&self, run_id: &str) -> Result<bool> {
        self.db.delete_run(run_id)
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, RunSnapshot>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn save(&self, snapshot: &RunSnapshot) -> Result<()> {
        self.runs
            .write()
            .insert(snapshot.run_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        Ok(self.runs.read().get(run_id).cloned())
    }

    fn list(&self) -> Result<Vec<RunSummary>> {
        let mut runs: Vec<RunSummary> = self.runs.read().values().map(|s| s.summary()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    fn delete(&self, run_id: &str) -> Result<bool> {
        Ok(self.runs.write().remove(run_id).is_some())
    }
}
