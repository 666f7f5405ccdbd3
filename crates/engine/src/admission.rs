//! Admission control
//!
//! Two caps checked atomically at run creation: active runs overall and
//! active runs per flow. There is no queue; a rejected caller retries
//! later. Slots are held by an [`AdmissionPermit`] and returned when it
//! drops, so every exit path of a run frees its slot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use qaflow_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AdmissionConfig;

#[derive(Default)]
struct Slots {
    /// flow id -> admitted run ids
    running: HashMap<String, HashSet<String>>,
    total: usize,
}

/// Admitted run counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub active: usize,
    pub per_flow: HashMap<String, usize>,
}

#[derive(Clone)]
pub struct AdmissionController {
    max_total: usize,
    max_per_flow: usize,
    slots: Arc<Mutex<Slots>>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            max_total: config.max_concurrent_runs,
            max_per_flow: config.max_runs_per_flow,
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    /// Check both caps and register the run in one step
    pub fn try_admit(&self, flow_id: &str, run_id: &str) -> Result<AdmissionPermit> {
        let mut slots = self.slots.lock();
        if slots.total >= self.max_total {
            return Err(Error::AdmissionRejected(format!(
                "{} run(s) already active (limit {})",
                slots.total, self.max_total
            )));
        }
        let flow_count = slots.running.get(flow_id).map_or(0, |s| s.len());
        if flow_count >= self.max_per_flow {
            return Err(Error::AdmissionRejected(format!(
                "flow '{}' already has {} active run(s) (limit {})",
                flow_id, flow_count, self.max_per_flow
            )));
        }

        slots
            .running
            .entry(flow_id.to_string())
            .or_default()
            .insert(run_id.to_string());
        slots.total += 1;
        debug!(flow = flow_id, run = run_id, active = slots.total, "Run admitted");

        Ok(AdmissionPermit {
            flow_id: flow_id.to_string(),
            run_id: run_id.to_string(),
            slots: Arc::clone(&self.slots),
        })
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let slots = self.slots.lock();
        AdmissionSnapshot {
            active: slots.total,
            per_flow: slots
                .running
                .iter()
                .map(|(flow, runs)| (flow.clone(), runs.len()))
                .collect(),
        }
    }

    pub fn active(&self) -> usize {
        self.slots.lock().total
    }
}

/// A held admission slot
pub struct AdmissionPermit {
    flow_id: String,
    run_id: String,
    slots: Arc<Mutex<Slots>>,
}

impl AdmissionPermit {
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("flow_id", &self.flow_id)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        let removed = match slots.running.get_mut(&self.flow_id) {
            Some(runs) => {
                let removed = runs.remove(&self.run_id);
                if runs.is_empty() {
                    slots.running.remove(&self.flow_id);
                }
                removed
            }
            None => false,
        };
        if removed {
            slots.total = slots.total.saturating_sub(1);
            debug!(flow = %self.flow_id, run = %self.run_id, active = slots.total, "Run slot released");
        }
    }
}
