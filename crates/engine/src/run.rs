//! In-memory run record and its externally visible snapshot

use qaflow_common::{
    now_millis, sanitize_value, Error, Question, Result, RunContext, RunFailure, RunState,
    StateTransition, REDACTION_MARKER,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything the orchestrator tracks for one run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub context: RunContext,
    pub state: RunState,
    /// Outstanding question; present exactly while in a `WAIT_*` state
    pub question: Option<Question>,
    pub failure: Option<RunFailure>,
    pub history: Vec<StateTransition>,
    pub updated_at: i64,
}

impl RunRecord {
    pub fn new(context: RunContext) -> Self {
        let updated_at = context.created_at;
        Self {
            context,
            state: RunState::Init,
            question: None,
            failure: None,
            history: Vec::new(),
            updated_at,
        }
    }

    /// Apply a legal transition and record it
    pub fn transition(&mut self, to: RunState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let at = now_millis();
        self.history.push(StateTransition {
            from: self.state,
            to,
            at,
        });
        self.state = to;
        self.updated_at = at;
        if !to.is_waiting() {
            self.question = None;
        }
        Ok(())
    }

    /// Enter a waiting state with its question
    pub fn suspend(&mut self, to: RunState, question: Question) -> Result<()> {
        if !to.is_waiting() {
            return Err(Error::Internal(format!("{} is not a waiting state", to)));
        }
        self.transition(to)?;
        self.question = Some(question);
        Ok(())
    }

    /// Move to FAILED; a no-op once terminal
    pub fn fail(&mut self, failure: RunFailure) {
        if self.state.is_terminal() {
            return;
        }
        if self.transition(RunState::Failed).is_ok() {
            self.failure = Some(failure);
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let mut context = serde_json::to_value(&self.context).unwrap_or(Value::Null);
        if let Some(map) = context.as_object_mut() {
            // Browser cookies are credentials in all but name
            if map.get("session_state").map_or(false, |v| !v.is_null()) {
                map.insert("session_state".into(), Value::String(REDACTION_MARKER.into()));
            }
        }
        RunSnapshot {
            run_id: self.context.run_id.clone(),
            flow_id: self.context.flow_id.clone(),
            state: self.state,
            question: self.question.clone(),
            failure: self.failure.clone(),
            history: self.history.clone(),
            context: sanitize_value(&context),
            created_at: self.context.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.context.run_id.clone(),
            flow_id: self.context.flow_id.clone(),
            state: self.state,
            created_at: self.context.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Redacted view of a run, safe to log, persist and return to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub flow_id: String,
    pub state: RunState,
    pub question: Option<Question>,
    pub failure: Option<RunFailure>,
    pub history: Vec<StateTransition>,
    pub context: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RunSnapshot {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            flow_id: self.flow_id.clone(),
            state: self.state,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub flow_id: String,
    pub state: RunState,
    pub created_at: i64,
    pub updated_at: i64,
}
