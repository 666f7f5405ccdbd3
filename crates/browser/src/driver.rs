//! Browser capability traits
//!
//! The engine never talks to a concrete automation tool. It consumes
//! [`BrowserDriver`] to launch sessions and [`BrowserSession`] for the
//! primitives (navigate, snapshot, click, type, screenshot, network log).

use std::path::PathBuf;

use async_trait::async_trait;
use qaflow_common::{BrowserAction, Control, NetworkExchange, StepRecord};
use serde::{Deserialize, Serialize};

use crate::error::{AutomationError, AutomationResult};

/// Default timeout for single-action primitives
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 10_000;

/// Result of a navigation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    /// URL after redirects
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Status of the main document response, when one was observed
    #[serde(default)]
    pub status_code: Option<u16>,
}

/// Structural snapshot of the current page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub controls: Vec<Control>,
    /// Leading visible text of the body
    #[serde(default)]
    pub text_excerpt: String,
    /// Class-name prefixes seen in the DOM, used for UI library detection
    #[serde(default)]
    pub class_hints: Vec<String>,
    #[serde(default)]
    pub has_password_field: bool,
    /// Native validation messages of invalid fields
    #[serde(default)]
    pub validation_messages: Vec<String>,
}

impl DomSnapshot {
    /// Controls of the given kind
    pub fn controls_of(&self, kind: qaflow_common::ControlKind) -> impl Iterator<Item = &Control> {
        self.controls.iter().filter(move |c| c.kind == kind)
    }

    /// Case-insensitive search of the title and text excerpt
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self.text_excerpt.to_lowercase().contains(&needle)
    }
}

/// State of the elements matched by a selector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    pub count: usize,
    pub visible: bool,
    #[serde(default)]
    pub text: String,
}

/// Outcome of one action in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub label: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub screenshot_path: Option<String>,
}

impl ActionOutcome {
    pub fn into_record(self) -> StepRecord {
        StepRecord {
            step: self.label,
            success: self.success,
            duration_ms: self.duration_ms,
            error: self.error,
        }
    }
}

/// First failure of a batch as an error
fn first_failure(outcomes: Vec<ActionOutcome>) -> AutomationResult<()> {
    match outcomes.into_iter().find(|o| !o.success) {
        Some(failed) => Err(AutomationError::StepFailed {
            step: failed.label,
            reason: failed.error.unwrap_or_else(|| "unknown failure".to_string()),
        }),
        None => Ok(()),
    }
}

/// An isolated browser session with its own cookie and storage scope
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Session identifier
    fn id(&self) -> &str;

    /// Navigate and report the final URL and document status
    async fn navigate(&self, url: &str) -> AutomationResult<PageInfo>;

    /// URL of the current page
    async fn current_url(&self) -> AutomationResult<String>;

    /// Read the structure of the current page
    async fn snapshot(&self) -> AutomationResult<DomSnapshot>;

    /// Query elements matching a selector on the current page
    async fn query(&self, selector: &str) -> AutomationResult<ElementState>;

    /// Run actions in order on one page, stopping at the first failure.
    ///
    /// A failing action is reported in its outcome, not as an `Err`; `Err`
    /// means the session itself could not run the batch.
    async fn run_actions(
        &self,
        actions: &[BrowserAction],
        step_timeout_ms: u64,
    ) -> AutomationResult<Vec<ActionOutcome>>;

    /// Capture a full-page screenshot
    async fn screenshot(&self, name: &str) -> AutomationResult<PathBuf>;

    /// Exchanges observed since the last navigation
    async fn network_log(&self) -> AutomationResult<Vec<NetworkExchange>>;

    /// Export cookies and local storage
    async fn storage_state(&self) -> AutomationResult<serde_json::Value>;

    /// Import state previously exported by [`BrowserSession::storage_state`]
    async fn restore_storage_state(&self, state: &serde_json::Value) -> AutomationResult<()>;

    /// Tear the session down; idempotent
    async fn close(&self) -> AutomationResult<()>;

    async fn click(&self, selector: &str) -> AutomationResult<()> {
        let action = BrowserAction::Click {
            selector: selector.to_string(),
            timeout_ms: None,
        };
        first_failure(self.run_actions(&[action], DEFAULT_ACTION_TIMEOUT_MS).await?)
    }

    async fn type_text(&self, selector: &str, value: &str) -> AutomationResult<()> {
        let action = BrowserAction::Fill {
            selector: selector.to_string(),
            value: value.to_string(),
        };
        first_failure(self.run_actions(&[action], DEFAULT_ACTION_TIMEOUT_MS).await?)
    }
}

/// Launches isolated sessions
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn launch(&self, run_id: &str) -> AutomationResult<Box<dyn BrowserSession>>;
}
