//! Error types for browser automation

use thiserror::Error;

/// Failure of a browser primitive; isolates the current step, never the manager
#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Step failed: {step} - {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Unexpected driver output: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type AutomationResult<T> = Result<T, AutomationError>;

impl From<AutomationError> for qaflow_common::Error {
    fn from(e: AutomationError) -> Self {
        qaflow_common::Error::Automation(e.to_string())
    }
}
