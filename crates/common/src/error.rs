//! Error types for qaflow

use thiserror::Error;

use crate::types::FailureKind;

/// Result type alias using qaflow Error
pub type Result<T> = std::result::Result<T, Error>;

/// qaflow error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Guard violation: {0}")]
    Guard(String),

    #[error("Automation error: {0}")]
    Automation(String),

    #[error("Login error: {0}")]
    Login(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("Answer rejected: {0}")]
    AnswerRejected(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error for a run's terminal failure record
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Guard(_) => FailureKind::Guard,
            Error::Automation(_) => FailureKind::Automation,
            Error::Login(_) => FailureKind::Login,
            Error::Database(_) | Error::Persistence(_) => FailureKind::Persistence,
            Error::Cancelled => FailureKind::Cancelled,
            Error::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Internal,
        }
    }
}
