//! qaflow Common Library
//!
//! Shared run model, safety guards, secret redaction and persistence for the
//! qaflow orchestration engine.

pub mod action;
pub mod db;
pub mod error;
pub mod guard;
pub mod redact;
pub mod types;

// Re-export commonly used types
pub use action::{BrowserAction, WaitState};
pub use db::Database;
pub use error::{Error, Result};
pub use guard::{GuardPolicy, GuardVerdict};
pub use redact::{redact_value, sanitize_value, scrub_text, REDACTION_MARKER};
pub use types::*;

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".qaflow")
}
