//! qaflow browser sessions
//!
//! This crate exposes browser automation as a capability consumed by the
//! orchestration engine:
//! - `BrowserDriver` launches isolated `BrowserSession`s (own cookie and
//!   storage scope per session)
//! - `PlaywrightDriver` implements the capability by generating Node.js
//!   Playwright scripts per operation
//! - `SessionManager` hands out sessions with guaranteed release
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  SessionManager                                              │
//! │    ├── acquire(run_id) -> SessionHandle                      │
//! │    └── release(handle)            (Drop = leak, reported)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  BrowserSession                                              │
//! │    ├── navigate(url) -> PageInfo                             │
//! │    ├── snapshot() -> DomSnapshot                             │
//! │    ├── run_actions([BrowserAction]) -> [ActionOutcome]       │
//! │    ├── click / fill / screenshot / network_log               │
//! │    └── storage_state / restore_storage_state                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod driver;
pub mod error;
pub mod playwright;
pub mod session;

pub use driver::{ActionOutcome, BrowserDriver, BrowserSession, DomSnapshot, ElementState, PageInfo};
pub use error::{AutomationError, AutomationResult};
pub use playwright::{Browser, PlaywrightConfig, PlaywrightDriver};
pub use session::{SessionCounts, SessionHandle, SessionManager, SessionStats};
