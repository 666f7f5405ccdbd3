//! Scoped browser session lifetime
//!
//! `acquire` hands out a [`SessionHandle`]; `release` consumes it and closes
//! the session. A handle dropped without release is a leak: it is counted,
//! logged at `error`, and the session is still closed in the background.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::driver::{BrowserDriver, BrowserSession};
use crate::error::AutomationResult;

/// Session counters
#[derive(Debug, Default)]
pub struct SessionStats {
    acquired: AtomicU64,
    released: AtomicU64,
    leaked: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub acquired: u64,
    pub released: u64,
    pub leaked: u64,
    pub active: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionCounts {
        let acquired = self.acquired.load(Ordering::SeqCst);
        let released = self.released.load(Ordering::SeqCst);
        let leaked = self.leaked.load(Ordering::SeqCst);
        SessionCounts {
            acquired,
            released,
            leaked,
            active: acquired.saturating_sub(released + leaked),
        }
    }
}

/// Hands out isolated sessions and tracks their release
pub struct SessionManager {
    driver: Arc<dyn BrowserDriver>,
    /// session id -> run id
    active: Arc<DashMap<String, String>>,
    stats: Arc<SessionStats>,
}

impl SessionManager {
    pub fn new(driver: Arc<dyn BrowserDriver>) -> Self {
        Self {
            driver,
            active: Arc::new(DashMap::new()),
            stats: Arc::new(SessionStats::default()),
        }
    }

    /// Launch an isolated session for a run
    pub async fn acquire(&self, run_id: &str) -> AutomationResult<SessionHandle> {
        let session = self.driver.launch(run_id).await?;
        let id = session.id().to_string();

        self.active.insert(id.clone(), run_id.to_string());
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(session = %id, run_id, driver = self.driver.name(), "Acquired browser session");

        Ok(SessionHandle {
            id,
            run_id: run_id.to_string(),
            session: Arc::from(session),
            released: false,
            active: Arc::clone(&self.active),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Close the session; counted as released even if closing fails
    pub async fn release(&self, mut handle: SessionHandle) {
        handle.released = true;
        if let Err(e) = handle.session.close().await {
            warn!(session = %handle.id, run_id = %handle.run_id, "Error closing browser session: {}", e);
        }
        self.active.remove(&handle.id);
        self.stats.released.fetch_add(1, Ordering::SeqCst);
        debug!(session = %handle.id, run_id = %handle.run_id, "Released browser session");
    }

    pub fn stats(&self) -> SessionCounts {
        self.stats.snapshot()
    }

    /// Sessions currently held by a run
    pub fn active_for(&self, run_id: &str) -> usize {
        self.active.iter().filter(|e| e.value() == run_id).count()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Exclusive access to one acquired session
pub struct SessionHandle {
    id: String,
    run_id: String,
    session: Arc<dyn BrowserSession>,
    released: bool,
    active: Arc<DashMap<String, String>>,
    stats: Arc<SessionStats>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The session primitives
    pub fn session(&self) -> &dyn BrowserSession {
        self.session.as_ref()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        self.active.remove(&self.id);
        self.stats.leaked.fetch_add(1, Ordering::SeqCst);
        error!(
            session = %self.id,
            run_id = %self.run_id,
            "Browser session dropped without release"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let id = self.id.clone();
                let session = Arc::clone(&self.session);
                rt.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!(session = %id, "Error closing leaked session: {}", e);
                    }
                });
            }
            Err(_) => warn!(session = %self.id, "No runtime to close leaked session"),
        }
    }
}
