//! Scripted collaborators for engine integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qaflow_browser::{
    ActionOutcome, AutomationError, AutomationResult, BrowserDriver, BrowserSession, DomSnapshot,
    ElementState, PageInfo,
};
use qaflow_common::{BrowserAction, Control, ControlKind, NetworkExchange, RunState};
use qaflow_engine::ai::{AiProvider, ProviderKind, ProviderResult};
use qaflow_engine::config::StoreBackend;
use qaflow_engine::{EngineConfig, Orchestrator};
use serde_json::{json, Map, Value};

pub const BASE_URL: &str = "https://app.test";

const LOGIN_PATH: &str = "/login";

pub fn control(kind: ControlKind, selector: &str, label: &str) -> Control {
    Control {
        kind,
        selector: selector.to_string(),
        label: label.to_string(),
        href: None,
        required: false,
        item_count: None,
    }
}

pub fn link(selector: &str, label: &str, path: &str) -> Control {
    Control {
        href: Some(format!("{}{}", BASE_URL, path)),
        ..control(ControlKind::Link, selector, label)
    }
}

fn key(url: &str) -> String {
    let url = url.split('#').next().unwrap_or(url);
    url.trim_end_matches('/').to_string()
}

fn absolute(url: &str) -> String {
    if url.starts_with('/') {
        format!("{}{}", BASE_URL, url)
    } else {
        url.to_string()
    }
}

/// An in-memory web application
#[derive(Clone, Default)]
pub struct Site {
    pages: HashMap<String, DomSnapshot>,
    /// Accepted username and password; every page redirects to the login
    /// form until they are submitted
    credentials: Option<(String, String)>,
    navigate_delay: Duration,
}

impl Site {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, path: &str, title: &str, text: &str, controls: Vec<Control>) -> Self {
        let url = format!("{}{}", BASE_URL, path);
        self.pages.insert(
            key(&url),
            DomSnapshot {
                url,
                title: title.to_string(),
                controls,
                text_excerpt: text.to_string(),
                ..Default::default()
            },
        );
        self
    }

    pub fn with_login(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn with_navigate_delay(mut self, delay: Duration) -> Self {
        self.navigate_delay = delay;
        self
    }

    /// Dashboard, an orders listing with search, an order form and a detail page
    pub fn shop() -> Self {
        let mut orders_table = control(ControlKind::Table, "#orders", "Orders");
        orders_table.item_count = Some(3);
        let mut name_field = control(ControlKind::TextInput, "#name", "Customer name");
        name_field.required = true;

        Site::new()
            .page(
                "/",
                "Dashboard",
                "Welcome back. Log out",
                vec![
                    control(ControlKind::Nav, "#sidebar", "Main"),
                    link("#nav-orders", "Orders", "/orders"),
                    link("#nav-new", "New order", "/orders/new"),
                    link("#nav-logout", "Log out", "/logout"),
                ],
            )
            .page(
                "/orders",
                "Orders",
                "3 orders. Log out",
                vec![
                    control(ControlKind::Nav, "#sidebar", "Main"),
                    orders_table,
                    control(ControlKind::SearchInput, "#search", "Search orders"),
                    link("#order-42", "Order 42", "/orders/42"),
                    link("#nav-home", "Home", "/"),
                ],
            )
            .page(
                "/orders/new",
                "New order",
                "Create an order",
                vec![
                    control(ControlKind::Form, "#order-form", ""),
                    name_field,
                    control(ControlKind::Button, "#save", "Save"),
                ],
            )
            .page(
                "/orders/42",
                "Order 42",
                "Order details",
                vec![link("#back", "Back to orders", "/orders")],
            )
    }

    /// A site with `count` chained pages, for long crawls
    pub fn chain(count: usize) -> Self {
        let mut site = Site::new();
        for i in 0..count {
            let path = if i == 0 { "/".to_string() } else { format!("/section-{}", i) };
            let mut controls = vec![control(ControlKind::Nav, "#nav", "Main")];
            // A distinct control per page keeps signatures apart
            controls.push(control(ControlKind::Button, &format!("#action-{}", i), "Action"));
            controls.push(link(&format!("#next-{}", i), "Next", &format!("/section-{}", i + 1)));
            site = site.page(&path, &format!("Section {}", i), "Log out", controls);
        }
        site
    }

    fn login_page(&self, failed: bool) -> DomSnapshot {
        DomSnapshot {
            url: format!("{}{}", BASE_URL, LOGIN_PATH),
            title: "Sign in".to_string(),
            controls: vec![
                control(ControlKind::Form, "#login-form", ""),
                control(ControlKind::TextInput, "#username", "Username"),
                control(ControlKind::PasswordInput, "#password", "Password"),
                control(ControlKind::Button, "#sign-in", "Sign in"),
            ],
            text_excerpt: "Please sign in".to_string(),
            has_password_field: true,
            validation_messages: if failed {
                vec!["Invalid username or password".to_string()]
            } else {
                Vec::new()
            },
            ..Default::default()
        }
    }

    /// Landing URL, page and document status for a request
    fn resolve(&self, url: &str, authenticated: bool, login_failed: bool) -> (String, DomSnapshot, u16) {
        if self.credentials.is_some() && !authenticated {
            let page = self.login_page(login_failed);
            return (page.url.clone(), page, 200);
        }
        match self.pages.get(&key(url)) {
            Some(page) => (page.url.clone(), page.clone(), 200),
            None => (
                url.to_string(),
                DomSnapshot {
                    url: url.to_string(),
                    title: "Not Found".to_string(),
                    text_excerpt: "404 page not found".to_string(),
                    ..Default::default()
                },
                404,
            ),
        }
    }
}

#[derive(Default)]
struct SessionState {
    url: String,
    authenticated: bool,
    login_failed: bool,
    fields: HashMap<String, String>,
    network: Vec<NetworkExchange>,
    closed: bool,
}

/// Driver over a [`Site`]; every session has its own cookie jar
pub struct ScriptedDriver {
    site: Arc<Site>,
    launched: AtomicUsize,
    closed: Arc<AtomicUsize>,
    visits: Arc<AtomicUsize>,
}

impl ScriptedDriver {
    pub fn new(site: Site) -> Self {
        Self {
            site: Arc::new(site),
            launched: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            visits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Navigations across all sessions
    pub fn visits(&self) -> usize {
        self.visits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn launch(&self, run_id: &str) -> AutomationResult<Box<dyn BrowserSession>> {
        let n = self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            id: format!("{}-{}", run_id, n),
            site: Arc::clone(&self.site),
            state: Mutex::new(SessionState::default()),
            closed: Arc::clone(&self.closed),
            visits: Arc::clone(&self.visits),
        }))
    }
}

pub struct ScriptedSession {
    id: String,
    site: Arc<Site>,
    state: Mutex<SessionState>,
    closed: Arc<AtomicUsize>,
    visits: Arc<AtomicUsize>,
}

impl ScriptedSession {
    fn visit(&self, url: &str) -> AutomationResult<PageInfo> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AutomationError::SessionClosed(self.id.clone()));
        }
        let (landed, page, status) = self.site.resolve(&absolute(url), state.authenticated, false);
        state.url = landed.clone();
        state.login_failed = false;
        state.network = vec![NetworkExchange {
            url: landed.clone(),
            method: "GET".to_string(),
            status,
            duration_ms: 5,
            resource_type: "document".to_string(),
        }];
        self.visits.fetch_add(1, Ordering::SeqCst);
        Ok(PageInfo {
            url: landed,
            title: page.title,
            status_code: Some(status),
        })
    }

    /// Submitting the login form checks the filled fields
    fn submit(&self) {
        let mut state = self.state.lock();
        let Some((username, password)) = &self.site.credentials else {
            return;
        };
        if state.authenticated || !state.url.ends_with(LOGIN_PATH) {
            return;
        }
        let matches = state.fields.get("#username") == Some(username)
            && state.fields.get("#password") == Some(password);
        if matches {
            state.authenticated = true;
            state.url = format!("{}/", BASE_URL);
        } else {
            state.login_failed = true;
        }
    }

    fn perform(&self, action: &BrowserAction) -> Result<(), String> {
        match action {
            BrowserAction::Navigate { url } => self.visit(url).map(|_| ()).map_err(|e| e.to_string()),
            BrowserAction::Fill { selector, value } => {
                self.state.lock().fields.insert(selector.clone(), value.clone());
                Ok(())
            }
            BrowserAction::Click { selector, .. } => {
                if selector.contains("missing") {
                    return Err(format!("no element matches {}", selector));
                }
                self.submit();
                Ok(())
            }
            BrowserAction::Press { .. } => {
                self.submit();
                Ok(())
            }
            BrowserAction::Wait { selector, .. } | BrowserAction::Assert { selector, .. } => {
                if selector.contains("missing") {
                    Err(format!("no element matches {}", selector))
                } else {
                    Ok(())
                }
            }
            BrowserAction::AssertUrl { changed_from, contains } => {
                let url = self.state.lock().url.clone();
                if let Some(from) = changed_from {
                    if key(from) == key(&url) {
                        return Err(format!("url did not change from {}", from));
                    }
                }
                if let Some(part) = contains {
                    if !url.contains(part.as_str()) {
                        return Err(format!("{} does not contain {}", url, part));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> AutomationResult<PageInfo> {
        if !self.site.navigate_delay.is_zero() {
            tokio::time::sleep(self.site.navigate_delay).await;
        }
        self.visit(url)
    }

    async fn current_url(&self) -> AutomationResult<String> {
        Ok(self.state.lock().url.clone())
    }

    async fn snapshot(&self) -> AutomationResult<DomSnapshot> {
        let state = self.state.lock();
        let (_, page, _) = self.site.resolve(&state.url, state.authenticated, state.login_failed);
        Ok(page)
    }

    async fn query(&self, selector: &str) -> AutomationResult<ElementState> {
        let found = !selector.contains("missing");
        Ok(ElementState {
            count: usize::from(found),
            visible: found,
            text: String::new(),
        })
    }

    async fn run_actions(&self, actions: &[BrowserAction], _step_timeout_ms: u64) -> AutomationResult<Vec<ActionOutcome>> {
        let mut outcomes = Vec::new();
        for action in actions {
            let result = self.perform(action);
            let success = result.is_ok();
            outcomes.push(ActionOutcome {
                label: action.label(),
                success,
                duration_ms: 1,
                error: result.err(),
                screenshot_path: None,
            });
            if !success {
                break;
            }
        }
        Ok(outcomes)
    }

    async fn screenshot(&self, name: &str) -> AutomationResult<PathBuf> {
        Ok(PathBuf::from(format!("/tmp/qaflow-scripted/{}.png", name)))
    }

    async fn network_log(&self) -> AutomationResult<Vec<NetworkExchange>> {
        Ok(self.state.lock().network.clone())
    }

    async fn storage_state(&self) -> AutomationResult<Value> {
        Ok(json!({ "authenticated": self.state.lock().authenticated }))
    }

    async fn restore_storage_state(&self, stored: &Value) -> AutomationResult<()> {
        self.state.lock().authenticated = stored["authenticated"].as_bool().unwrap_or(false);
        Ok(())
    }

    async fn close(&self) -> AutomationResult<()> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// AI provider replying with fixed text
pub struct ScriptedProvider {
    reply: String,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn generate_text(
        &self,
        _prompt: &str,
        _system_prompt: Option<&str>,
        _temperature: f32,
        _max_tokens: u32,
    ) -> ProviderResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Engine configuration rooted in a temporary directory
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.store_path = dir.to_path_buf();
    config.store.backend = StoreBackend::Memory;
    config.discovery.max_pages = 10;
    config.execution.run_timeout_secs = 30;
    config.execution.step_timeout_ms = 1_000;
    config
}

pub fn test_tenant() -> Map<String, Value> {
    let mut variables = Map::new();
    variables.insert("testTenant".to_string(), Value::Bool(true));
    variables
}

pub async fn orchestrator(config: EngineConfig, driver: Arc<ScriptedDriver>) -> Orchestrator {
    Orchestrator::new(config, driver).await.unwrap()
}

/// Poll until the run reaches `state`
pub async fn wait_for_state(orchestrator: &Orchestrator, run_id: &str, state: RunState) {
    for _ in 0..500 {
        if orchestrator.status(run_id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {} never reached {}", run_id, state);
}
