//! Playwright browser automation
//!
//! Every primitive is one generated Node.js script. A session keeps its
//! cookies and local storage in a `storageState` file inside its private
//! working directory and replays the current URL at the start of each
//! script, so consecutive primitives observe one continuous browser.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qaflow_common::{BrowserAction, NetworkExchange};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::driver::{ActionOutcome, BrowserDriver, BrowserSession, DomSnapshot, ElementState, PageInfo};
use crate::error::{AutomationError, AutomationResult};

/// Prefix of the single result line a script prints on stdout
const OUTPUT_MARKER: &str = "__QAFLOW_RESULT__";

/// Name of the storage state file inside a session directory
const STATE_FILE: &str = "storage-state.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    /// Node.js executable
    pub node_binary: String,
    /// `NODE_PATH` used to resolve the `playwright` package
    pub node_path: Option<PathBuf>,
    /// Root directory for screenshots; one subdirectory per run
    pub screenshot_dir: PathBuf,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub browser: Browser,
    pub headless: bool,
    pub navigation_timeout_ms: u64,
    /// Upper bound on a single script process
    pub script_timeout_secs: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            node_path: None,
            screenshot_dir: PathBuf::from("qaflow-results/screenshots"),
            viewport_width: 1280,
            viewport_height: 720,
            browser: Browser::Chromium,
            headless: true,
            navigation_timeout_ms: 30_000,
            script_timeout_secs: 120,
        }
    }
}

/// Launches Playwright-backed sessions
pub struct PlaywrightDriver {
    config: Arc<PlaywrightConfig>,
}

impl PlaywrightDriver {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Check that Node.js can load the `playwright` package
    pub async fn verify(&self) -> AutomationResult<()> {
        let mut cmd = Command::new(&self.config.node_binary);
        cmd.args(["-e", "require('playwright')"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(node_path) = &self.config.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        match cmd.status().await {
            Ok(status) if status.success() => Ok(()),
            _ => Err(AutomationError::PlaywrightNotFound),
        }
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    fn name(&self) -> &'static str {
        "playwright"
    }

    async fn launch(&self, run_id: &str) -> AutomationResult<Box<dyn BrowserSession>> {
        let workdir = tempfile::Builder::new()
            .prefix(&format!("qaflow-{}-", run_id))
            .tempdir()?;
        let screenshot_dir = self.config.screenshot_dir.join(run_id);
        tokio::fs::create_dir_all(&screenshot_dir).await?;

        let id = uuid::Uuid::new_v4().to_string();
        debug!(session = %id, run_id, "Launched Playwright session in {}", workdir.path().display());

        Ok(Box::new(PlaywrightSession {
            id,
            config: Arc::clone(&self.config),
            screenshot_dir,
            seq: AtomicU64::new(0),
            state: Mutex::new(PageState {
                workdir: Some(workdir),
                current_url: None,
                network: Vec::new(),
            }),
        }))
    }
}

struct PageState {
    /// `None` once closed
    workdir: Option<TempDir>,
    current_url: Option<String>,
    /// Exchanges since the last navigation
    network: Vec<NetworkExchange>,
}

/// Whether a script starts by reopening the current page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Fresh,
    CurrentPage,
}

#[derive(Debug, Default, Deserialize)]
struct ScriptOutput {
    ok: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    steps: Vec<ActionOutcome>,
    #[serde(default)]
    network: Vec<NetworkExchange>,
    #[serde(default)]
    navigated: bool,
    #[serde(default)]
    error: Option<String>,
}

/// One isolated Playwright browser context
pub struct PlaywrightSession {
    id: String,
    config: Arc<PlaywrightConfig>,
    screenshot_dir: PathBuf,
    seq: AtomicU64,
    /// Serializes scripts of this session
    state: Mutex<PageState>,
}

impl PlaywrightSession {
    async fn execute(&self, replay: Replay, body: &str, timeout: Duration) -> AutomationResult<ScriptOutput> {
        let mut state = self.state.lock().await;
        let workdir = state
            .workdir
            .as_ref()
            .ok_or_else(|| AutomationError::SessionClosed(self.id.clone()))?
            .path()
            .to_path_buf();

        let replay_url = match replay {
            Replay::CurrentPage => state.current_url.clone(),
            Replay::Fresh => None,
        };
        let script = build_script(&self.config, &workdir, replay_url.as_deref(), body);
        let output = self.run_script(&workdir, &script, timeout).await?;

        if let Some(url) = output.url.as_ref().filter(|u| !u.is_empty() && *u != "about:blank") {
            state.current_url = Some(url.clone());
        }
        if output.navigated {
            state.network = output.network.clone();
        } else {
            state.network.extend(output.network.iter().cloned());
        }

        Ok(output)
    }

    async fn run_script(&self, workdir: &Path, script: &str, timeout: Duration) -> AutomationResult<ScriptOutput> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let script_path = workdir.join(format!("op-{}.js", seq));
        tokio::fs::write(&script_path, script).await?;

        debug!(session = %self.id, "Running Playwright script: {}", script_path.display());

        let mut cmd = Command::new(&self.config.node_binary);
        cmd.arg(&script_path)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(node_path) = &self.config.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AutomationError::Timeout(format!(
                    "script {} after {}s",
                    seq,
                    timeout.as_secs()
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_output(&stdout)? {
            Some(parsed) => Ok(parsed),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(AutomationError::Playwright(format!(
                    "script exited with {} without a result: {}",
                    output.status,
                    tail(&stderr, 800)
                )))
            }
        }
    }

    fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.config.script_timeout_secs.max(1))
    }

    fn state_path(workdir: &Path) -> PathBuf {
        workdir.join(STATE_FILE)
    }

    async fn workdir(&self) -> AutomationResult<PathBuf> {
        let state = self.state.lock().await;
        state
            .workdir
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| AutomationError::SessionClosed(self.id.clone()))
    }
}

#[async_trait]
impl BrowserSession for PlaywrightSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> AutomationResult<PageInfo> {
        let body = format!(
            "    navMark = network.length;\n    navigated = true;\n    const resp = await page.goto({}, {{ waitUntil: 'load' }});\n    result = {{ status: resp ? resp.status() : null }};\n",
            js(url)
        );
        let output = self.execute(Replay::Fresh, &body, self.script_timeout()).await?;
        if !output.ok {
            return Err(AutomationError::Navigation {
                url: url.to_string(),
                reason: output.error.unwrap_or_default(),
            });
        }

        Ok(PageInfo {
            url: output.url.unwrap_or_else(|| url.to_string()),
            title: output.title.unwrap_or_default(),
            status_code: output
                .result
                .get("status")
                .and_then(|s| s.as_u64())
                .and_then(|s| u16::try_from(s).ok()),
        })
    }

    async fn current_url(&self) -> AutomationResult<String> {
        let state = self.state.lock().await;
        if state.workdir.is_none() {
            return Err(AutomationError::SessionClosed(self.id.clone()));
        }
        Ok(state.current_url.clone().unwrap_or_default())
    }

    async fn snapshot(&self) -> AutomationResult<DomSnapshot> {
        let body = format!("    result = await page.evaluate({});\n", SNAPSHOT_FN);
        let output = self.execute(Replay::CurrentPage, &body, self.script_timeout()).await?;
        if !output.ok {
            return Err(AutomationError::Playwright(output.error.unwrap_or_default()));
        }
        Ok(serde_json::from_value(output.result)?)
    }

    async fn query(&self, selector: &str) -> AutomationResult<ElementState> {
        let body = format!(
            r#"    const loc = page.locator({sel});
    const count = await loc.count();
    result = {{
      count,
      visible: count > 0 ? await loc.first().isVisible() : false,
      text: count > 0 ? (await loc.first().innerText()).slice(0, 500) : '',
    }};
"#,
            sel = js(selector)
        );
        let output = self.execute(Replay::CurrentPage, &body, self.script_timeout()).await?;
        if !output.ok {
            return Err(AutomationError::Playwright(output.error.unwrap_or_default()));
        }
        Ok(serde_json::from_value(output.result)?)
    }

    async fn run_actions(
        &self,
        actions: &[BrowserAction],
        step_timeout_ms: u64,
    ) -> AutomationResult<Vec<ActionOutcome>> {
        for action in actions {
            if let BrowserAction::Log { message } = action {
                info!(session = %self.id, "[TEST LOG] {}", message);
            }
        }

        let body = steps_to_js(actions, step_timeout_ms, &self.screenshot_dir);
        // Budget every step plus one navigation for the replay
        let budget_ms = step_timeout_ms
            .saturating_mul(actions.len() as u64 + 1)
            .saturating_add(self.config.navigation_timeout_ms);
        let timeout = Duration::from_millis(budget_ms).min(self.script_timeout().saturating_mul(4));

        let replay = if matches!(actions.first(), Some(BrowserAction::Navigate { .. })) {
            Replay::Fresh
        } else {
            Replay::CurrentPage
        };
        let output = self.execute(replay, &body, timeout).await?;
        if !output.ok && output.steps.is_empty() {
            return Err(AutomationError::Playwright(output.error.unwrap_or_default()));
        }
        Ok(output.steps)
    }

    async fn screenshot(&self, name: &str) -> AutomationResult<PathBuf> {
        let path = self.screenshot_dir.join(format!("{}.png", sanitize_file_name(name)));
        let body = format!(
            "    await page.screenshot({{ path: {}, fullPage: true }});\n",
            js(&path.to_string_lossy())
        );
        let output = self.execute(Replay::CurrentPage, &body, self.script_timeout()).await?;
        if !output.ok {
            return Err(AutomationError::Playwright(output.error.unwrap_or_default()));
        }
        Ok(path)
    }

    async fn network_log(&self) -> AutomationResult<Vec<NetworkExchange>> {
        let state = self.state.lock().await;
        Ok(state.network.clone())
    }

    async fn storage_state(&self) -> AutomationResult<serde_json::Value> {
        let path = Self::state_path(&self.workdir().await?);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(serde_json::json!({ "cookies": [], "origins": [] }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn restore_storage_state(&self, state: &serde_json::Value) -> AutomationResult<()> {
        let path = Self::state_path(&self.workdir().await?);
        tokio::fs::write(&path, serde_json::to_vec(state)?).await?;
        Ok(())
    }

    async fn close(&self) -> AutomationResult<()> {
        let mut state = self.state.lock().await;
        if let Some(dir) = state.workdir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(session = %self.id, "Failed to remove {}: {}", path.display(), e);
            }
            state.current_url = None;
            state.network.clear();
            debug!(session = %self.id, "Closed Playwright session");
        }
        Ok(())
    }
}

/// JavaScript literal for a string
fn js(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim_end();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "screenshot".to_string()
    } else {
        cleaned
    }
}

/// Find and parse the result line
fn parse_output(stdout: &str) -> AutomationResult<Option<ScriptOutput>> {
    match stdout.lines().rev().find_map(|l| l.strip_prefix(OUTPUT_MARKER)) {
        Some(json) => serde_json::from_str(json)
            .map(Some)
            .map_err(|e| AutomationError::Protocol(format!("malformed result line: {}", e))),
        None => Ok(None),
    }
}

/// Build the full script around an operation body
fn build_script(config: &PlaywrightConfig, workdir: &Path, replay_url: Option<&str>, body: &str) -> String {
    let mut script = String::new();

    // Header
    script.push_str(&format!(
        r#"
const {{ chromium, firefox, webkit }} = require('playwright');
const fs = require('fs');

(async () => {{
  const statePath = {state_path};
  const browser = await {browser}.launch({{ headless: {headless} }});
  const context = await browser.newContext({{
    viewport: {{ width: {width}, height: {height} }},
    storageState: fs.existsSync(statePath) ? statePath : undefined,
  }});
  const page = await context.newPage();
  page.setDefaultNavigationTimeout({nav_timeout});
  const network = [];
  const started = new Map();
  page.on('request', (req) => started.set(req, Date.now()));
  page.on('response', (resp) => {{
    const req = resp.request();
    const t0 = started.get(req);
    network.push({{
      url: resp.url(),
      method: req.method(),
      status: resp.status(),
      duration_ms: t0 ? Date.now() - t0 : 0,
      resource_type: req.resourceType(),
    }});
  }});
  let navMark = 0;
  let navigated = false;
  let result = null;
  const steps = [];

  try {{
"#,
        state_path = js(&workdir.join(STATE_FILE).to_string_lossy()),
        browser = config.browser.as_str(),
        headless = config.headless,
        width = config.viewport_width,
        height = config.viewport_height,
        nav_timeout = config.navigation_timeout_ms,
    ));

    if let Some(url) = replay_url {
        script.push_str(&format!(
            "    await page.goto({}, {{ waitUntil: 'load' }});\n    navMark = network.length;\n",
            js(url)
        ));
    }

    script.push_str(body);

    // Footer
    script.push_str(&format!(
        r#"
    await context.storageState({{ path: statePath }});
    console.log({marker} + JSON.stringify({{
      ok: true, url: page.url(), title: await page.title(), result, steps,
      network: network.slice(navMark), navigated,
    }}));
  }} catch (error) {{
    console.log({marker} + JSON.stringify({{
      ok: false, error: String((error && error.message) || error), url: page.url(), steps,
      network: network.slice(navMark), navigated,
    }}));
  }} finally {{
    await browser.close();
  }}
}})();
"#,
        marker = js(OUTPUT_MARKER),
    ));

    script
}

/// Body running actions in order with per-step outcomes
fn steps_to_js(actions: &[BrowserAction], step_timeout_ms: u64, screenshot_dir: &Path) -> String {
    let mut body = String::from(
        r#"    const step = async (label, fn) => {
      const t0 = Date.now();
      try {
        const shot = await fn();
        steps.push({ label, success: true, duration_ms: Date.now() - t0, error: null, screenshot_path: shot || null });
        return true;
      } catch (e) {
        steps.push({ label, success: false, duration_ms: Date.now() - t0, error: String((e && e.message) || e), screenshot_path: null });
        return false;
      }
    };
    let ok = true;
"#,
    );

    for (i, action) in actions.iter().enumerate() {
        body.push_str(&format!("\n    // Step {}: {}\n", i + 1, action.label()));
        body.push_str(&format!(
            "    ok = ok && await step({}, async () => {{\n{}\n    }});\n",
            js(&action.label()),
            action_to_js(action, step_timeout_ms, screenshot_dir)
        ));
    }

    body
}

/// Convert an action to JavaScript code
fn action_to_js(action: &BrowserAction, step_timeout_ms: u64, screenshot_dir: &Path) -> String {
    let t = step_timeout_ms;
    match action {
        BrowserAction::Navigate { url } => format!(
            "      navMark = network.length;\n      navigated = true;\n      await page.goto({}, {{ waitUntil: 'load', timeout: {} }});",
            js(url),
            t
        ),
        BrowserAction::Click { selector, timeout_ms } => format!(
            "      await page.click({}, {{ timeout: {} }});\n      await page.waitForLoadState('load').catch(() => {{}});",
            js(selector),
            timeout_ms.unwrap_or(t).min(t)
        ),
        BrowserAction::Fill { selector, value } => format!(
            "      await page.fill({}, {}, {{ timeout: {} }});",
            js(selector),
            js(value),
            t
        ),
        BrowserAction::Press { selector, key } => match selector {
            Some(sel) => format!(
                "      await page.locator({}).press({}, {{ timeout: {} }});\n      await page.waitForLoadState('load').catch(() => {{}});",
                js(sel),
                js(key),
                t
            ),
            None => format!("      await page.keyboard.press({});", js(key)),
        },
        BrowserAction::Wait {
            selector,
            timeout_ms,
            state,
        } => format!(
            "      await page.waitForSelector({}, {{ state: '{}', timeout: {} }});",
            js(selector),
            state.as_str(),
            (*timeout_ms).min(t)
        ),
        BrowserAction::Sleep { ms } => format!("      await page.waitForTimeout({});", (*ms).min(t)),
        BrowserAction::Assert {
            selector,
            visible,
            text_contains,
            min_count,
        } => {
            let sel = js(selector);
            let mut lines = vec![format!("      const loc = page.locator({});", sel)];
            match visible {
                Some(true) => lines.push(format!(
                    "      await loc.first().waitFor({{ state: 'visible', timeout: {} }});",
                    t
                )),
                Some(false) => lines.push(format!(
                    "      if ((await loc.count()) > 0 && (await loc.first().isVisible())) throw new Error('expected ' + {} + ' to be hidden');",
                    sel
                )),
                None => {}
            }
            if let Some(text) = text_contains {
                lines.push(format!(
                    "      const text = await loc.first().innerText({{ timeout: {} }});\n      if (!text.includes({})) throw new Error('text of ' + {} + ' does not contain ' + {});",
                    t,
                    js(text),
                    sel,
                    js(text)
                ));
            }
            if let Some(n) = min_count {
                lines.push(format!(
                    "      const n = await loc.count();\n      if (n < {}) throw new Error('expected at least {} matches for ' + {} + ', found ' + n);",
                    n, n, sel
                ));
            }
            if visible.is_none() && text_contains.is_none() && min_count.is_none() {
                lines.push(format!(
                    "      if ((await loc.count()) === 0) throw new Error('no element matches ' + {});",
                    sel
                ));
            }
            lines.join("\n")
        }
        BrowserAction::AssertUrl { changed_from, contains } => {
            let mut lines = vec!["      const current = page.url();".to_string()];
            if let Some(from) = changed_from {
                lines.push(format!(
                    "      if (current === {}) throw new Error('URL did not change from ' + current);",
                    js(from)
                ));
            }
            if let Some(part) = contains {
                lines.push(format!(
                    "      if (!current.includes({})) throw new Error('URL ' + current + ' does not contain ' + {});",
                    js(part),
                    js(part)
                ));
            }
            lines.join("\n")
        }
        BrowserAction::AssertNoServerErrors => r#"      const bad = network.slice(navMark).filter((n) => n.status >= 500);
      if (bad.length) throw new Error('server errors: ' + bad.map((n) => n.status + ' ' + n.url).join(', '));"#
            .to_string(),
        BrowserAction::Screenshot { name } => {
            let path = screenshot_dir.join(format!("{}.png", sanitize_file_name(name)));
            let path = js(&path.to_string_lossy());
            format!(
                "      await page.screenshot({{ path: {}, fullPage: true }});\n      return {};",
                path, path
            )
        }
        BrowserAction::Log { message } => format!("      console.error('[TEST] ' + {});", js(message)),
    }
}

/// Page structure extraction, evaluated in the page
const SNAPSHOT_FN: &str = r##"() => {
      const cssPath = (el) => {
        if (el.id) return '#' + CSS.escape(el.id);
        const name = el.getAttribute('name');
        if (name) return el.tagName.toLowerCase() + '[name="' + name + '"]';
        const testId = el.getAttribute('data-testid');
        if (testId) return '[data-testid="' + testId + '"]';
        const path = [];
        let node = el;
        while (node && node.nodeType === 1 && path.length < 5) {
          let sel = node.tagName.toLowerCase();
          const parent = node.parentElement;
          if (parent) {
            const same = Array.from(parent.children).filter((c) => c.tagName === node.tagName);
            if (same.length > 1) sel += ':nth-of-type(' + (same.indexOf(node) + 1) + ')';
          }
          path.unshift(sel);
          node = parent;
        }
        return path.join(' > ');
      };
      const visible = (el) => !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
      const label = (el) => (el.getAttribute('aria-label') || el.getAttribute('placeholder') || el.innerText || el.getAttribute('name') || el.value || '').trim().slice(0, 80);
      const controls = [];
      const push = (kind, el, extra) => controls.push(Object.assign({ kind, selector: cssPath(el), label: label(el), href: null, required: !!el.required, item_count: null }, extra || {}));
      document.querySelectorAll('a[href]').forEach((el) => { if (visible(el)) push('link', el, { href: el.href }); });
      document.querySelectorAll('button, input[type=submit], input[type=button], [role=button]').forEach((el) => { if (visible(el)) push('button', el); });
      document.querySelectorAll('input').forEach((el) => {
        if (!visible(el)) return;
        const t = (el.type || 'text').toLowerCase();
        if (t === 'password') push('password_input', el);
        else if (t === 'search' || /search|query|^q$/i.test(el.name || el.placeholder || '')) push('search_input', el);
        else if (t === 'checkbox' || t === 'radio') push('checkbox', el);
        else if (['text', 'email', 'tel', 'number', 'url', 'date'].includes(t)) push('text_input', el);
      });
      document.querySelectorAll('select').forEach((el) => { if (visible(el)) push('select', el); });
      document.querySelectorAll('textarea').forEach((el) => { if (visible(el)) push('textarea', el); });
      document.querySelectorAll('form').forEach((el) => push('form', el, { label: '' }));
      document.querySelectorAll('table, [role=grid]').forEach((el) => push('table', el, { label: '', item_count: el.querySelectorAll('tbody tr, [role=row]').length }));
      document.querySelectorAll('ul, ol').forEach((el) => { if (el.children.length >= 3 && !el.closest('nav')) push('list', el, { label: '', item_count: el.children.length }); });
      document.querySelectorAll('nav, [role=navigation], aside').forEach((el) => push('nav', el, { label: el.tagName.toLowerCase() }));
      document.querySelectorAll('.pagination, [aria-label*=pagination i], nav[aria-label*=page i]').forEach((el) => push('pagination', el, { label: '' }));
      const classes = new Set();
      Array.from(document.querySelectorAll('[class]')).slice(0, 500).forEach((el) => {
        String(el.className).split(/\s+/).forEach((c) => { if (c) classes.add(c.split('-')[0]); });
      });
      return {
        url: location.href,
        title: document.title,
        controls,
        text_excerpt: document.body ? document.body.innerText.slice(0, 2000) : '',
        class_hints: Array.from(classes).slice(0, 200),
        has_password_field: !!document.querySelector('input[type=password]'),
        validation_messages: Array.from(document.querySelectorAll(':invalid')).map((e) => e.validationMessage).filter(Boolean).slice(0, 20),
      };
    }"##;

#[cfg(test)]
mod tests {
    use super::*;
    use qaflow_common::WaitState;

    #[test]
    fn test_js_literals_escape_quotes() {
        assert_eq!(js(r#"a'b"c"#), r#""a'b\"c""#);
        assert_eq!(js("line\nbreak"), r#""line\nbreak""#);
    }

    #[test]
    fn test_build_script_replays_current_page() {
        let config = PlaywrightConfig::default();
        let script = build_script(&config, Path::new("/tmp/s"), Some("https://app.test/orders"), "    // body\n");
        assert!(script.contains("chromium.launch({ headless: true })"));
        assert!(script.contains(r#"await page.goto("https://app.test/orders""#));
        assert!(script.contains(r#"const statePath = "/tmp/s/storage-state.json";"#));
        assert!(script.contains("// body"));
        assert!(script.contains(OUTPUT_MARKER));

        let fresh = build_script(&config, Path::new("/tmp/s"), None, "");
        assert!(!fresh.contains("await page.goto("));
    }

    #[test]
    fn test_steps_stop_at_first_failure() {
        let actions = vec![
            BrowserAction::Fill {
                selector: "input[name='q']".into(),
                value: "it's".into(),
            },
            BrowserAction::Press {
                selector: Some("input[name='q']".into()),
                key: "Enter".into(),
            },
            BrowserAction::Wait {
                selector: "table".into(),
                timeout_ms: 60_000,
                state: WaitState::Visible,
            },
        ];
        let body = steps_to_js(&actions, 5000, Path::new("/tmp/shots"));
        assert_eq!(body.matches("ok = ok && await step(").count(), 3);
        assert!(body.contains(r#"await page.fill("input[name='q']", "it's", { timeout: 5000 });"#));
        // Wait is capped by the step timeout
        assert!(body.contains("state: 'visible', timeout: 5000"));
    }

    #[test]
    fn test_assert_without_expectations_requires_presence() {
        let action = BrowserAction::Assert {
            selector: "table tbody tr".into(),
            visible: None,
            text_contains: None,
            min_count: None,
        };
        let code = action_to_js(&action, 5000, Path::new("/tmp"));
        assert!(code.contains("no element matches"));

        let action = BrowserAction::Assert {
            selector: "li".into(),
            visible: Some(true),
            text_contains: None,
            min_count: Some(2),
        };
        let code = action_to_js(&action, 5000, Path::new("/tmp"));
        assert!(code.contains("waitFor({ state: 'visible'"));
        assert!(code.contains("if (n < 2)"));
        assert!(!code.contains("no element matches"));
    }

    #[test]
    fn test_screenshot_step_returns_path() {
        let action = BrowserAction::Screenshot {
            name: "case 1/fail".into(),
        };
        let code = action_to_js(&action, 5000, Path::new("/tmp/shots"));
        assert!(code.contains(r#"return "/tmp/shots/case_1_fail.png";"#));
    }

    #[test]
    fn test_parse_output_uses_marker_line() {
        let stdout = format!(
            "noise\n{}{}\n",
            OUTPUT_MARKER,
            r#"{"ok":true,"url":"https://app.test/","title":"Home","result":{"status":200},"steps":[],"network":[{"url":"https://app.test/","method":"GET","status":200,"duration_ms":12,"resource_type":"document"}],"navigated":true}"#
        );
        let parsed = parse_output(&stdout).unwrap().unwrap();
        assert!(parsed.ok);
        assert!(parsed.navigated);
        assert_eq!(parsed.network.len(), 1);
        assert_eq!(parsed.result["status"], 200);

        assert!(parse_output("nothing here").unwrap().is_none());
        let broken = format!("{}{{not json", OUTPUT_MARKER);
        assert!(matches!(parse_output(&broken), Err(AutomationError::Protocol(_))));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "é".repeat(10);
        let out = tail(&text, 5);
        assert!(out.len() <= 6);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let shots = tempfile::tempdir().unwrap();
        let driver = PlaywrightDriver::new(PlaywrightConfig {
            screenshot_dir: shots.path().to_path_buf(),
            ..Default::default()
        });
        let session = driver.launch("run-1").await.unwrap();
        session
            .restore_storage_state(&serde_json::json!({"cookies": [], "origins": []}))
            .await
            .unwrap();
        assert_eq!(session.storage_state().await.unwrap()["cookies"], serde_json::json!([]));
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.current_url().await,
            Err(AutomationError::SessionClosed(_))
        ));
        assert!(matches!(
            session.storage_state().await,
            Err(AutomationError::SessionClosed(_))
        ));
    }
}
