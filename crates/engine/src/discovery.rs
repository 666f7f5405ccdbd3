//! Discovery pipeline
//!
//! Context detection, a breadth-first crawl deduplicated by structural
//! signature, and the summary shown to the operator at scope selection.
//! Discovery is best-effort: budget exhaustion and unreachable pages still
//! yield the pages found so far.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use qaflow_browser::{BrowserSession, DomSnapshot};
use qaflow_common::{
    now_millis, AppContext, Control, ControlKind, DiscoveredPage, DiscoverySummary, Error,
    FeatureType, NavStyle, PageKind, PageSignature, Result,
};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DiscoveryConfig;

static ID_SEGMENT: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)^(\d+|[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}|[0-9a-f]{16,})$").ok()
});

static SORT_LABEL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)sort|order by").ok());

static CREATE_LABEL: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^(\+\s*)?(new|add|create)\b").ok());

fn is_match(re: &Lazy<Option<Regex>>, text: &str) -> bool {
    re.as_ref().map_or(false, |re| re.is_match(text))
}

/// Class-name prefixes of recognised component libraries
const UI_LIBRARY_HINTS: &[(&str, &str)] = &[
    ("ant", "ant-design"),
    ("Mui", "material-ui"),
    ("mat", "angular-material"),
    ("mdc", "material-components"),
    ("chakra", "chakra-ui"),
    ("el", "element-ui"),
    ("navbar", "bootstrap"),
    ("btn", "bootstrap"),
    ("tw", "tailwind"),
];

/// Classify navigation layout and UI conventions of the landing page
pub fn detect_context(snapshot: &DomSnapshot) -> AppContext {
    let navs: Vec<&Control> = snapshot.controls_of(ControlKind::Nav).collect();
    let sidebar_hint = snapshot
        .class_hints
        .iter()
        .any(|c| c.eq_ignore_ascii_case("sidebar") || c.eq_ignore_ascii_case("sider"));
    let nav_style = if navs.iter().any(|n| {
        n.label == "aside" || n.selector.contains("aside") || n.selector.contains("sidebar")
    }) || (sidebar_hint && !navs.is_empty())
    {
        NavStyle::Sidebar
    } else if !navs.is_empty() {
        NavStyle::TopBar
    } else {
        NavStyle::Minimal
    };

    let hash_routing = snapshot.url.contains("#/")
        || snapshot
            .controls_of(ControlKind::Link)
            .filter_map(|l| l.href.as_deref())
            .any(|h| h.contains("#/"));

    let mut ui_libraries: Vec<String> = Vec::new();
    for (prefix, library) in UI_LIBRARY_HINTS {
        let found = snapshot.class_hints.iter().any(|c| {
            if prefix.starts_with(char::is_uppercase) {
                c.starts_with(prefix)
            } else {
                c == prefix
            }
        });
        if found && !ui_libraries.iter().any(|l| l == library) {
            ui_libraries.push(library.to_string());
        }
    }

    AppContext {
        nav_style,
        hash_routing,
        ui_libraries,
        nav_selector: navs.first().map(|n| n.selector.clone()),
    }
}

/// URL path with identifier-like segments replaced by `:id`
pub fn url_pattern(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let mut pattern: String = parsed
        .path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .map(|s| if is_match(&ID_SEGMENT, s) { ":id" } else { s })
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();
    pattern.insert(0, '/');
    if let Some(route) = parsed.fragment().filter(|f| f.starts_with('/')) {
        pattern.push('#');
        pattern.push_str(&url_pattern(&format!("http://h{}", route)));
    }
    pattern
}

/// Coarse page kind from structure and response status
pub fn classify_page(url: &str, snapshot: &DomSnapshot, status_code: Option<u16>) -> PageKind {
    if status_code.map_or(false, |s| s >= 400) {
        return PageKind::Error;
    }
    let title = snapshot.title.to_lowercase();
    if title.contains("not found") || title.contains("error") || title.starts_with("404") {
        return PageKind::Error;
    }
    if snapshot.has_password_field {
        return PageKind::Login;
    }

    let count = |kind| snapshot.controls_of(kind).count();
    let fields = count(ControlKind::TextInput) + count(ControlKind::Textarea) + count(ControlKind::Select);
    if count(ControlKind::Table) > 0 || count(ControlKind::Pagination) > 0 {
        return PageKind::Listing;
    }
    if count(ControlKind::Form) > 0 && fields >= 2 {
        return PageKind::Form;
    }
    let pattern = url_pattern(url);
    if pattern.ends_with(":id") || pattern.contains(":id/") {
        return PageKind::Detail;
    }
    if count(ControlKind::List) > 0 {
        return PageKind::Listing;
    }
    if title.contains("dashboard") || pattern.contains("dashboard") || pattern == "/" {
        return PageKind::Dashboard;
    }
    PageKind::Other
}

/// Feature types a page exposes
pub fn detect_features(url: &str, kind: PageKind, controls: &[Control]) -> BTreeSet<FeatureType> {
    let has = |k: ControlKind| controls.iter().any(|c| c.kind == k);
    let labelled = |re: &Lazy<Option<Regex>>| {
        controls
            .iter()
            .any(|c| c.kind != ControlKind::Link && is_match(re, c.label.trim()))
    };

    let mut features = BTreeSet::new();
    features.insert(FeatureType::Navigation);

    let listing = has(ControlKind::Table) || has(ControlKind::List);
    if listing {
        features.insert(FeatureType::Listing);
    }
    if has(ControlKind::SearchInput) {
        features.insert(FeatureType::Search);
    }
    if has(ControlKind::Pagination) {
        features.insert(FeatureType::Pagination);
    }
    if listing && (has(ControlKind::Select) || has(ControlKind::Checkbox)) {
        features.insert(FeatureType::Filters);
    }
    if labelled(&SORT_LABEL) {
        features.insert(FeatureType::Sort);
    }
    if has(ControlKind::Form) && (has(ControlKind::TextInput) || has(ControlKind::Textarea)) {
        features.insert(FeatureType::Form);
    }
    if labelled(&CREATE_LABEL) {
        features.insert(FeatureType::Create);
    }
    let links_to_records = controls
        .iter()
        .filter(|c| c.kind == ControlKind::Link)
        .filter_map(|c| c.href.as_deref())
        .any(|href| href != url && url_pattern(href).contains(":id"));
    if kind == PageKind::Detail || (has(ControlKind::Table) && links_to_records) {
        features.insert(FeatureType::Details);
    }
    features
}

/// Which links the crawl may follow
#[derive(Debug, Clone)]
pub struct LinkPolicy {
    origin: url::Origin,
    excluded_patterns: Vec<String>,
    excluded_extensions: Vec<String>,
    keep_hash_routes: bool,
}

impl LinkPolicy {
    pub fn new(base_url: &str, config: &DiscoveryConfig, hash_routing: bool) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::InvalidConfig(format!("base url '{}': {}", base_url, e)))?;
        Ok(Self {
            origin: base.origin(),
            excluded_patterns: config.excluded_patterns.iter().map(|p| p.to_lowercase()).collect(),
            excluded_extensions: config
                .excluded_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            keep_hash_routes: hash_routing,
        })
    }

    /// Normalised URL if the link is in scope
    pub fn admit(&self, link: &str) -> Option<String> {
        let mut url = Url::parse(link).ok()?;
        if !matches!(url.scheme(), "http" | "https") || url.origin() != self.origin {
            return None;
        }
        let lowered = url.as_str().to_lowercase();
        if self.excluded_patterns.iter().any(|p| lowered.contains(p.as_str())) {
            return None;
        }
        let extension = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .and_then(|last| last.rsplit_once('.'))
            .map(|(_, ext)| ext.to_lowercase());
        if let Some(ext) = extension {
            if self.excluded_extensions.contains(&ext) {
                return None;
            }
        }
        let keep_fragment = self.keep_hash_routes && url.fragment().map_or(false, |f| f.starts_with('/'));
        if !keep_fragment {
            url.set_fragment(None);
        }
        Some(url.to_string())
    }
}

/// Raw output of a crawl
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    pub pages: Vec<DiscoveredPage>,
    /// URLs that could not be loaded
    pub failed: Vec<String>,
    pub budget_exhausted: bool,
    pub elapsed_ms: u64,
}

pub struct DiscoveryRunner {
    config: DiscoveryConfig,
}

impl DiscoveryRunner {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Breadth-first crawl from `entry_url`.
    ///
    /// Returns [`Error::Cancelled`] if the token fires between pages.
    pub async fn crawl(
        &self,
        session: &dyn BrowserSession,
        entry_url: &str,
        context: Option<&AppContext>,
        cancel: &CancellationToken,
    ) -> Result<CrawlOutcome> {
        let started = Instant::now();
        let deadline = Duration::from_secs(self.config.max_duration_secs);
        let policy = LinkPolicy::new(entry_url, &self.config, context.map_or(false, |c| c.hash_routing))?;

        let mut outcome = CrawlOutcome::default();
        let mut frontier: VecDeque<(String, u32)> = VecDeque::new();
        let mut queued: HashSet<String> = HashSet::new();
        let mut signatures: HashSet<String> = HashSet::new();

        let entry = policy.admit(entry_url).unwrap_or_else(|| entry_url.to_string());
        queued.insert(entry.clone());
        frontier.push_back((entry, 0));

        while let Some((url, depth)) = frontier.pop_front() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if outcome.pages.len() >= self.config.max_pages || started.elapsed() >= deadline {
                outcome.budget_exhausted = true;
                info!(
                    pages = outcome.pages.len(),
                    pending = frontier.len() + 1,
                    "Discovery budget exhausted"
                );
                break;
            }

            let info = match session.navigate(&url).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Failed to load {}: {}", url, e);
                    outcome.failed.push(url);
                    continue;
                }
            };
            let snapshot = match session.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Failed to read {}: {}", info.url, e);
                    outcome.failed.push(url);
                    continue;
                }
            };

            // Redirects are judged by where they land
            let landed = policy.admit(&info.url).unwrap_or(url);
            let page = build_page(&landed, &info.title, info.status_code, snapshot.clone(), depth);
            if !signatures.insert(page.page_signature.clone()) {
                debug!("Skipping {} (signature {} already seen)", landed, page.page_signature);
                continue;
            }
            debug!(url = %landed, kind = page.page_kind.as_str(), depth, "Discovered page");

            if depth < self.config.max_depth {
                for href in snapshot.controls_of(ControlKind::Link).filter_map(|l| l.href.as_deref()) {
                    if let Some(next) = policy.admit(href) {
                        if queued.insert(next.clone()) {
                            frontier.push_back((next, depth + 1));
                        }
                    }
                }
            }
            outcome.pages.push(page);
        }

        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            pages = outcome.pages.len(),
            failed = outcome.failed.len(),
            elapsed_ms = outcome.elapsed_ms,
            "Discovery finished"
        );
        Ok(outcome)
    }
}

fn build_page(url: &str, title: &str, status_code: Option<u16>, snapshot: DomSnapshot, depth: u32) -> DiscoveredPage {
    let page_kind = classify_page(url, &snapshot, status_code);
    let features = detect_features(url, page_kind, &snapshot.controls);
    let signature = PageSignature::new(url_pattern(url), page_kind, &snapshot.controls);
    let title = if title.is_empty() { snapshot.title } else { title.to_string() };
    DiscoveredPage {
        url: url.to_string(),
        title,
        page_kind,
        page_signature: signature.digest(),
        signature,
        controls: snapshot.controls,
        features,
        depth,
        status_code,
        discovered_at: now_millis(),
    }
}

/// Reduce a crawl to the digest shown at scope selection
pub fn summarize(outcome: &CrawlOutcome) -> DiscoverySummary {
    let mut summary = DiscoverySummary {
        total_pages: outcome.pages.len(),
        budget_exhausted: outcome.budget_exhausted,
        elapsed_ms: outcome.elapsed_ms,
        ..Default::default()
    };

    for page in &outcome.pages {
        *summary.by_kind.entry(page.page_kind.as_str().to_string()).or_insert(0) += 1;
        for feature in &page.features {
            *summary.by_feature.entry(feature.as_str().to_string()).or_insert(0) += 1;
        }

        match page.status_code {
            Some(status) if status >= 500 => summary
                .anomalies
                .push(format!("server error {} on {}", status, page.url)),
            Some(status) if status >= 400 => summary
                .anomalies
                .push(format!("client error {} on {}", status, page.url)),
            _ if page.page_kind == PageKind::Error => {
                summary.anomalies.push(format!("error page at {}", page.url))
            }
            _ => {}
        }

        let empty_table = page
            .controls
            .iter()
            .any(|c| c.kind == ControlKind::Table && c.item_count == Some(0));
        if empty_table {
            summary.anomalies.push(format!("empty listing on {}", page.url));
        }
    }

    if !outcome.failed.is_empty() {
        summary
            .anomalies
            .push(format!("{} page(s) could not be loaded", outcome.failed.len()));
    }
    if outcome.budget_exhausted {
        summary.anomalies.push(format!(
            "crawl budget exhausted after {} page(s); results are partial",
            outcome.pages.len()
        ));
    }
    summary
}
