//! Core types for qaflow runs

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use crate::action::BrowserAction;
use crate::{Error, Result};

/// Identifier of the credential question asked at `WAIT_LOGIN_INPUT`
pub const LOGIN_CREDENTIALS_QUESTION: &str = "login_creds";

/// Identifier of the scope question asked at `WAIT_TEST_SELECTION`
pub const TEST_SCOPE_QUESTION: &str = "test_scope";

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Run lifecycle
// ============================================================================

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    SessionCheck,
    WaitLoginInput,
    LoginAttempt,
    PostLoginValidate,
    ContextDetect,
    DiscoveryRunning,
    DiscoverySummary,
    WaitTestSelection,
    TestPlanBuilding,
    TestExecuting,
    ReportGenerating,
    Completed,
    Failed,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Init
    }
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "INIT",
            RunState::SessionCheck => "SESSION_CHECK",
            RunState::WaitLoginInput => "WAIT_LOGIN_INPUT",
            RunState::LoginAttempt => "LOGIN_ATTEMPT",
            RunState::PostLoginValidate => "POST_LOGIN_VALIDATE",
            RunState::ContextDetect => "CONTEXT_DETECT",
            RunState::DiscoveryRunning => "DISCOVERY_RUNNING",
            RunState::DiscoverySummary => "DISCOVERY_SUMMARY",
            RunState::WaitTestSelection => "WAIT_TEST_SELECTION",
            RunState::TestPlanBuilding => "TEST_PLAN_BUILDING",
            RunState::TestExecuting => "TEST_EXECUTING",
            RunState::ReportGenerating => "REPORT_GENERATING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
        }
    }

    /// `COMPLETED` and `FAILED` accept no further transitions or answers
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// States in which the run is suspended on a human answer
    pub fn is_waiting(&self) -> bool {
        matches!(self, RunState::WaitLoginInput | RunState::WaitTestSelection)
    }

    /// States in which the login pipeline may mutate `AuthConfig`
    pub fn allows_auth_mutation(&self) -> bool {
        matches!(
            self,
            RunState::SessionCheck | RunState::WaitLoginInput | RunState::LoginAttempt
        )
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (*self, next),
            (Init, SessionCheck)
                | (SessionCheck, WaitLoginInput)
                | (SessionCheck, LoginAttempt)
                | (SessionCheck, ContextDetect)
                | (WaitLoginInput, LoginAttempt)
                | (LoginAttempt, PostLoginValidate)
                | (LoginAttempt, WaitLoginInput)
                | (PostLoginValidate, ContextDetect)
                | (PostLoginValidate, WaitLoginInput)
                | (ContextDetect, DiscoveryRunning)
                | (DiscoveryRunning, DiscoverySummary)
                | (DiscoverySummary, WaitTestSelection)
                | (WaitTestSelection, TestPlanBuilding)
                | (TestPlanBuilding, TestExecuting)
                | (TestExecuting, ReportGenerating)
                | (ReportGenerating, Completed)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub at: i64,
}

/// Error taxonomy entry recorded on a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Guard,
    Automation,
    Login,
    Persistence,
    Cancelled,
    Timeout,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Guard => "guard",
            FailureKind::Automation => "automation",
            FailureKind::Login => "login",
            FailureKind::Persistence => "persistence",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Timeout => "timeout",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Terminal failure of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
    /// State the run was in when it failed
    pub state: RunState,
    pub at: i64,
}

impl RunFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, state: RunState) -> Self {
        Self {
            kind,
            message: message.into(),
            state,
            at: now_millis(),
        }
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Authentication mechanism of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// No login required
    None,
    /// Username/password form on the target itself
    Form,
    /// Login delegated to an external identity provider
    Sso,
}

impl Default for AuthType {
    fn default() -> Self {
        Self::Form
    }
}

/// Authentication configuration of a run
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Named browser/credential profile on the operator side
    #[serde(default)]
    pub profile: Option<String>,
}

impl AuthConfig {
    /// Both a non-empty username and a non-empty password are present
    pub fn has_credentials(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        present(&self.username) && present(&self.password)
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| crate::REDACTION_MARKER))
            .field("profile", &self.profile)
            .finish()
    }
}

// ============================================================================
// Questions and answers
// ============================================================================

/// Kind of input a question expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Credentials,
    Selection,
    Text,
}

/// Question put to the human operator by a suspended run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub input_type: InputType,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Supporting payload, e.g. the discovery digest
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Answer submitted for a run's outstanding question
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub run_id: String,
    pub question_id: String,
    pub payload: String,
}

impl std::fmt::Debug for AnswerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerRequest")
            .field("run_id", &self.run_id)
            .field("question_id", &self.question_id)
            .field("payload", &crate::REDACTION_MARKER)
            .finish()
    }
}

/// Result of submitting an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Accepted { next_state: RunState },
    Rejected { reason: String },
}

impl AnswerOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AnswerOutcome::Accepted { .. })
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Kind of interactive element found on a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Link,
    Button,
    TextInput,
    PasswordInput,
    SearchInput,
    Select,
    Checkbox,
    Textarea,
    Form,
    Table,
    List,
    Nav,
    Pagination,
    Other,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Link => "link",
            ControlKind::Button => "button",
            ControlKind::TextInput => "text_input",
            ControlKind::PasswordInput => "password_input",
            ControlKind::SearchInput => "search_input",
            ControlKind::Select => "select",
            ControlKind::Checkbox => "checkbox",
            ControlKind::Textarea => "textarea",
            ControlKind::Form => "form",
            ControlKind::Table => "table",
            ControlKind::List => "list",
            ControlKind::Nav => "nav",
            ControlKind::Pagination => "pagination",
            ControlKind::Other => "other",
        }
    }
}

/// An interactive element on a discovered page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub kind: ControlKind,
    pub selector: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Row/item count for tables and lists
    #[serde(default)]
    pub item_count: Option<usize>,
}

/// Coarse classification of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Listing,
    Detail,
    Form,
    Dashboard,
    Login,
    Error,
    Other,
}

impl PageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageKind::Listing => "listing",
            PageKind::Detail => "detail",
            PageKind::Form => "form",
            PageKind::Dashboard => "dashboard",
            PageKind::Login => "login",
            PageKind::Error => "error",
            PageKind::Other => "other",
        }
    }
}

impl FromStr for PageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "listing" => Ok(PageKind::Listing),
            "detail" => Ok(PageKind::Detail),
            "form" => Ok(PageKind::Form),
            "dashboard" => Ok(PageKind::Dashboard),
            "login" => Ok(PageKind::Login),
            "error" => Ok(PageKind::Error),
            "other" => Ok(PageKind::Other),
            other => Err(Error::InvalidConfig(format!("unknown page kind: {}", other))),
        }
    }
}

/// Structural fingerprint of a page, the dedup key during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSignature {
    pub url_pattern: String,
    pub page_kind: PageKind,
    /// Sorted, deduplicated `kind:label` inventory
    pub controls: Vec<String>,
}

impl PageSignature {
    pub fn new(url_pattern: impl Into<String>, page_kind: PageKind, controls: &[Control]) -> Self {
        let inventory: BTreeSet<String> = controls
            .iter()
            .filter(|c| c.kind != ControlKind::Link)
            .map(|c| format!("{}:{}", c.kind.as_str(), c.label.trim().to_lowercase()))
            .collect();
        Self {
            url_pattern: url_pattern.into(),
            page_kind,
            controls: inventory.into_iter().collect(),
        }
    }

    /// Stable hex digest of the signature
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url_pattern.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.page_kind.as_str().as_bytes());
        for control in &self.controls {
            hasher.update([0u8]);
            hasher.update(control.as_bytes());
        }
        hex::encode(&hasher.finalize()[..12])
    }
}

/// Checkable feature category detected on a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Listing,
    Search,
    Pagination,
    Filters,
    Sort,
    Form,
    Create,
    Details,
    Navigation,
}

impl FeatureType {
    pub const ALL: [FeatureType; 9] = [
        FeatureType::Listing,
        FeatureType::Search,
        FeatureType::Pagination,
        FeatureType::Filters,
        FeatureType::Sort,
        FeatureType::Form,
        FeatureType::Create,
        FeatureType::Details,
        FeatureType::Navigation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Listing => "listing",
            FeatureType::Search => "search",
            FeatureType::Pagination => "pagination",
            FeatureType::Filters => "filters",
            FeatureType::Sort => "sort",
            FeatureType::Form => "form",
            FeatureType::Create => "create",
            FeatureType::Details => "details",
            FeatureType::Navigation => "navigation",
        }
    }
}

impl FromStr for FeatureType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        let wanted = match wanted.as_str() {
            "filter" => "filters",
            "detail" => "details",
            other => other,
        };
        FeatureType::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown feature type: {}", s.trim())))
    }
}

/// A page found during discovery; created once per unique signature per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPage {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub page_kind: PageKind,
    /// Digest of `signature`
    pub page_signature: String,
    pub signature: PageSignature,
    pub controls: Vec<Control>,
    #[serde(default)]
    pub features: BTreeSet<FeatureType>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub status_code: Option<u16>,
    pub discovered_at: i64,
}

impl DiscoveredPage {
    /// Short name used for scenario grouping
    pub fn name(&self) -> String {
        if !self.title.trim().is_empty() {
            return self.title.trim().to_string();
        }
        self.signature.url_pattern.clone()
    }
}

/// Navigation layout detected on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavStyle {
    Sidebar,
    TopBar,
    Minimal,
}

/// Application context used to bias discovery heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppContext {
    pub nav_style: NavStyle,
    /// Client-side routing via `#/` fragments
    pub hash_routing: bool,
    /// Recognised UI component libraries
    #[serde(default)]
    pub ui_libraries: Vec<String>,
    /// Selector of the primary navigation container, if any
    #[serde(default)]
    pub nav_selector: Option<String>,
}

/// Human-reviewable digest of a discovery crawl
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub total_pages: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_feature: BTreeMap<String, usize>,
    #[serde(default)]
    pub anomalies: Vec<String>,
    #[serde(default)]
    pub budget_exhausted: bool,
    #[serde(default)]
    pub elapsed_ms: u64,
}

// ============================================================================
// Test scope
// ============================================================================

/// Operator-selected subset of discovered pages to test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum TestScope {
    All,
    Features(BTreeSet<FeatureType>),
    PageKinds(BTreeSet<PageKind>),
    Pages(BTreeSet<String>),
}

impl TestScope {
    /// Parse an operator answer: `all`, feature types, page kinds, or page URLs
    pub fn parse(answer: &str) -> Result<Self> {
        let items: Vec<&str> = answer
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if items.is_empty() {
            return Err(Error::AnswerRejected("empty scope selection".to_string()));
        }
        if items.len() == 1 && items[0].eq_ignore_ascii_case("all") {
            return Ok(TestScope::All);
        }
        if let Ok(features) = items.iter().map(|s| s.parse()).collect::<Result<BTreeSet<FeatureType>>>() {
            return Ok(TestScope::Features(features));
        }
        if let Ok(kinds) = items.iter().map(|s| s.parse()).collect::<Result<BTreeSet<PageKind>>>() {
            return Ok(TestScope::PageKinds(kinds));
        }
        if items.iter().all(|s| s.starts_with('/') || s.contains("://")) {
            return Ok(TestScope::Pages(items.iter().map(|s| s.to_string()).collect()));
        }
        Err(Error::AnswerRejected(format!(
            "unrecognised scope selection: {}",
            answer.trim()
        )))
    }

    pub fn includes_page(&self, page: &DiscoveredPage) -> bool {
        match self {
            TestScope::All => true,
            TestScope::Features(features) => page.features.iter().any(|f| features.contains(f)),
            TestScope::PageKinds(kinds) => kinds.contains(&page.page_kind),
            TestScope::Pages(pages) => pages
                .iter()
                .any(|p| page.url == *p || page.url.ends_with(p.as_str())),
        }
    }

    pub fn includes_feature(&self, feature: FeatureType) -> bool {
        match self {
            TestScope::Features(features) => features.contains(&feature),
            _ => true,
        }
    }
}

// ============================================================================
// Test cases
// ============================================================================

/// Category of behaviour a test case checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    Create,
    Read,
    Update,
    Delete,
    Listing,
    Pagination,
    Search,
    Filter,
    Sort,
    Navigation,
    FormValidation,
    General,
}

impl TestCategory {
    /// Scenario suffix used when grouping cases per page
    pub fn scenario_suffix(&self) -> &'static str {
        match self {
            TestCategory::Create | TestCategory::Read | TestCategory::Update | TestCategory::Delete => {
                "CRUD Operations"
            }
            TestCategory::Listing
            | TestCategory::Pagination
            | TestCategory::Search
            | TestCategory::Filter
            | TestCategory::Sort => "Data Operations",
            TestCategory::Navigation => "Navigation",
            TestCategory::FormValidation => "Form Validation",
            TestCategory::General => "General Tests",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    Passed,
    Failed,
}

impl Default for TestStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Where a test case came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSource {
    Rule,
    Ai,
}

/// One HTTP exchange observed by the browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkExchange {
    pub url: String,
    #[serde(default)]
    pub method: String,
    pub status: u16,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub resource_type: String,
}

/// Outcome of one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Evidence captured while executing a case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub screenshot_path: Option<String>,
    #[serde(default)]
    pub network: Vec<NetworkExchange>,
}

/// A generated test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub title: String,
    pub page_url: String,
    pub page_name: String,
    pub page_signature: String,
    /// Originating rule id, or `ai:<slug>` for assisted cases
    pub template: String,
    pub category: TestCategory,
    #[serde(default)]
    pub priority: Priority,
    pub source: CaseSource,
    pub steps: Vec<BrowserAction>,
    pub expected_result: String,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default)]
    pub step_results: Vec<StepRecord>,
    #[serde(default)]
    pub evidence: Evidence,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Derive a test case id from its origin; stable across regenerations
pub fn derive_case_id(run_id: &str, page_signature: &str, template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(page_signature.as_bytes());
    hasher.update([0u8]);
    hasher.update(template.as_bytes());
    format!("tc-{}", hex::encode(&hasher.finalize()[..8]))
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportTotals {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl ReportTotals {
    pub fn tally<'a>(cases: impl IntoIterator<Item = &'a TestCase>) -> Self {
        let mut totals = Self::default();
        for case in cases {
            totals.total += 1;
            match case.status {
                TestStatus::Passed => totals.passed += 1,
                TestStatus::Failed => totals.failed += 1,
                TestStatus::Pending => totals.pending += 1,
            }
        }
        totals
    }
}

/// Test cases grouped per page and category family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub scenario_name: String,
    pub page_name: String,
    pub page_url: String,
    pub test_cases: Vec<TestCase>,
    pub total: usize,
    pub pending: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Final, write-once output of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub flow_id: String,
    pub base_url: String,
    pub environment: String,
    pub started_at: i64,
    pub generated_at: i64,
    pub duration_ms: u64,
    pub discovery: DiscoverySummary,
    pub totals: ReportTotals,
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub stage_timings_ms: BTreeMap<String, u64>,
    pub test_cases: Vec<TestCase>,
}

// ============================================================================
// Run context
// ============================================================================

/// All state of one run, owned by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub flow_id: String,
    pub base_url: String,
    pub environment: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub sso_detected: bool,
    #[serde(default)]
    pub login_attempts: u32,
    /// Browser storage state captured after a validated login
    #[serde(default)]
    pub session_state: Option<serde_json::Value>,
    #[serde(default)]
    pub app_context: Option<AppContext>,
    #[serde(default)]
    pub pages: Vec<DiscoveredPage>,
    #[serde(default)]
    pub summary: Option<DiscoverySummary>,
    #[serde(default)]
    pub scope: Option<TestScope>,
    #[serde(default)]
    pub test_plan: Vec<TestCase>,
    #[serde(default)]
    pub report: Option<Report>,
    #[serde(default)]
    pub stage_timings_ms: BTreeMap<String, u64>,
    pub created_at: i64,
}

/// Change to a `RunContext` produced by a pipeline stage
#[derive(Debug, Clone)]
pub enum ContextUpdate {
    Auth(AuthConfig),
    SsoDetected(bool),
    LoginAttemptFailed,
    SessionState(serde_json::Value),
    AppContext(AppContext),
    PagesDiscovered(Vec<DiscoveredPage>),
    Summary(DiscoverySummary),
    Scope(TestScope),
    Plan(Vec<TestCase>),
    Executed(Vec<TestCase>),
    Report(Report),
    StageTiming { stage: RunState, elapsed_ms: u64 },
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        flow_id: impl Into<String>,
        base_url: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            flow_id: flow_id.into(),
            base_url: base_url.into(),
            environment: environment.into(),
            auth: AuthConfig::default(),
            variables: serde_json::Map::new(),
            sso_detected: false,
            login_attempts: 0,
            session_state: None,
            app_context: None,
            pages: Vec::new(),
            summary: None,
            scope: None,
            test_plan: Vec::new(),
            report: None,
            stage_timings_ms: BTreeMap::new(),
            created_at: now_millis(),
        }
    }

    /// Apply a stage delta while the run is in `state`
    pub fn apply(&mut self, update: ContextUpdate, state: RunState) -> Result<()> {
        match update {
            ContextUpdate::Auth(auth) => {
                if !state.allows_auth_mutation() {
                    return Err(Error::Internal(format!(
                        "auth configuration is immutable in state {}",
                        state
                    )));
                }
                self.auth = auth;
            }
            ContextUpdate::SsoDetected(detected) => self.sso_detected = detected,
            ContextUpdate::LoginAttemptFailed => self.login_attempts += 1,
            ContextUpdate::SessionState(value) => self.session_state = Some(value),
            ContextUpdate::AppContext(ctx) => self.app_context = Some(ctx),
            ContextUpdate::PagesDiscovered(pages) => {
                let mut seen: BTreeSet<String> =
                    self.pages.iter().map(|p| p.page_signature.clone()).collect();
                for page in pages {
                    if seen.insert(page.page_signature.clone()) {
                        self.pages.push(page);
                    }
                }
            }
            ContextUpdate::Summary(summary) => self.summary = Some(summary),
            ContextUpdate::Scope(scope) => self.scope = Some(scope),
            ContextUpdate::Plan(plan) => self.test_plan = plan,
            ContextUpdate::Executed(executed) => {
                let mut by_id: BTreeMap<String, TestCase> =
                    executed.into_iter().map(|c| (c.id.clone(), c)).collect();
                for case in self.test_plan.iter_mut() {
                    if let Some(done) = by_id.remove(&case.id) {
                        *case = done;
                    }
                }
            }
            ContextUpdate::Report(report) => {
                if self.report.is_some() {
                    return Err(Error::Internal("report already generated".to_string()));
                }
                self.report = Some(report);
            }
            ContextUpdate::StageTiming { stage, elapsed_ms } => {
                *self
                    .stage_timings_ms
                    .entry(stage.as_str().to_string())
                    .or_insert(0) += elapsed_ms;
            }
        }
        Ok(())
    }
}
