//! Run orchestrator
//!
//! Owns every run's context and drives it through the lifecycle:
//!
//! ```text
//! INIT -> SESSION_CHECK -> [WAIT_LOGIN_INPUT] -> LOGIN_ATTEMPT -> POST_LOGIN_VALIDATE
//!      -> CONTEXT_DETECT -> DISCOVERY_RUNNING -> DISCOVERY_SUMMARY -> [WAIT_TEST_SELECTION]
//!      -> TEST_PLAN_BUILDING -> TEST_EXECUTING -> REPORT_GENERATING -> COMPLETED
//! ```
//!
//! A run advances in segments. Each segment acquires a fresh browser
//! session, restores any stored login state, runs stages until the run
//! suspends on a question or reaches a terminal state, and releases the
//! session. An accepted answer starts the next segment. Stages only read
//! the context; their results are applied here as [`ContextUpdate`]s.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use qaflow_browser::{BrowserDriver, BrowserSession, DomSnapshot, SessionCounts, SessionManager};
use qaflow_common::guard::check_all;
use qaflow_common::{
    redact_value, scrub_text, AnswerOutcome, AnswerRequest, AuthConfig, ContextUpdate, Database,
    DiscoverySummary, Error, InputType, Question, Result, RunContext, RunFailure, RunState,
    TestScope, LOGIN_CREDENTIALS_QUESTION, TEST_SCOPE_QUESTION,
};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;

use crate::admission::{AdmissionController, AdmissionPermit, AdmissionSnapshot};
use crate::ai::ProviderCache;
use crate::artifacts::{ArtifactInfo, ArtifactStore};
use crate::config::{EngineConfig, StoreBackend};
use crate::discovery::{detect_context, summarize, DiscoveryRunner};
use crate::executor::Executor;
use crate::login::{credentials_question, parse_credentials_answer, LoginPipeline, SessionStatus};
use crate::report::generate_report;
use crate::run::{RunRecord, RunSnapshot, RunSummary};
use crate::schema::SchemaRegistry;
use crate::store::{MemoryRunStore, RunStore, SqliteRunStore};
use crate::testgen::PlanBuilder;

/// Variable that answers the scope question up front
pub const TEST_SCOPE_VARIABLE: &str = "testScope";

/// Parameters of a new run
#[derive(Clone, Default)]
pub struct RunRequest {
    pub base_url: String,
    pub environment: String,
    /// Defaults to the target host
    pub flow_id: Option<String>,
    pub variables: Map<String, Value>,
    pub auth: AuthConfig,
}

impl std::fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRequest")
            .field("base_url", &self.base_url)
            .field("environment", &self.environment)
            .field("flow_id", &self.flow_id)
            .field("variables", &redact_value(&Value::Object(self.variables.clone())))
            .field("auth", &self.auth)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    state: RunState,
    /// Driving segments currently alive
    segments: usize,
}

struct RunSlot {
    record: Mutex<RunRecord>,
    cancel: CancellationToken,
    /// Held until the run is terminal
    permit: Mutex<Option<AdmissionPermit>>,
    progress: watch::Sender<Progress>,
    /// Serialises segment accounting against cancellation
    lifecycle: Mutex<()>,
}

impl RunSlot {
    fn state(&self) -> RunState {
        self.record.lock().state
    }

    fn context(&self) -> RunContext {
        self.record.lock().context.clone()
    }
}

struct Engine {
    config: EngineConfig,
    admission: AdmissionController,
    sessions: SessionManager,
    providers: Arc<ProviderCache>,
    store: Arc<dyn RunStore>,
    artifacts: ArtifactStore,
    login: LoginPipeline,
    discovery: DiscoveryRunner,
    planner: PlanBuilder,
    executor: Executor,
    runs: DashMap<String, Arc<RunSlot>>,
}

/// Entry point for run lifecycle operations
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<Engine>,
}

impl Orchestrator {
    /// Build from configuration, opening the configured run store and
    /// artifact directory
    pub async fn new(config: EngineConfig, driver: Arc<dyn BrowserDriver>) -> Result<Self> {
        let store: Arc<dyn RunStore> = match config.store.backend {
            StoreBackend::Sqlite => Arc::new(SqliteRunStore::new(Database::open(config.db_path())?)),
            StoreBackend::Memory => Arc::new(MemoryRunStore::new()),
        };
        let artifacts = ArtifactStore::new(config.artifact_dir()).await?;
        Self::with_parts(config, driver, store, artifacts, Arc::new(ProviderCache::new()))
    }

    /// Build from explicit collaborators
    pub fn with_parts(
        config: EngineConfig,
        driver: Arc<dyn BrowserDriver>,
        store: Arc<dyn RunStore>,
        artifacts: ArtifactStore,
        providers: Arc<ProviderCache>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(SchemaRegistry::load(config.generation.schema_dir.as_deref())?);
        info!(
            features = registry.features().count(),
            rules = registry.rule_count(),
            driver = driver.name(),
            "Orchestrator ready"
        );

        let engine = Engine {
            admission: AdmissionController::new(&config.admission),
            sessions: SessionManager::new(driver),
            login: LoginPipeline::new(config.login.clone()),
            discovery: DiscoveryRunner::new(config.discovery.clone()),
            planner: PlanBuilder::new(registry, config.generation.clone(), config.ai.temperature),
            executor: Executor::new(config.execution.clone()),
            providers,
            store,
            artifacts,
            runs: DashMap::new(),
            config,
        };
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    /// Validate, guard and admit a run, then start driving it.
    ///
    /// Guard and admission failures are returned here; everything later is
    /// recorded on the run. Must be called within a Tokio runtime.
    pub fn create_run(&self, request: RunRequest) -> Result<String> {
        let engine = &self.engine;
        let base = Url::parse(&request.base_url)
            .map_err(|e| Error::InvalidConfig(format!("base url '{}': {}", request.base_url, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig(format!(
                "base url scheme '{}' is not http(s)",
                base.scheme()
            )));
        }
        let flow_id = request
            .flow_id
            .clone()
            .filter(|f| !f.trim().is_empty())
            .or_else(|| base.host_str().map(str::to_string))
            .unwrap_or_else(|| "default".to_string());

        let verdict = check_all(
            &engine.config.guard,
            &request.environment,
            &flow_id,
            &request.variables,
        );
        if let Err(e) = verdict.into_result() {
            warn!(flow = %flow_id, environment = %request.environment, "Run refused: {}", e);
            return Err(e);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let permit = engine.admission.try_admit(&flow_id, &run_id)?;

        let mut context = RunContext::new(&run_id, &flow_id, request.base_url, request.environment);
        context.auth = request.auth;
        context.variables = request.variables;

        let (progress, _) = watch::channel(Progress {
            state: RunState::Init,
            segments: 1,
        });
        let slot = Arc::new(RunSlot {
            record: Mutex::new(RunRecord::new(context)),
            cancel: CancellationToken::new(),
            permit: Mutex::new(Some(permit)),
            progress,
            lifecycle: Mutex::new(()),
        });
        engine.runs.insert(run_id.clone(), Arc::clone(&slot));
        engine.persist(&slot);

        info!(run = %run_id, flow = %flow_id, "Run created for {}", base.origin().ascii_serialization());
        tokio::spawn(Arc::clone(engine).drive(slot));
        Ok(run_id)
    }

    /// Current state, outstanding question and redacted context
    pub fn status(&self, run_id: &str) -> Result<RunSnapshot> {
        if let Some(slot) = self.engine.find(run_id) {
            return Ok(slot.record.lock().snapshot());
        }
        self.engine.store.load(run_id)?.ok_or_else(|| not_found(run_id))
    }

    /// Answer the run's outstanding question and resume it
    pub fn submit_answer(&self, answer: AnswerRequest) -> Result<AnswerOutcome> {
        let Some(slot) = self.engine.find(&answer.run_id) else {
            return match self.engine.store.load(&answer.run_id)? {
                Some(stored) => Ok(AnswerOutcome::Rejected {
                    reason: format!("run is {}", stored.state),
                }),
                None => Err(not_found(&answer.run_id)),
            };
        };

        let accepted = {
            let _lifecycle = slot.lifecycle.lock();
            let accepted = accept_answer(&mut slot.record.lock(), &answer);
            if let Ok(next_state) = accepted {
                slot.progress.send_modify(|p| {
                    p.state = next_state;
                    p.segments += 1;
                });
            }
            accepted
        };
        match accepted {
            Ok(next_state) => {
                info!(
                    run = %answer.run_id,
                    question = %answer.question_id,
                    next = %next_state,
                    "Answer accepted"
                );
                self.engine.persist(&slot);
                tokio::spawn(Arc::clone(&self.engine).drive(slot));
                Ok(AnswerOutcome::Accepted { next_state })
            }
            Err(e) => {
                let reason = match e {
                    Error::AnswerRejected(reason) => reason,
                    other => other.to_string(),
                };
                warn!(run = %answer.run_id, question = %answer.question_id, "Answer rejected: {}", reason);
                Ok(AnswerOutcome::Rejected { reason })
            }
        }
    }

    /// Request cancellation. A suspended run fails immediately; a driving
    /// run fails at its next stage boundary. Finished runs return their
    /// stored record unchanged.
    pub fn cancel(&self, run_id: &str) -> Result<RunSnapshot> {
        let Some(slot) = self.engine.find(run_id) else {
            return self.finished(run_id);
        };
        slot.cancel.cancel();
        info!(run = %run_id, "Cancellation requested");

        {
            // A segment ending concurrently either sees the token or has
            // already dropped its count by the time this check runs
            let _lifecycle = slot.lifecycle.lock();
            let idle = slot.progress.borrow().segments == 0;
            if idle {
                self.engine.settle_locked(&slot, false);
            }
        }
        let snapshot = slot.record.lock().snapshot();
        Ok(snapshot)
    }

    /// Wait until the run is suspended on a question or terminal, with no
    /// segment still holding a browser session
    pub async fn wait_settled(&self, run_id: &str) -> Result<RunSnapshot> {
        let Some(slot) = self.engine.find(run_id) else {
            return self.finished(run_id);
        };
        let mut progress = slot.progress.subscribe();
        progress
            .wait_for(|p| p.segments == 0 && (p.state.is_waiting() || p.state.is_terminal()))
            .await
            .map(|_| ())
            .map_err(|_| Error::Internal("run progress channel closed".to_string()))?;
        let snapshot = slot.record.lock().snapshot();
        Ok(snapshot)
    }

    /// Stored record of a run no longer held in memory
    fn finished(&self, run_id: &str) -> Result<RunSnapshot> {
        self.engine.store.load(run_id)?.ok_or_else(|| not_found(run_id))
    }

    /// All known runs, newest first
    pub fn list_runs(&self) -> Vec<RunSummary> {
        let mut runs: BTreeMap<String, RunSummary> = match self.engine.store.list() {
            Ok(stored) => stored.into_iter().map(|s| (s.run_id.clone(), s)).collect(),
            Err(e) => {
                warn!("Failed to list stored runs: {}", e);
                BTreeMap::new()
            }
        };
        for entry in self.engine.runs.iter() {
            let summary = entry.value().record.lock().summary();
            runs.insert(summary.run_id.clone(), summary);
        }
        let mut runs: Vec<RunSummary> = runs.into_values().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
        runs
    }

    pub async fn artifacts(&self, run_id: &str) -> Result<Vec<ArtifactInfo>> {
        self.engine.artifacts.list(run_id).await
    }

    pub async fn fetch_artifact(&self, run_id: &str, name: &str) -> Result<Value> {
        self.engine.artifacts.fetch(run_id, name).await
    }

    pub fn session_counts(&self) -> SessionCounts {
        self.engine.sessions.stats()
    }

    pub fn active_sessions(&self, run_id: &str) -> usize {
        self.engine.sessions.active_for(run_id)
    }

    pub fn admission(&self) -> AdmissionSnapshot {
        self.engine.admission.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }
}

fn not_found(run_id: &str) -> Error {
    Error::NotFound {
        kind: "run".to_string(),
        id: run_id.to_string(),
    }
}

/// Check an answer against the outstanding question and apply it
fn accept_answer(record: &mut RunRecord, answer: &AnswerRequest) -> Result<RunState> {
    if record.state.is_terminal() {
        return Err(Error::AnswerRejected(format!("run is {}", record.state)));
    }
    let question_id = match &record.question {
        Some(question) => question.id.clone(),
        None => {
            return Err(Error::AnswerRejected(format!(
                "no question is outstanding in state {}",
                record.state
            )))
        }
    };
    if question_id != answer.question_id {
        return Err(Error::AnswerRejected(format!(
            "outstanding question is '{}', not '{}'",
            question_id, answer.question_id
        )));
    }

    let state = record.state;
    match question_id.as_str() {
        LOGIN_CREDENTIALS_QUESTION => {
            let (username, password) = parse_credentials_answer(&Value::String(answer.payload.clone()))?;
            let mut auth = record.context.auth.clone();
            auth.username = Some(username);
            auth.password = Some(password);
            record.context.apply(ContextUpdate::Auth(auth), state)?;
            record.transition(RunState::LoginAttempt)?;
        }
        TEST_SCOPE_QUESTION => {
            let scope = TestScope::parse(&answer.payload)?;
            record.context.apply(ContextUpdate::Scope(scope), state)?;
            record.transition(RunState::TestPlanBuilding)?;
        }
        other => return Err(Error::Internal(format!("unknown question '{}'", other))),
    }
    Ok(record.state)
}

fn scope_question(summary: &DiscoverySummary) -> Question {
    let mut options = vec!["all".to_string()];
    options.extend(summary.by_feature.keys().cloned());
    Question {
        id: TEST_SCOPE_QUESTION.to_string(),
        input_type: InputType::Selection,
        prompt: format!(
            "Discovery found {} page(s). Select what to test: all, feature types, page kinds or page URLs (comma-separated)",
            summary.total_pages
        ),
        options,
        context: serde_json::to_value(summary).ok(),
    }
}

/// Scope supplied through run variables, if any
fn preset_scope(variables: &Map<String, Value>) -> Option<Result<TestScope>> {
    let text = match variables.get(TEST_SCOPE_VARIABLE)? {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(","),
        other => {
            return Some(Err(Error::AnswerRejected(format!(
                "unsupported scope value {}",
                other
            ))))
        }
    };
    Some(TestScope::parse(&text))
}

impl Engine {
    fn find(&self, run_id: &str) -> Option<Arc<RunSlot>> {
        self.runs.get(run_id).map(|slot| Arc::clone(slot.value()))
    }

    fn persist(&self, slot: &RunSlot) -> bool {
        let snapshot = slot.record.lock().snapshot();
        match self.store.save(&snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!(run = %snapshot.run_id, "Failed to persist run record: {}", e);
                false
            }
        }
    }

    /// Mutate the record, publish the resulting state and persist it
    fn update<T>(&self, slot: &RunSlot, f: impl FnOnce(&mut RunRecord) -> Result<T>) -> Result<T> {
        let (value, state) = {
            let mut record = slot.record.lock();
            let value = f(&mut record)?;
            (value, record.state)
        };
        slot.progress.send_modify(|p| p.state = state);
        self.persist(slot);
        Ok(value)
    }

    fn fail(&self, slot: &RunSlot, err: &Error) {
        let failure = {
            let mut record = slot.record.lock();
            if record.state.is_terminal() {
                return;
            }
            let failure = RunFailure::new(err.kind(), scrub_text(&err.to_string()), record.state);
            record.fail(failure.clone());
            failure
        };
        match err {
            Error::Cancelled => warn!(state = %failure.state, "Run cancelled"),
            _ => error!(state = %failure.state, kind = ?failure.kind, "Run failed: {}", failure.message),
        }
        slot.progress.send_modify(|p| p.state = RunState::Failed);
    }

    /// Bookkeeping after a segment ends
    fn settle(&self, slot: &RunSlot) {
        let _lifecycle = slot.lifecycle.lock();
        self.settle_locked(slot, true);
    }

    /// Bookkeeping after a segment ends or a suspended run is cancelled.
    /// The caller holds `slot.lifecycle`.
    ///
    /// A terminal run with no segment left is dropped from memory once its
    /// final record is stored; lookups then fall back to the run store.
    fn settle_locked(&self, slot: &RunSlot, segment_ended: bool) {
        if slot.cancel.is_cancelled() {
            self.fail(slot, &Error::Cancelled);
        }
        let state = slot.state();
        if state.is_terminal() && slot.permit.lock().take().is_some() {
            info!(state = %state, "Run finished");
        }
        let persisted = self.persist(slot);
        let mut idle = false;
        slot.progress.send_modify(|p| {
            p.state = state;
            if segment_ended {
                p.segments = p.segments.saturating_sub(1);
            }
            idle = p.segments == 0;
        });
        if state.is_terminal() && idle && persisted {
            let run_id = slot.record.lock().context.run_id.clone();
            self.runs.remove(&run_id);
            debug!(run = %run_id, "Released finished run");
        }
    }

    async fn drive(self: Arc<Self>, slot: Arc<RunSlot>) {
        let (run_id, flow_id) = {
            let record = slot.record.lock();
            (record.context.run_id.clone(), record.context.flow_id.clone())
        };
        let span = info_span!("run", run_id = %run_id, flow_id = %flow_id);
        self.segment(&slot, &run_id).instrument(span).await;
    }

    async fn segment(&self, slot: &RunSlot, run_id: &str) {
        if !slot.cancel.is_cancelled() && !slot.state().is_terminal() {
            match self.sessions.acquire(run_id).await {
                Ok(handle) => {
                    let limit = self.config.execution.run_timeout_secs;
                    let result =
                        tokio::time::timeout(Duration::from_secs(limit), self.advance(slot, handle.session()))
                            .await;
                    self.sessions.release(handle).await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => self.fail(slot, &e),
                        Err(_) => self.fail(slot, &Error::Timeout { seconds: limit }),
                    }
                }
                Err(e) => self.fail(slot, &Error::from(e)),
            }
        }
        self.settle(slot);
    }

    /// Run stages until the run suspends or terminates
    async fn advance(&self, slot: &RunSlot, session: &dyn BrowserSession) -> Result<()> {
        self.restore_session(slot, session).await;
        loop {
            if slot.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let state = slot.state();
            if state.is_waiting() || state.is_terminal() {
                debug!(state = %state, "Segment finished");
                return Ok(());
            }

            let started = Instant::now();
            self.step(slot, session, state).await?;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            {
                let mut record = slot.record.lock();
                let current = record.state;
                record
                    .context
                    .apply(ContextUpdate::StageTiming { stage: state, elapsed_ms }, current)?;
            }
        }
    }

    async fn step(&self, slot: &RunSlot, session: &dyn BrowserSession, state: RunState) -> Result<()> {
        match state {
            RunState::Init => self.update(slot, |r| r.transition(RunState::SessionCheck)),
            RunState::SessionCheck => self.check_session(slot, session).await,
            RunState::LoginAttempt => self.attempt_login(slot, session).await,
            RunState::PostLoginValidate => self.validate_login(slot, session).await,
            RunState::ContextDetect => self.inspect_target(slot, session).await,
            RunState::DiscoveryRunning => self.discover(slot, session).await,
            RunState::DiscoverySummary => self.ask_scope(slot),
            RunState::TestPlanBuilding => self.build_plan(slot).await,
            RunState::TestExecuting => self.execute_plan(slot, session).await,
            RunState::ReportGenerating => self.finish_report(slot).await,
            RunState::WaitLoginInput
            | RunState::WaitTestSelection
            | RunState::Completed
            | RunState::Failed => Ok(()),
        }
    }

    async fn restore_session(&self, slot: &RunSlot, session: &dyn BrowserSession) {
        let stored = slot.record.lock().context.session_state.clone();
        if let Some(stored) = stored {
            match session.restore_storage_state(&stored).await {
                Ok(()) => debug!("Restored browser storage state"),
                Err(e) => warn!("Failed to restore browser storage state: {}", e),
            }
        }
    }

    fn recheck_guards(&self, ctx: &RunContext) -> Result<()> {
        check_all(&self.config.guard, &ctx.environment, &ctx.flow_id, &ctx.variables).into_result()
    }

    async fn check_session(&self, slot: &RunSlot, session: &dyn BrowserSession) -> Result<()> {
        let ctx = slot.context();
        let status = match self.login.session_check(session, &ctx.base_url, &ctx.auth).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Session check failed, assuming login is required: {}", e);
                SessionStatus::FormLogin
            }
        };

        if !status.requires_login() {
            return self.update(slot, |r| {
                let state = r.state;
                r.context.apply(ContextUpdate::SsoDetected(false), state)?;
                r.transition(RunState::ContextDetect)
            });
        }

        let sso = matches!(status, SessionStatus::Sso { .. });
        let outcome = self.login.detect(&ctx.auth, sso, ctx.login_attempts);
        if outcome.question.is_none() {
            self.recheck_guards(&ctx)?;
        }
        self.update(slot, move |r| {
            let state = r.state;
            r.context.apply(ContextUpdate::SsoDetected(sso), state)?;
            r.context.apply(ContextUpdate::Auth(outcome.auth), state)?;
            match outcome.question {
                Some(question) => {
                    info!("Waiting for login credentials");
                    r.suspend(RunState::WaitLoginInput, question)
                }
                None => r.transition(outcome.next),
            }
        })
    }

    async fn attempt_login(&self, slot: &RunSlot, session: &dyn BrowserSession) -> Result<()> {
        let ctx = slot.context();
        self.recheck_guards(&ctx)?;

        let attempt = self
            .login
            .execute(session, &ctx.base_url, &ctx.auth, self.config.execution.step_timeout_ms)
            .await;
        match attempt {
            Ok(attempt) if attempt.success => {
                info!(landed = attempt.landed_on.as_deref().unwrap_or("-"), "Login submitted");
                self.update(slot, |r| r.transition(RunState::PostLoginValidate))
            }
            Ok(attempt) => self.reject_login(slot, attempt.error.as_deref().unwrap_or("login failed")),
            Err(e) => self.reject_login(slot, &e.to_string()),
        }
    }

    async fn validate_login(&self, slot: &RunSlot, session: &dyn BrowserSession) -> Result<()> {
        let base_url = slot.record.lock().context.base_url.clone();
        let outcome = match self.login.validate(session, &base_url).await {
            Ok(outcome) => outcome,
            Err(e) => return self.reject_login(slot, &e.to_string()),
        };
        if !outcome.authenticated {
            let reason = outcome.reason.as_deref().unwrap_or("session is not authenticated");
            return self.reject_login(slot, reason);
        }
        info!(markers = ?outcome.markers, "Login validated");

        let storage = match session.storage_state().await {
            Ok(storage) => Some(storage),
            Err(e) => {
                warn!("Failed to capture browser storage state: {}", e);
                None
            }
        };
        self.update(slot, |r| {
            if let Some(storage) = storage {
                let state = r.state;
                r.context.apply(ContextUpdate::SessionState(storage), state)?;
            }
            r.transition(RunState::ContextDetect)
        })
    }

    /// Count a failed login; ask again or give up at the bound
    fn reject_login(&self, slot: &RunSlot, reason: &str) -> Result<()> {
        let max_attempts = self.login.max_attempts();
        self.update(slot, |r| {
            let state = r.state;
            r.context.apply(ContextUpdate::LoginAttemptFailed, state)?;
            let attempts = r.context.login_attempts;
            if attempts >= max_attempts {
                return Err(Error::Login(format!(
                    "login not confirmed after {} attempt(s): {}",
                    attempts, reason
                )));
            }
            warn!(attempts, "Login not confirmed ({}), asking for credentials again", reason);
            let question = credentials_question(&r.context.auth, attempts, Some(reason));
            r.suspend(RunState::WaitLoginInput, question)
        })
    }

    async fn inspect_target(&self, slot: &RunSlot, session: &dyn BrowserSession) -> Result<()> {
        let base_url = slot.record.lock().context.base_url.clone();
        let snapshot = match session.navigate(&base_url).await {
            Ok(_) => session.snapshot().await,
            Err(e) => Err(e),
        };
        let snapshot = snapshot.unwrap_or_else(|e| {
            warn!("Context detection could not read the entry page: {}", e);
            DomSnapshot::default()
        });

        let app = detect_context(&snapshot);
        info!(
            nav = ?app.nav_style,
            hash_routing = app.hash_routing,
            libraries = ?app.ui_libraries,
            "Application context detected"
        );
        self.update(slot, |r| {
            let state = r.state;
            r.context.apply(ContextUpdate::AppContext(app), state)?;
            r.transition(RunState::DiscoveryRunning)
        })
    }

    async fn discover(&self, slot: &RunSlot, session: &dyn BrowserSession) -> Result<()> {
        let ctx = slot.context();
        let outcome = self
            .discovery
            .crawl(session, &ctx.base_url, ctx.app_context.as_ref(), &slot.cancel)
            .await?;
        let summary = summarize(&outcome);
        if let Err(e) = self.artifacts.write_discovery(&ctx.run_id, &outcome.pages).await {
            warn!("Failed to store discovery document: {}", e);
        }

        self.update(slot, |r| {
            let state = r.state;
            r.context.apply(ContextUpdate::PagesDiscovered(outcome.pages), state)?;
            r.context.apply(ContextUpdate::Summary(summary), state)?;
            r.transition(RunState::DiscoverySummary)
        })
    }

    /// Put the scope question; a preset scope answers it at once
    fn ask_scope(&self, slot: &RunSlot) -> Result<()> {
        self.update(slot, |r| {
            let summary = r.context.summary.clone().unwrap_or_default();
            r.suspend(RunState::WaitTestSelection, scope_question(&summary))?;

            match preset_scope(&r.context.variables) {
                Some(Ok(scope)) => {
                    info!(scope = ?scope, "Test scope preset by run variables");
                    let state = r.state;
                    r.context.apply(ContextUpdate::Scope(scope), state)?;
                    r.transition(RunState::TestPlanBuilding)?;
                }
                Some(Err(e)) => warn!("Ignoring {} variable: {}", TEST_SCOPE_VARIABLE, e),
                None => info!(pages = summary.total_pages, "Waiting for test scope selection"),
            }
            Ok(())
        })
    }

    async fn build_plan(&self, slot: &RunSlot) -> Result<()> {
        let ctx = slot.context();
        let scope = ctx.scope.clone().unwrap_or(TestScope::All);
        let provider = self.providers.resolve(&self.config.ai);
        let plan = self.planner.build(&ctx.run_id, &ctx.pages, &scope, provider).await;
        if let Err(e) = self.artifacts.write_test_cases(&ctx.run_id, &plan).await {
            warn!("Failed to store test case document: {}", e);
        }

        if slot.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.recheck_guards(&ctx)?;
        self.update(slot, |r| {
            let state = r.state;
            r.context.apply(ContextUpdate::Plan(plan), state)?;
            r.transition(RunState::TestExecuting)
        })
    }

    async fn execute_plan(&self, slot: &RunSlot, session: &dyn BrowserSession) -> Result<()> {
        let ctx = slot.context();
        let summary = self.executor.execute(session, &ctx.test_plan, &slot.cancel).await?;

        let plan = self.update(slot, |r| {
            let state = r.state;
            r.context.apply(ContextUpdate::Executed(summary.cases), state)?;
            r.transition(RunState::ReportGenerating)?;
            Ok(r.context.test_plan.clone())
        })?;
        if let Err(e) = self.artifacts.write_test_cases(&ctx.run_id, &plan).await {
            warn!("Failed to store test case document: {}", e);
        }
        Ok(())
    }

    async fn finish_report(&self, slot: &RunSlot) -> Result<()> {
        let report = generate_report(&slot.context());
        if let Err(e) = self.artifacts.write_report(&report.run_id, &report).await {
            warn!("Failed to store report document: {}", e);
        }
        info!(
            total = report.totals.total,
            passed = report.totals.passed,
            failed = report.totals.failed,
            "Report generated"
        );

        self.update(slot, |r| {
            let state = r.state;
            r.context.apply(ContextUpdate::Report(report), state)?;
            r.transition(RunState::Completed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qaflow_common::{FailureKind, InputType};
    use serde_json::json;

    fn waiting_record(question_id: &str, state: RunState) -> RunRecord {
        let ctx = RunContext::new("run-1", "smoke", "https://app.test", "staging");
        let mut record = RunRecord::new(ctx);
        record.transition(RunState::SessionCheck).unwrap();
        if state == RunState::WaitTestSelection {
            for next in [
                RunState::ContextDetect,
                RunState::DiscoveryRunning,
                RunState::DiscoverySummary,
            ] {
                record.transition(next).unwrap();
            }
        }
        let question = Question {
            id: question_id.to_string(),
            input_type: InputType::Text,
            prompt: String::new(),
            options: vec![],
            context: None,
        };
        record.suspend(state, question).unwrap();
        record
    }

    fn answer(question_id: &str, payload: &str) -> AnswerRequest {
        AnswerRequest {
            run_id: "run-1".to_string(),
            question_id: question_id.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_credentials_answer_applied() {
        let mut record = waiting_record(LOGIN_CREDENTIALS_QUESTION, RunState::WaitLoginInput);
        let next = accept_answer(&mut record, &answer(LOGIN_CREDENTIALS_QUESTION, "qa@test.io,pa,ss")).unwrap();
        assert_eq!(next, RunState::LoginAttempt);
        assert_eq!(record.context.auth.username.as_deref(), Some("qa@test.io"));
        assert_eq!(record.context.auth.password.as_deref(), Some("pa,ss"));
        assert!(record.question.is_none());
    }

    #[test]
    fn test_wrong_question_rejected() {
        let mut record = waiting_record(LOGIN_CREDENTIALS_QUESTION, RunState::WaitLoginInput);
        let err = accept_answer(&mut record, &answer(TEST_SCOPE_QUESTION, "all")).unwrap_err();
        assert!(matches!(err, Error::AnswerRejected(_)));
        assert_eq!(record.state, RunState::WaitLoginInput);
        assert!(record.question.is_some());
    }

    #[test]
    fn test_malformed_credentials_keep_question() {
        let mut record = waiting_record(LOGIN_CREDENTIALS_QUESTION, RunState::WaitLoginInput);
        assert!(accept_answer(&mut record, &answer(LOGIN_CREDENTIALS_QUESTION, "no-comma")).is_err());
        assert_eq!(record.state, RunState::WaitLoginInput);
    }

    #[test]
    fn test_scope_answer_applied() {
        let mut record = waiting_record(TEST_SCOPE_QUESTION, RunState::WaitTestSelection);
        let next = accept_answer(&mut record, &answer(TEST_SCOPE_QUESTION, "listing, search")).unwrap();
        assert_eq!(next, RunState::TestPlanBuilding);
        assert!(matches!(record.context.scope, Some(TestScope::Features(_))));
    }

    #[test]
    fn test_terminal_run_rejects_answers() {
        let mut record = waiting_record(LOGIN_CREDENTIALS_QUESTION, RunState::WaitLoginInput);
        record.fail(RunFailure::new(FailureKind::Cancelled, "stop", RunState::WaitLoginInput));
        assert!(accept_answer(&mut record, &answer(LOGIN_CREDENTIALS_QUESTION, "a,b")).is_err());
    }

    #[test]
    fn test_preset_scope_forms() {
        let mut vars = Map::new();
        assert!(preset_scope(&vars).is_none());
        vars.insert(TEST_SCOPE_VARIABLE.into(), json!("all"));
        assert_eq!(preset_scope(&vars).unwrap().unwrap(), TestScope::All);
        vars.insert(TEST_SCOPE_VARIABLE.into(), json!(["listing", "search"]));
        assert!(matches!(preset_scope(&vars).unwrap().unwrap(), TestScope::Features(f) if f.len() == 2));
        vars.insert(TEST_SCOPE_VARIABLE.into(), json!(3));
        assert!(preset_scope(&vars).unwrap().is_err());
    }

    #[test]
    fn test_request_debug_is_redacted() {
        let mut request = RunRequest {
            base_url: "https://app.test".into(),
            ..Default::default()
        };
        request.variables.insert("apiToken".into(), json!("tok-123"));
        request.auth.password = Some("hunter2".into());
        let text = format!("{:?}", request);
        assert!(!text.contains("tok-123"));
        assert!(!text.contains("hunter2"));
    }
}
