//! End-to-end run lifecycle against a scripted browser

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use qaflow_common::{
    AnswerOutcome, AnswerRequest, AuthConfig, AuthType, ControlKind, Database, Error, FailureKind, InputType, RunState,
    LOGIN_CREDENTIALS_QUESTION, TEST_SCOPE_QUESTION,
};
use qaflow_engine::ai::{ProviderKind, ProviderSettings};
use qaflow_engine::artifacts::{DISCOVERY_DOC, REPORT_DOC, TEST_CASES_DOC};
use qaflow_engine::config::{GenerationMode, StoreBackend};
use qaflow_engine::{
    ArtifactStore, MemoryRunStore, Orchestrator, ProviderCache, RunRequest, RunSnapshot, RunStore,
    SqliteRunStore, TEST_SCOPE_VARIABLE,
};
use serde_json::json;

fn request(flow: &str) -> RunRequest {
    RunRequest {
        base_url: BASE_URL.to_string(),
        environment: "staging".to_string(),
        flow_id: Some(flow.to_string()),
        variables: test_tenant(),
        auth: AuthConfig::default(),
    }
}

fn answer(run_id: &str, question_id: &str, payload: &str) -> AnswerRequest {
    AnswerRequest {
        run_id: run_id.to_string(),
        question_id: question_id.to_string(),
        payload: payload.to_string(),
    }
}

fn visited(snapshot: &RunSnapshot) -> Vec<RunState> {
    let mut states = vec![RunState::Init];
    states.extend(snapshot.history.iter().map(|t| t.to));
    states
}

fn assert_sessions_released(orchestrator: &Orchestrator, run_id: &str) {
    let counts = orchestrator.session_counts();
    assert_eq!(counts.acquired, counts.released, "{:?}", counts);
    assert_eq!(counts.leaked, 0);
    assert_eq!(orchestrator.active_sessions(run_id), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_credentials_are_requested_then_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(Site::shop().with_login("qa", "s3cret-pw")));
    let orchestrator = orchestrator(test_config(dir.path()), driver).await;

    let run_id = orchestrator.create_run(request("shop")).unwrap();
    let waiting = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(waiting.state, RunState::WaitLoginInput);
    assert_eq!(
        visited(&waiting),
        vec![RunState::Init, RunState::SessionCheck, RunState::WaitLoginInput]
    );
    let question = waiting.question.expect("outstanding question");
    assert_eq!(question.id, LOGIN_CREDENTIALS_QUESTION);
    assert_eq!(question.input_type, InputType::Credentials);

    let outcome = orchestrator
        .submit_answer(answer(&run_id, LOGIN_CREDENTIALS_QUESTION, "qa,s3cret-pw"))
        .unwrap();
    assert_eq!(
        outcome,
        AnswerOutcome::Accepted {
            next_state: RunState::LoginAttempt
        }
    );

    let scoped = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(scoped.state, RunState::WaitTestSelection);
    let states = visited(&scoped);
    for expected in [
        RunState::LoginAttempt,
        RunState::PostLoginValidate,
        RunState::ContextDetect,
        RunState::DiscoveryRunning,
        RunState::DiscoverySummary,
    ] {
        assert!(states.contains(&expected), "missing {} in {:?}", expected, states);
    }
    let question = scoped.question.clone().expect("scope question");
    assert_eq!(question.id, TEST_SCOPE_QUESTION);
    assert!(question.options.contains(&"all".to_string()));
    assert!(!serde_json::to_string(&scoped).unwrap().contains("s3cret-pw"));

    let outcome = orchestrator
        .submit_answer(answer(&run_id, TEST_SCOPE_QUESTION, "all"))
        .unwrap();
    assert!(outcome.is_accepted());

    let done = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(done.state, RunState::Completed, "{:?}", done.failure);
    assert!(done.question.is_none());
    assert_sessions_released(&orchestrator, &run_id);
    assert_eq!(orchestrator.admission().active, 0);
}

/// A public landing page whose login form sits behind a link
fn storefront() -> Site {
    Site::new()
        .page(
            "/",
            "Storefront",
            "Welcome to the store",
            vec![
                control(ControlKind::Nav, "#nav", "Main"),
                link("#about", "About", "/about"),
                link("#signin", "Sign in", "/login"),
            ],
        )
        .page(
            "/about",
            "About",
            "About the store",
            vec![control(ControlKind::Nav, "#nav", "Main")],
        )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_formless_landing_still_asks_for_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(storefront()));
    let orchestrator = orchestrator(test_config(dir.path()), driver).await;

    let run_id = orchestrator.create_run(request("store")).unwrap();
    let waiting = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(waiting.state, RunState::WaitLoginInput, "{:?}", waiting.failure);
    assert_eq!(
        visited(&waiting),
        vec![RunState::Init, RunState::SessionCheck, RunState::WaitLoginInput]
    );
    assert_eq!(
        waiting.question.map(|q| q.id).as_deref(),
        Some(LOGIN_CREDENTIALS_QUESTION)
    );

    orchestrator.cancel(&run_id).unwrap();
    assert_eq!(orchestrator.admission().active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auth_none_goes_straight_to_context_detect() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(storefront()));
    let orchestrator = orchestrator(test_config(dir.path()), driver).await;

    let mut req = request("store");
    req.auth.auth_type = AuthType::None;
    let run_id = orchestrator.create_run(req).unwrap();

    let scoped = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(scoped.state, RunState::WaitTestSelection, "{:?}", scoped.failure);
    let states = visited(&scoped);
    assert_eq!(
        &states[..3],
        &[RunState::Init, RunState::SessionCheck, RunState::ContextDetect]
    );
    assert!(!states.contains(&RunState::WaitLoginInput));
    assert!(!states.contains(&RunState::LoginAttempt));

    orchestrator.cancel(&run_id).unwrap();
    assert_sessions_released(&orchestrator, &run_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_preset_scope_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(Site::shop()));
    let orchestrator = orchestrator(test_config(dir.path()), Arc::clone(&driver)).await;

    let mut req = request("shop");
    req.variables.insert(TEST_SCOPE_VARIABLE.to_string(), json!("all"));
    let run_id = orchestrator.create_run(req).unwrap();

    let done = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(done.state, RunState::Completed, "{:?}", done.failure);
    let states = visited(&done);
    assert!(states.contains(&RunState::WaitTestSelection));
    assert!(!states.contains(&RunState::WaitLoginInput));
    assert_eq!(states.last(), Some(&RunState::Completed));

    let names: Vec<String> = orchestrator
        .artifacts(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec![DISCOVERY_DOC, TEST_CASES_DOC, REPORT_DOC]);

    let discovery = orchestrator.fetch_artifact(&run_id, DISCOVERY_DOC).await.unwrap();
    let urls: Vec<&str> = discovery["pages"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["url"].as_str())
        .collect();
    assert!(urls.iter().any(|u| u.ends_with("/orders")));
    assert!(urls.iter().all(|u| !u.contains("logout")));

    let cases = orchestrator.fetch_artifact(&run_id, TEST_CASES_DOC).await.unwrap();
    let total = cases["total_test_cases"].as_u64().unwrap();
    assert!(total > 0);
    let statuses: Vec<&str> = cases["all_test_cases"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["status"].as_str())
        .collect();
    assert_eq!(statuses.len() as u64, total);
    assert!(statuses.iter().all(|s| *s == "passed" || *s == "failed"));

    let report = orchestrator.fetch_artifact(&run_id, REPORT_DOC).await.unwrap();
    assert_eq!(report["totals"]["total"].as_u64(), Some(total));
    assert_eq!(report["totals"]["pending"].as_u64(), Some(0));
    assert!(!report["scenarios"].as_array().unwrap().is_empty());

    assert_sessions_released(&orchestrator, &run_id);
    assert_eq!(driver.launched(), driver.closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_login_reasks_until_bound() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.login.max_attempts = 2;
    let driver = Arc::new(ScriptedDriver::new(Site::shop().with_login("qa", "right")));
    let orchestrator = orchestrator(config, driver).await;

    let run_id = orchestrator.create_run(request("shop")).unwrap();
    orchestrator.wait_settled(&run_id).await.unwrap();

    orchestrator
        .submit_answer(answer(&run_id, LOGIN_CREDENTIALS_QUESTION, "qa,wrong"))
        .unwrap();
    let retry = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(retry.state, RunState::WaitLoginInput);
    let question = retry.question.expect("revised question");
    assert_eq!(question.id, LOGIN_CREDENTIALS_QUESTION);
    let context = question.context.expect("question context");
    assert_eq!(context["attempt"], 1);
    assert!(context["reason"].as_str().is_some());

    orchestrator
        .submit_answer(answer(&run_id, LOGIN_CREDENTIALS_QUESTION, "qa,still-wrong"))
        .unwrap();
    let failed = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(failed.state, RunState::Failed);
    let failure = failed.failure.expect("failure recorded");
    assert_eq!(failure.kind, FailureKind::Login);
    assert!(!failure.message.contains("still-wrong"));
    assert_sessions_released(&orchestrator, &run_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_answers_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(Site::shop().with_login("qa", "pw")));
    let orchestrator = orchestrator(test_config(dir.path()), driver).await;

    let run_id = orchestrator.create_run(request("shop")).unwrap();
    orchestrator.wait_settled(&run_id).await.unwrap();

    let wrong_id = orchestrator
        .submit_answer(answer(&run_id, TEST_SCOPE_QUESTION, "all"))
        .unwrap();
    assert!(matches!(wrong_id, AnswerOutcome::Rejected { .. }));

    let malformed = orchestrator
        .submit_answer(answer(&run_id, LOGIN_CREDENTIALS_QUESTION, "only-a-username"))
        .unwrap();
    assert!(!malformed.is_accepted());

    let status = orchestrator.status(&run_id).unwrap();
    assert_eq!(status.state, RunState::WaitLoginInput);
    assert!(status.question.is_some());

    assert!(matches!(
        orchestrator.submit_answer(answer("no-such-run", LOGIN_CREDENTIALS_QUESTION, "a,b")),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(orchestrator.status("no-such-run"), Err(Error::NotFound { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_mid_discovery_releases_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.discovery.max_pages = 80;
    config.discovery.max_depth = 100;
    let site = Site::chain(80).with_navigate_delay(Duration::from_millis(20));
    let driver = Arc::new(ScriptedDriver::new(site));
    let orchestrator = orchestrator(config, Arc::clone(&driver)).await;

    let run_id = orchestrator.create_run(request("chain")).unwrap();
    wait_for_state(&orchestrator, &run_id, RunState::DiscoveryRunning).await;
    orchestrator.cancel(&run_id).unwrap();

    let cancelled = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(cancelled.state, RunState::Failed);
    let failure = cancelled.failure.expect("failure recorded");
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.state, RunState::DiscoveryRunning);

    assert_sessions_released(&orchestrator, &run_id);
    assert_eq!(driver.launched(), driver.closed());
    assert_eq!(orchestrator.admission().active, 0);
    assert!(driver.visits() < 80);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_while_suspended() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(Site::shop().with_login("qa", "pw")));
    let orchestrator = orchestrator(test_config(dir.path()), driver).await;

    let run_id = orchestrator.create_run(request("shop")).unwrap();
    orchestrator.wait_settled(&run_id).await.unwrap();

    let snapshot = orchestrator.cancel(&run_id).unwrap();
    assert_eq!(snapshot.state, RunState::Failed);
    assert_eq!(snapshot.failure.map(|f| f.kind), Some(FailureKind::Cancelled));
    assert!(snapshot.question.is_none());

    let late = orchestrator
        .submit_answer(answer(&run_id, LOGIN_CREDENTIALS_QUESTION, "qa,pw"))
        .unwrap();
    assert!(!late.is_accepted());
    assert_sessions_released(&orchestrator, &run_id);
    assert_eq!(orchestrator.admission().active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_as_run_suspends_releases_admission() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.admission.max_runs_per_flow = 1;
    let driver = Arc::new(ScriptedDriver::new(Site::shop().with_login("qa", "pw")));
    let orchestrator = orchestrator(config, driver).await;

    for round in 0..200 {
        let run_id = orchestrator.create_run(request("shop")).unwrap();
        // Cancel as soon as the suspension is visible, while the segment
        // may still be winding down
        loop {
            let state = orchestrator.status(&run_id).unwrap().state;
            if state == RunState::WaitLoginInput || state.is_terminal() {
                break;
            }
            tokio::task::yield_now().await;
        }
        orchestrator.cancel(&run_id).unwrap();

        let settled = tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_settled(&run_id))
            .await
            .expect("run settles after cancel")
            .unwrap();
        assert_eq!(settled.state, RunState::Failed, "round {}", round);
        assert_eq!(orchestrator.admission().active, 0, "round {}", round);
        assert_eq!(orchestrator.status(&run_id).unwrap().state, RunState::Failed);
    }

    let counts = orchestrator.session_counts();
    assert_eq!(counts.acquired, counts.released, "{:?}", counts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finished_runs_answer_from_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(Site::shop()));
    let orchestrator = orchestrator(test_config(dir.path()), driver).await;

    let mut req = request("shop");
    req.variables.insert(TEST_SCOPE_VARIABLE.to_string(), json!("all"));
    let run_id = orchestrator.create_run(req).unwrap();
    let done = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(done.state, RunState::Completed, "{:?}", done.failure);

    // Repeated lookups keep working after the run leaves memory
    assert_eq!(orchestrator.wait_settled(&run_id).await.unwrap().state, RunState::Completed);
    assert_eq!(orchestrator.status(&run_id).unwrap().state, RunState::Completed);
    assert_eq!(orchestrator.cancel(&run_id).unwrap().state, RunState::Completed);
    let late = orchestrator
        .submit_answer(answer(&run_id, TEST_SCOPE_QUESTION, "all"))
        .unwrap();
    assert!(!late.is_accepted());
    assert_eq!(orchestrator.list_runs().len(), 1);
}

#[tokio::test]
async fn test_guard_refusals_are_synchronous() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(Site::shop()));
    let orchestrator = orchestrator(test_config(dir.path()), Arc::clone(&driver)).await;

    let mut production = request("shop");
    production.environment = "Production".to_string();
    assert!(matches!(orchestrator.create_run(production), Err(Error::Guard(_))));

    let mut no_tenant = request("shop");
    no_tenant.variables.clear();
    assert!(matches!(orchestrator.create_run(no_tenant), Err(Error::Guard(_))));

    let mut bad_url = request("shop");
    bad_url.base_url = "ftp://app.test".to_string();
    assert!(matches!(orchestrator.create_run(bad_url), Err(Error::InvalidConfig(_))));

    assert_eq!(driver.launched(), 0);
    assert!(orchestrator.list_runs().is_empty());
    assert_eq!(orchestrator.admission().active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admission_caps_hold_until_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.admission.max_concurrent_runs = 2;
    config.admission.max_runs_per_flow = 1;
    let driver = Arc::new(ScriptedDriver::new(Site::shop().with_login("qa", "pw")));
    let orchestrator = orchestrator(config, driver).await;

    let first = orchestrator.create_run(request("shop")).unwrap();
    assert!(matches!(
        orchestrator.create_run(request("shop")),
        Err(Error::AdmissionRejected(_))
    ));
    let second = orchestrator.create_run(request("billing")).unwrap();
    assert!(matches!(
        orchestrator.create_run(request("reports")),
        Err(Error::AdmissionRejected(_))
    ));

    // A suspended run keeps its slot
    orchestrator.wait_settled(&first).await.unwrap();
    assert_eq!(orchestrator.admission().active, 2);

    orchestrator.cancel(&first).unwrap();
    orchestrator.wait_settled(&first).await.unwrap();
    assert_eq!(orchestrator.admission().active, 1);
    let third = orchestrator.create_run(request("shop")).unwrap();

    let runs = orchestrator.list_runs();
    let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids.len(), 3);
    for id in [&first, &second, &third] {
        assert!(ids.contains(&id.as_str()));
    }

    orchestrator.cancel(&second).unwrap();
    orchestrator.cancel(&third).unwrap();
    orchestrator.wait_settled(&second).await.unwrap();
    orchestrator.wait_settled(&third).await.unwrap();
    assert_eq!(orchestrator.admission().active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_ai_output_falls_back_to_rules() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.ai.enabled = true;
    config.ai.provider = ProviderSettings::Local {
        endpoint: "http://127.0.0.1:11434".to_string(),
        model: "scripted".to_string(),
    };
    config.generation.mode = GenerationMode::AiOnly;

    let provider = Arc::new(ScriptedProvider::new("Sure! Here are some ideas: {not json"));
    let providers = Arc::new(ProviderCache::new());
    providers.insert(ProviderKind::Local, "scripted", provider.clone());

    let artifacts = ArtifactStore::new(dir.path().join("artifacts")).await.unwrap();
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let driver = Arc::new(ScriptedDriver::new(Site::shop()));
    let orchestrator = Orchestrator::with_parts(config, driver, store, artifacts, providers).unwrap();

    let mut req = request("shop");
    req.variables.insert(TEST_SCOPE_VARIABLE.to_string(), json!("all"));
    let run_id = orchestrator.create_run(req).unwrap();
    let done = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(done.state, RunState::Completed, "{:?}", done.failure);

    assert!(provider.calls() > 0);
    let cases = orchestrator.fetch_artifact(&run_id, TEST_CASES_DOC).await.unwrap();
    let all = cases["all_test_cases"].as_array().unwrap();
    assert!(!all.is_empty());
    assert!(all.iter().all(|c| c["source"] == "rule"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_records_persist_redacted() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.store.backend = StoreBackend::Sqlite;
    let db_path = config.db_path();
    let driver = Arc::new(ScriptedDriver::new(Site::shop().with_login("qa", "pw-7f3a")));
    let orchestrator = orchestrator(config, driver).await;

    let mut req = request("shop");
    req.auth.username = Some("qa".to_string());
    req.auth.password = Some("pw-7f3a".to_string());
    let run_id = orchestrator.create_run(req).unwrap();

    let waiting = orchestrator.wait_settled(&run_id).await.unwrap();
    assert_eq!(waiting.state, RunState::WaitTestSelection, "{:?}", waiting.failure);
    // Stored credentials skip the question
    assert!(!visited(&waiting).contains(&RunState::WaitLoginInput));

    let store = SqliteRunStore::new(Database::open(&db_path).unwrap());
    let stored = store.load(&run_id).unwrap().expect("persisted record");
    assert_eq!(stored.state, RunState::WaitTestSelection);
    assert_eq!(stored.history, waiting.history);
    let text = serde_json::to_string(&stored).unwrap();
    assert!(!text.contains("pw-7f3a"));

    orchestrator.cancel(&run_id).unwrap();
}
