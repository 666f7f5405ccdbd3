//! Test plan executor

use std::time::Instant;

use qaflow_browser::BrowserSession;
use qaflow_common::{Error, Evidence, NetworkExchange, Result, TestCase, TestStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;

/// Result of executing a plan
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub cases: Vec<TestCase>,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

pub struct Executor {
    config: ExecutionConfig,
}

impl Executor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// Run every case in order. A failing case never stops the plan.
    pub async fn execute(
        &self,
        session: &dyn BrowserSession,
        plan: &[TestCase],
        cancel: &CancellationToken,
    ) -> Result<ExecutionSummary> {
        let start = Instant::now();
        let mut summary = ExecutionSummary::default();

        info!("Executing {} test case(s)...", plan.len());

        for case in plan {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let executed = self.run_case(session, case).await;
            match executed.status {
                TestStatus::Passed => {
                    summary.passed += 1;
                    info!("✓ {} ({} ms)", executed.title, executed.duration_ms);
                }
                _ => {
                    summary.failed += 1;
                    error!(
                        "✗ {} - {}",
                        executed.title,
                        executed.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            summary.cases.push(executed);
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Test Results: {} passed, {} failed ({} ms)",
            summary.passed, summary.failed, summary.duration_ms
        );
        Ok(summary)
    }

    /// Execute one case and attach its results and evidence
    pub async fn run_case(&self, session: &dyn BrowserSession, case: &TestCase) -> TestCase {
        let start = Instant::now();
        let mut done = case.clone();
        debug!(case = %case.id, steps = case.steps.len(), "Running test case");

        match session.run_actions(&case.steps, self.config.step_timeout_ms).await {
            Ok(outcomes) => {
                let completed = outcomes.len() == case.steps.len() && outcomes.iter().all(|o| o.success);
                done.error = outcomes
                    .iter()
                    .find(|o| !o.success)
                    .map(|o| format!("{}: {}", o.label, o.error.as_deref().unwrap_or("failed")))
                    .or_else(|| (!completed).then(|| "steps did not complete".to_string()));
                done.step_results = outcomes.into_iter().map(|o| o.into_record()).collect();
                done.status = if completed {
                    TestStatus::Passed
                } else {
                    TestStatus::Failed
                };
            }
            Err(e) => {
                done.status = TestStatus::Failed;
                done.error = Some(e.to_string());
            }
        }

        done.evidence = self.collect_evidence(session, &done).await;
        done.duration_ms = start.elapsed().as_millis() as u64;
        done
    }

    async fn collect_evidence(&self, session: &dyn BrowserSession, case: &TestCase) -> Evidence {
        let mut evidence = Evidence::default();

        let failed = case.status == TestStatus::Failed;
        if failed || self.config.screenshot_on_success {
            match session.screenshot(&case.id).await {
                Ok(path) => evidence.screenshot_path = Some(path.to_string_lossy().into_owned()),
                Err(e) => warn!(case = %case.id, "Screenshot failed: {}", e),
            }
        }

        match session.network_log().await {
            Ok(log) => evidence.network = network_snippet(&log, self.config.network_snippet_size),
            Err(e) => debug!(case = %case.id, "Network log unavailable: {}", e),
        }
        evidence
    }
}

/// Error responses plus the trailing `tail` exchanges, in log order
pub fn network_snippet(log: &[NetworkExchange], tail: usize) -> Vec<NetworkExchange> {
    let tail_start = log.len().saturating_sub(tail);
    log.iter()
        .enumerate()
        .filter(|(i, x)| x.status >= 400 || *i >= tail_start)
        .map(|(_, x)| x.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(url: &str, status: u16) -> NetworkExchange {
        NetworkExchange {
            url: url.to_string(),
            method: "GET".to_string(),
            status,
            duration_ms: 1,
            resource_type: "xhr".to_string(),
        }
    }

    #[test]
    fn test_network_snippet_keeps_errors_and_tail() {
        let log = vec![
            exchange("/a", 200),
            exchange("/b", 500),
            exchange("/c", 200),
            exchange("/d", 404),
            exchange("/e", 200),
            exchange("/f", 200),
        ];
        let snippet = network_snippet(&log, 2);
        let urls: Vec<&str> = snippet.iter().map(|x| x.url.as_str()).collect();
        assert_eq!(urls, vec!["/b", "/d", "/e", "/f"]);

        assert!(network_snippet(&[], 5).is_empty());
        assert_eq!(network_snippet(&log, 0).len(), 2);
    }
}
