//! Pre-flight safety guards
//!
//! Guards are pure policy checks evaluated before a run is admitted and again
//! before any stage that acts on the target. They return a [`GuardVerdict`]
//! value; conversion into [`Error::Guard`] happens only at the admission
//! boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Environment labels treated as production
pub const DEFAULT_PRODUCTION_INDICATORS: &[&str] = &["prod", "production", "live", "prd"];

/// Variable that marks a run as targeting a designated test tenant
pub const DEFAULT_TEST_TENANT_FLAG: &str = "testTenant";

/// Environment variable that force-allows production targets
pub const ALLOW_PRODUCTION_ENV: &str = "QAFLOW_ALLOW_PRODUCTION";

/// Guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardPolicy {
    /// Environment labels (case-insensitive) that denote production
    pub production_indicators: Vec<String>,

    /// Flow identifiers allowed to target production
    pub allowed_flows: Vec<String>,

    /// Set only from `QAFLOW_ALLOW_PRODUCTION`, never from the config file
    #[serde(skip)]
    pub force_allow_production: bool,

    /// Enforce the test-tenant variable
    pub require_test_tenant: bool,

    /// Name of the test-tenant variable
    pub test_tenant_flag: String,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            production_indicators: DEFAULT_PRODUCTION_INDICATORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_flows: Vec::new(),
            force_allow_production: false,
            require_test_tenant: true,
            test_tenant_flag: DEFAULT_TEST_TENANT_FLAG.to_string(),
        }
    }
}

impl GuardPolicy {
    /// Apply `QAFLOW_ALLOW_PRODUCTION` from the process environment
    pub fn with_env_overrides(mut self) -> Self {
        self.force_allow_production = std::env::var(ALLOW_PRODUCTION_ENV)
            .map(|v| parse_truthy(&v))
            .unwrap_or(false);
        self
    }

    /// Whether an environment label denotes production
    pub fn is_production(&self, environment: &str) -> bool {
        let label = environment.trim().to_lowercase();
        if label.is_empty() {
            return false;
        }
        let indicators: Vec<String> = self
            .production_indicators
            .iter()
            .map(|s| s.trim().to_lowercase())
            .collect();
        if indicators.contains(&label) {
            return true;
        }
        label
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|token| !token.is_empty())
            .any(|token| indicators.iter().any(|i| i == token))
    }
}

/// Only `1`, `true` and `yes` (any case) enable a flag
pub fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Which guard produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    Environment,
    TestAccount,
}

/// Outcome of a guard check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GuardVerdict {
    Allowed,
    Denied { guard: GuardKind, reason: String },
}

impl GuardVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardVerdict::Allowed)
    }

    /// Convert a denial into `Error::Guard`
    pub fn into_result(self) -> Result<()> {
        match self {
            GuardVerdict::Allowed => Ok(()),
            GuardVerdict::Denied { reason, .. } => Err(Error::Guard(reason)),
        }
    }

    /// First denial wins
    pub fn and(self, other: impl FnOnce() -> GuardVerdict) -> GuardVerdict {
        match self {
            GuardVerdict::Allowed => other(),
            denied => denied,
        }
    }
}

/// Deny production environments unless force-allowed or the flow is allow-listed
pub fn check_environment(policy: &GuardPolicy, environment: &str, flow_id: &str) -> GuardVerdict {
    if !policy.is_production(environment) {
        return GuardVerdict::Allowed;
    }
    if policy.force_allow_production {
        return GuardVerdict::Allowed;
    }
    if policy.allowed_flows.iter().any(|f| f == flow_id) {
        return GuardVerdict::Allowed;
    }
    GuardVerdict::Denied {
        guard: GuardKind::Environment,
        reason: format!(
            "environment '{}' is production; set {} or allow-list flow '{}'",
            environment.trim(),
            ALLOW_PRODUCTION_ENV,
            flow_id
        ),
    }
}

/// Require the test-tenant variable to be boolean `true`
pub fn check_test_account(policy: &GuardPolicy, variables: &Map<String, Value>) -> GuardVerdict {
    if !policy.require_test_tenant {
        return GuardVerdict::Allowed;
    }
    match variables.get(&policy.test_tenant_flag) {
        Some(Value::Bool(true)) => GuardVerdict::Allowed,
        Some(_) => GuardVerdict::Denied {
            guard: GuardKind::TestAccount,
            reason: format!("variable '{}' is not true", policy.test_tenant_flag),
        },
        None => GuardVerdict::Denied {
            guard: GuardKind::TestAccount,
            reason: format!("variable '{}' is missing", policy.test_tenant_flag),
        },
    }
}

/// Both guards, environment first
pub fn check_all(
    policy: &GuardPolicy,
    environment: &str,
    flow_id: &str,
    variables: &Map<String, Value>,
) -> GuardVerdict {
    check_environment(policy, environment, flow_id)
        .and(|| check_test_account(policy, variables))
}
