//! Engine configuration

use std::path::{Path, PathBuf};

use qaflow_browser::PlaywrightConfig;
use qaflow_common::{Error, GuardPolicy, Result};
use serde::{Deserialize, Serialize};

use crate::ai::ProviderSettings;

/// Engine configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// State directory (database, artifacts)
    pub store_path: PathBuf,

    /// Safety guards
    pub guard: GuardPolicy,

    /// Concurrency caps
    pub admission: AdmissionConfig,

    /// AI provider selection
    pub ai: AiConfig,

    /// Test plan generation
    pub generation: GenerationConfig,

    /// Crawl budget and link policy
    pub discovery: DiscoveryConfig,

    /// Login pipeline
    pub login: LoginConfig,

    /// Run and step timeouts, evidence
    pub execution: ExecutionConfig,

    /// Artifact documents
    pub artifacts: ArtifactConfig,

    /// Run record persistence
    pub store: StoreConfig,

    /// Playwright driver
    pub browser: PlaywrightConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: qaflow_common::default_store_path(),
            guard: GuardPolicy::default(),
            admission: AdmissionConfig::default(),
            ai: AiConfig::default(),
            generation: GenerationConfig::default(),
            discovery: DiscoveryConfig::default(),
            login: LoginConfig::default(),
            execution: ExecutionConfig::default(),
            artifacts: ArtifactConfig::default(),
            store: StoreConfig::default(),
            browser: PlaywrightConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Concurrently active runs across all flows
    pub max_concurrent_runs: usize,

    /// Concurrently active runs per flow
    pub max_runs_per_flow: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_runs_per_flow: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,

    /// Request timeout
    pub timeout_secs: u64,

    pub temperature: f32,

    pub max_tokens: u32,

    /// Backend and model
    pub provider: ProviderSettings,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 60,
            temperature: 0.2,
            max_tokens: 2048,
            provider: ProviderSettings::Disabled,
        }
    }
}

/// How test plans are built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    RuleBased,
    AiOnly,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub mode: GenerationMode,

    /// Directory of operator schema extensions (`*.yaml`)
    pub schema_dir: Option<PathBuf>,

    /// Pages sent to the AI provider per run
    pub max_ai_pages: usize,

    /// Cases kept per plan
    pub max_cases: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: GenerationMode::Hybrid,
            schema_dir: None,
            max_ai_pages: 10,
            max_cases: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub max_pages: usize,

    pub max_duration_secs: u64,

    /// Link distance from the entry page
    pub max_depth: u32,

    /// Case-insensitive substrings excluding a link from the crawl
    pub excluded_patterns: Vec<String>,

    /// File extensions never crawled
    pub excluded_extensions: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_pages: 25,
            max_duration_secs: 180,
            max_depth: 4,
            excluded_patterns: [
                "logout",
                "signout",
                "sign-out",
                "log-out",
                "delete",
                "remove",
                "destroy",
                "unsubscribe",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            excluded_extensions: ["pdf", "zip", "csv", "xlsx", "xls", "doc", "docx", "png", "jpg", "jpeg", "gif", "svg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Login attempts before the run fails
    pub max_attempts: u32,

    /// Hosts recognised as delegated identity providers
    pub identity_provider_hosts: Vec<String>,

    /// Page text that indicates an authenticated session
    pub authenticated_markers: Vec<String>,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            identity_provider_hosts: [
                "login.microsoftonline.com",
                "accounts.google.com",
                "okta.com",
                "auth0.com",
                "onelogin.com",
                "pingidentity.com",
                "keycloak",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            authenticated_markers: ["log out", "logout", "sign out", "signout", "my account", "profile"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on each driving segment of a run
    pub run_timeout_secs: u64,

    /// Upper bound on each browser action
    pub step_timeout_ms: u64,

    /// Capture a screenshot for passing cases too
    pub screenshot_on_success: bool,

    /// Trailing exchanges kept as evidence per case
    pub network_snippet_size: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 3600,
            step_timeout_ms: 15_000,
            screenshot_on_success: false,
            network_snippet_size: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Defaults to `<store_path>/artifacts`
    pub dir: Option<PathBuf>,

    /// Runs older than this are purged
    pub retention_days: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Defaults to `<store_path>/runs.db`
    pub db_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from file; defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply safety-critical environment variables
    pub fn with_env_overrides(mut self) -> Self {
        self.guard = self.guard.with_env_overrides();
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.admission.max_concurrent_runs == 0 || self.admission.max_runs_per_flow == 0 {
            return Err(Error::InvalidConfig(
                "admission caps must be at least 1".to_string(),
            ));
        }
        if self.login.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "login.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.execution.step_timeout_ms == 0 || self.execution.run_timeout_secs == 0 {
            return Err(Error::InvalidConfig("timeouts must be positive".to_string()));
        }
        if self.ai.enabled {
            self.ai.provider.validate()?;
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store
            .db_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("runs.db"))
    }

    /// Get the artifact directory
    pub fn artifact_dir(&self) -> PathBuf {
        self.artifacts
            .dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("artifacts"))
    }
}
