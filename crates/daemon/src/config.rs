//! Configuration resolution for the front end
//!
//! File values first, then safety environment variables, then flags.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use qaflow_engine::config::StoreBackend;
use qaflow_engine::EngineConfig;
use serde_json::{Map, Value};

/// Default configuration file location
pub fn default_config_path() -> PathBuf {
    qaflow_common::default_store_path().join("config.toml")
}

/// Flags that override the configuration file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub store: Option<PathBuf>,
    pub memory_store: bool,
    pub headed: bool,
    pub max_pages: Option<usize>,
    pub no_ai: bool,
}

pub fn resolve(path: &Path, overrides: &Overrides) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?
        .with_env_overrides();

    if let Some(store) = &overrides.store {
        config.store_path = store.clone();
    }
    if overrides.memory_store {
        config.store.backend = StoreBackend::Memory;
    }
    if overrides.headed {
        config.browser.headless = false;
    }
    if let Some(max_pages) = overrides.max_pages {
        config.discovery.max_pages = max_pages;
    }
    if overrides.no_ai {
        config.ai.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

/// Parse `key=value` run variables; values are JSON when they parse as JSON
pub fn parse_variables(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut variables = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("variable '{}' is not in key=value form", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("variable '{}' has an empty name", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        variables.insert(key.to_string(), value);
    }
    Ok(variables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variables_parse_json_values() {
        let vars = parse_variables(&[
            "testTenant=true".to_string(),
            "testScope=listing,search".to_string(),
            "retries=3".to_string(),
            "note=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(vars["testTenant"], json!(true));
        assert_eq!(vars["testScope"], json!("listing,search"));
        assert_eq!(vars["retries"], json!(3));
        assert_eq!(vars["note"], json!("a=b"));
    }

    #[test]
    fn test_variables_reject_malformed_pairs() {
        assert!(parse_variables(&["novalue".to_string()]).is_err());
        assert!(parse_variables(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[discovery]\nmax_pages = 7\n\n[browser]\nheadless = true\n").unwrap();

        let from_file = resolve(&path, &Overrides::default()).unwrap();
        assert_eq!(from_file.discovery.max_pages, 7);
        assert!(from_file.browser.headless);

        let overrides = Overrides {
            store: Some(dir.path().join("state")),
            memory_store: true,
            headed: true,
            max_pages: Some(3),
            no_ai: true,
        };
        let config = resolve(&path, &overrides).unwrap();
        assert_eq!(config.discovery.max_pages, 3);
        assert!(!config.browser.headless);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.db_path(), dir.path().join("state").join("runs.db"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolve(&dir.path().join("absent.toml"), &Overrides::default()).unwrap();
        assert_eq!(config.admission.max_concurrent_runs, 4);
    }
}
