//! AI generation abstraction
//!
//! Providers implement [`AiProvider`]. Structured generation never fails:
//! transport errors, unavailable backends and unparseable output all
//! degrade to the schema's empty value, so callers handle "no usable
//! output" and "no provider" the same way.

pub mod cache;
pub mod cloud;
pub mod local;

use async_trait::async_trait;
use qaflow_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub use cache::ProviderCache;
pub use cloud::CloudProvider;
pub use local::LocalProvider;

/// Token budget for structured generation
const STRUCTURED_MAX_TOKENS: u32 = 2048;

/// Failures inside a provider; never escape this module's structured API
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider output: {0}")]
    Parse(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Cloud,
}

fn default_local_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_cloud_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "QAFLOW_AI_API_KEY".to_string()
}

/// Provider selection, one variant per backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSettings {
    Disabled,
    /// Ollama-compatible local inference server
    Local {
        #[serde(default = "default_local_endpoint")]
        endpoint: String,
        model: String,
    },
    /// OpenAI-compatible chat completions API
    Cloud {
        #[serde(default = "default_cloud_endpoint")]
        endpoint: String,
        model: String,
        /// Environment variable holding the API key
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
    },
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self::Disabled
    }
}

impl ProviderSettings {
    pub fn kind(&self) -> Option<ProviderKind> {
        match self {
            ProviderSettings::Disabled => None,
            ProviderSettings::Local { .. } => Some(ProviderKind::Local),
            ProviderSettings::Cloud { .. } => Some(ProviderKind::Cloud),
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            ProviderSettings::Disabled => None,
            ProviderSettings::Local { model, .. } | ProviderSettings::Cloud { model, .. } => Some(model),
        }
    }

    /// Check the variant's fields
    pub fn validate(&self) -> Result<()> {
        match self {
            ProviderSettings::Disabled => Ok(()),
            ProviderSettings::Local { endpoint, model } => {
                validate_endpoint(endpoint)?;
                validate_model(model)
            }
            ProviderSettings::Cloud {
                endpoint,
                model,
                api_key_env,
            } => {
                validate_endpoint(endpoint)?;
                validate_model(model)?;
                if api_key_env.trim().is_empty() {
                    return Err(Error::InvalidConfig(
                        "ai.provider.api_key_env must name an environment variable".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let parsed = url::Url::parse(endpoint)
        .map_err(|e| Error::InvalidConfig(format!("ai.provider.endpoint '{}': {}", endpoint, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::InvalidConfig(format!(
            "ai.provider.endpoint scheme '{}' is not http(s)",
            other
        ))),
    }
}

fn validate_model(model: &str) -> Result<()> {
    if model.trim().is_empty() {
        return Err(Error::InvalidConfig("ai.provider.model is empty".to_string()));
    }
    Ok(())
}

/// Shape of the value expected from structured generation
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSchema {
    /// A JSON object; the hint describes its fields
    Object { hint: Value },
    /// A JSON array; the hint describes one item
    Array { item_hint: Value },
}

impl OutputSchema {
    /// Value returned when no usable output exists
    pub fn empty_value(&self) -> Value {
        match self {
            OutputSchema::Object { .. } => Value::Object(serde_json::Map::new()),
            OutputSchema::Array { .. } => Value::Array(Vec::new()),
        }
    }

    /// Coerce a parsed value into the schema's shape
    pub fn conform(&self, value: Value) -> Option<Value> {
        match (self, value) {
            (OutputSchema::Object { .. }, v @ Value::Object(_)) => Some(v),
            (OutputSchema::Array { .. }, v @ Value::Array(_)) => Some(v),
            // `{"items": [...]}` style wrappers around the requested array
            (OutputSchema::Array { .. }, Value::Object(map)) => {
                let mut arrays = map.into_iter().filter_map(|(_, v)| match v {
                    Value::Array(_) => Some(v),
                    _ => None,
                });
                match (arrays.next(), arrays.next()) {
                    (Some(only), None) => Some(only),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            OutputSchema::Object { hint } => format!("a JSON object shaped like {}", hint),
            OutputSchema::Array { item_hint } => {
                format!("a JSON array whose items are shaped like {}", item_hint)
            }
        }
    }
}

/// Pull the first JSON document out of model output
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = strip_code_fence(text.trim());
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find(|c| c == '{' || c == '[')?;
    let close = match trimmed.as_bytes()[start] {
        b'{' => '}',
        _ => ']',
    };
    let end = trimmed.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Text and structured generation backed by an LLM
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    /// Whether the backend can currently serve requests
    async fn is_available(&self) -> bool;

    async fn generate_text(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> ProviderResult<String>;

    /// Generate a value of the given shape; the empty value on any failure
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &OutputSchema,
        system_prompt: Option<&str>,
        temperature: f32,
    ) -> Value {
        let request = format!(
            "{}\n\nRespond with {} and nothing else.",
            prompt,
            schema.describe()
        );
        let text = match self
            .generate_text(&request, system_prompt, temperature, STRUCTURED_MAX_TOKENS)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(model = self.model(), "Structured generation failed: {}", e);
                return schema.empty_value();
            }
        };

        match extract_json(&text).and_then(|v| schema.conform(v)) {
            Some(value) => value,
            None => {
                debug!(model = self.model(), "Unusable structured output ({} bytes)", text.len());
                schema.empty_value()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Canned(ProviderResult<String>);

    #[async_trait]
    impl AiProvider for Canned {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }
        fn model(&self) -> &str {
            "canned"
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn generate_text(&self, _p: &str, _s: Option<&str>, _t: f32, _m: u32) -> ProviderResult<String> {
            match &self.0 {
                Ok(text) => Ok(text.clone()),
                Err(_) => Err(ProviderError::Unavailable("down".into())),
            }
        }
    }

    fn array_schema() -> OutputSchema {
        OutputSchema::Array {
            item_hint: json!({"title": "string"}),
        }
    }

    #[tokio::test]
    async fn test_malformed_output_returns_empty_value() {
        for raw in ["not json at all", "{\"title\": ", "```json\n[1, 2\n```", ""] {
            let provider = Canned(Ok(raw.to_string()));
            let out = provider
                .generate_structured("p", &array_schema(), None, 0.0)
                .await;
            assert_eq!(out, json!([]), "input {:?}", raw);

            let out = provider
                .generate_structured("p", &OutputSchema::Object { hint: json!({}) }, None, 0.0)
                .await;
            assert_eq!(out, json!({}), "input {:?}", raw);
        }
    }

    #[tokio::test]
    async fn test_provider_error_returns_empty_value() {
        let provider = Canned(Err(ProviderError::Unavailable("x".into())));
        let out = provider
            .generate_structured("p", &array_schema(), None, 0.0)
            .await;
        assert_eq!(out, json!([]));
    }

    #[tokio::test]
    async fn test_wrong_shape_returns_empty_value() {
        let provider = Canned(Ok("{\"a\": 1}".to_string()));
        let out = provider
            .generate_structured("p", &array_schema(), None, 0.0)
            .await;
        assert_eq!(out, json!([]));
    }

    #[tokio::test]
    async fn test_fenced_and_wrapped_output_is_accepted() {
        let provider = Canned(Ok(
            "Sure! ```json\n{\"test_cases\": [{\"title\": \"x\"}]}\n``` hope this helps".to_string(),
        ));
        let out = provider
            .generate_structured("p", &array_schema(), None, 0.0)
            .await;
        assert_eq!(out, json!([{"title": "x"}]));
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), Some(json!({"a": 1})));
        assert_eq!(extract_json("here: [1,2,3] done"), Some(json!([1, 2, 3])));
        assert_eq!(extract_json("nothing"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn test_settings_validation() {
        assert!(ProviderSettings::Disabled.validate().is_ok());
        assert!(ProviderSettings::Local {
            endpoint: default_local_endpoint(),
            model: "llama3".into()
        }
        .validate()
        .is_ok());
        assert!(ProviderSettings::Local {
            endpoint: "ftp://host".into(),
            model: "llama3".into()
        }
        .validate()
        .is_err());
        assert!(ProviderSettings::Cloud {
            endpoint: default_cloud_endpoint(),
            model: " ".into(),
            api_key_env: "K".into()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_settings_parse_tagged() {
        let settings: ProviderSettings =
            toml::from_str("kind = \"cloud\"\nmodel = \"gpt-4o-mini\"").unwrap();
        match settings {
            ProviderSettings::Cloud {
                endpoint,
                api_key_env,
                ..
            } => {
                assert_eq!(endpoint, default_cloud_endpoint());
                assert_eq!(api_key_env, "QAFLOW_AI_API_KEY");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(toml::from_str::<ProviderSettings>("kind = \"quantum\"").is_err());
    }
}
