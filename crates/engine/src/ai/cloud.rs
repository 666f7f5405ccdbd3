//! Cloud backend (OpenAI-compatible chat completions)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AiProvider, ProviderError, ProviderKind, ProviderResult};

pub struct CloudProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl std::fmt::Debug for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &qaflow_common::REDACTION_MARKER)
            .finish()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

impl CloudProvider {
    pub fn new(endpoint: &str, model: &str, api_key: String, timeout: Duration) -> ProviderResult<Self> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::Unavailable("empty API key".to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl AiProvider for CloudProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        // Key presence is checked at construction; avoid a billable probe
        !self.api_key.is_empty()
    }

    async fn generate_text(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> ProviderResult<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages,
                temperature,
                max_tokens,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: qaflow_common::scrub_text(&body.chars().take(300).collect::<String>()),
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key_rejected() {
        let result = CloudProvider::new("https://api.test/v1", "m", "  ".into(), Duration::from_secs(1));
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }

    #[test]
    fn test_debug_hides_key() {
        let provider =
            CloudProvider::new("https://api.test/v1/", "m", "sk-live-123".into(), Duration::from_secs(1)).unwrap();
        let rendered = format!("{:?}", provider);
        assert!(!rendered.contains("sk-live-123"));
        assert!(rendered.contains("https://api.test/v1\""));
    }
}
