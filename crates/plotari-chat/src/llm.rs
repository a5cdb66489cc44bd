//! Language-model contract and an OpenAI-compatible chat client.
//!
//! An unavailable model is a normal operating condition: every caller has
//! a heuristic or template path to fall back on, so calls are made once and
//! never retried.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use plotari_core::config::LlmConfig;
use plotari_core::error::ProviderError;
use plotari_core::types::Role;

/// One prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A single completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object instead of prose.
    pub json_mode: bool,
}

/// A text-completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

// =============================================================================
// OpenAI-compatible client
// =============================================================================

/// Chat completions over any OpenAI-compatible REST endpoint.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.timeout())
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            timeout: config.timeout(),
        })
    }

    /// Build a client when the model is enabled and the key variable named
    /// by `api_key_env` is set.
    pub fn from_env(config: &LlmConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let key = std::env::var(&config.api_key_env).ok()?;
        if key.trim().is_empty() {
            return None;
        }
        Self::new(config, key).ok()
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        messages.extend(request.messages.iter().map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({"role": role, "content": m.content})
        }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::timeout("chat completion", self.timeout)
                } else {
                    ProviderError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                code: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let content = extract_content(&body)?;
        debug!(model = %self.model, chars = content.len(), "Chat completion received");
        Ok(content)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// `choices[0].message.content` of a chat-completions response.
fn extract_content(body: &Value) -> Result<String, ProviderError> {
    body["choices"]
        .get(0)
        .and_then(|choice| choice["message"]["content"].as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".into()))
}

// =============================================================================
// UnavailableModel
// =============================================================================

/// Stand-in used when no credentials are configured.
#[derive(Debug, Clone, Default)]
pub struct UnavailableModel;

#[async_trait]
impl LanguageModel for UnavailableModel {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable("no language model configured".into()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json_mode: bool) -> CompletionRequest {
        CompletionRequest {
            system: "You extract intents.".into(),
            messages: vec![
                PromptMessage::user("hi"),
                PromptMessage::assistant("hello"),
                PromptMessage::user("3 bed in Springfield"),
            ],
            temperature: 0.2,
            max_tokens: 300,
            json_mode,
        }
    }

    #[test]
    fn test_request_body_shape() {
        let model = OpenAiChatModel::new(&LlmConfig::default(), "sk-test").unwrap();
        let body = model.request_body(&request(true));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["messages"][3]["content"], "3 bed in Springfield");
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["response_format"]["type"], "json_object");

        let body = model.request_body(&request(false));
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_extract_content() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "ok"}}]});
        assert_eq!(extract_content(&body).unwrap(), "ok");

        let err = extract_content(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn test_from_env_requires_enabled_and_key() {
        let mut config = LlmConfig {
            api_key_env: "PLOTARI_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        };
        assert!(OpenAiChatModel::from_env(&config).is_none());
        config.enabled = false;
        assert!(OpenAiChatModel::from_env(&config).is_none());
    }

    #[tokio::test]
    async fn test_unavailable_model_always_fails() {
        let err = UnavailableModel.complete(&request(false)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert_eq!(UnavailableModel.name(), "unavailable");
    }
}
