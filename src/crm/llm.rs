use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AssistantSection;

/// Fixed reply used when no model credentials are configured.
pub const PLACEHOLDER_REPLY: &str =
    "This is a placeholder response. The full AI functionality requires OpenAI API integration.";

// ── Wire types ───────────────────────────────────────────────────────

/// One message in a chat-completions conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    /// Function name, set on `role: "function"` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            name: None,
            function_call: None,
        }
    }

    /// The assistant turn that requested `call`.
    pub fn assistant_call(call: FunctionCall) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            name: None,
            function_call: Some(call),
        }
    }

    /// The result of a function call, fed back to the model.
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "function".to_string(),
            content: Some(content.into()),
            name: Some(name.into()),
            function_call: None,
        }
    }
}

/// A function invocation requested by the model. `arguments` is a JSON
/// document encoded as a string, exactly as the API returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// A callable function advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// What the model answered: free text, a function call, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: Option<String>,
    pub function_call: Option<FunctionCall>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            function_call: None,
        }
    }

    pub fn call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            content: None,
            function_call: Some(FunctionCall {
                name: name.into(),
                arguments: arguments.to_string(),
            }),
        }
    }
}

// ── Model seam ───────────────────────────────────────────────────────

/// Abstraction over the chat-completions backend for testability.
/// Real implementation: `OpenAiModel`. Offline fallback: `PlaceholderModel`.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete `messages`. With an empty `functions` slice the model must
    /// answer in text.
    async fn complete(&self, messages: &[ChatMessage], functions: &[FunctionSpec]) -> Result<ModelReply>;

    fn name(&self) -> &str;
}

/// Pick the model for the configured assistant: OpenAI when a real key is
/// present, the placeholder otherwise.
pub fn model_from_config(config: &AssistantSection) -> Result<Arc<dyn ChatModel>> {
    match config.effective_api_key() {
        Some(key) => Ok(Arc::new(OpenAiModel::new(config, key)?)),
        None => {
            tracing::warn!("No OpenAI API key configured; assistant will return placeholder replies");
            Ok(Arc::new(PlaceholderModel))
        }
    }
}

// ── OpenAI-compatible backend ────────────────────────────────────────

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "no_functions")]
    functions: &'a [FunctionSpec],
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<&'static str>,
}

fn no_functions(functions: &&[FunctionSpec]) -> bool {
    functions.is_empty()
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint with
/// function calling.
pub struct OpenAiModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiModel {
    pub fn new(config: &AssistantSection, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client for the assistant model")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiModel {
    async fn complete(&self, messages: &[ChatMessage], functions: &[FunctionSpec]) -> Result<ModelReply> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            functions,
            function_call: (!functions.is_empty()).then_some("auto"),
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("Chat completion request failed with {}: {}", status, detail.trim());
        }

        let parsed = resp
            .json::<CompletionResponse>()
            .await
            .context("Failed to parse chat completion response")?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .context("Chat completion response contained no choices")?;

        Ok(ModelReply {
            content: message.content,
            function_call: message.function_call,
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ── Placeholder ──────────────────────────────────────────────────────

/// Always answers with [`PLACEHOLDER_REPLY`] and never calls functions.
pub struct PlaceholderModel;

#[async_trait]
impl ChatModel for PlaceholderModel {
    async fn complete(&self, _messages: &[ChatMessage], _functions: &[FunctionSpec]) -> Result<ModelReply> {
        Ok(ModelReply::text(PLACEHOLDER_REPLY))
    }

    fn name(&self) -> &str {
        "placeholder"
    }
}
