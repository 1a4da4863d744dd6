use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::provider::{AnalysisProvider, TaskConfig, TaskError};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Client for any endpoint speaking the OpenAI chat-completions protocol
/// (OpenAI, Azure-style gateways, Ollama, vLLM, ...).
///
/// Model:
/// - The task prompt is sent as the `system` message.
/// - The (possibly truncated) document text is sent as the `user` message.
/// - The first choice's content, trimmed, is the task result.
#[derive(Debug, Clone)]
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TaskError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TaskError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            default_model: DEFAULT_MODEL.to_string(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(&self, text: &str, config: &TaskConfig) -> JsonValue {
        let model = config.model.as_deref().unwrap_or(&self.default_model);
        let mut body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": config.prompt},
                {"role": "user", "content": config.prepare_input(text)},
            ],
        });

        if let Some(temperature) = config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn parse_completion(raw: &str) -> Result<String, TaskError> {
    let response: CompletionResponse = serde_json::from_str(raw)
        .map_err(|e| TaskError::InvalidResponse(format!("malformed completion body: {e}")))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    if content.is_empty() {
        return Err(TaskError::InvalidResponse("completion had no content".to_string()));
    }
    Ok(content)
}

#[async_trait]
impl AnalysisProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn analyze(&self, text: &str, config: &TaskConfig) -> Result<String, TaskError> {
        let mut request = self.client.post(self.endpoint()).json(&self.request_body(text, config));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TaskError::Transport(e.to_string()))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| TaskError::Transport(e.to_string()))?;

        if !status.is_success() {
            let body: String = raw.chars().take(500).collect();
            return Err(TaskError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let content = parse_completion(&raw)?;
        tracing::debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}
