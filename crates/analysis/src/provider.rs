use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-task configuration carried inside a job payload.
///
/// Which provider runs a task, with which prompt and parameters, is decided per
/// job so that different uploads can be routed differently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Registered provider name (see [`crate::ProviderRegistry`]).
    pub provider: String,

    /// System instructions handed to the provider.
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Upper bound on the number of characters of input sent to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_chars: Option<usize>,

    /// Per-task timeout; falls back to the executor default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskConfig {
    pub fn new(provider: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            prompt: prompt.into(),
            model: None,
            temperature: None,
            max_tokens: None,
            max_input_chars: None,
            timeout_secs: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = Some(max_input_chars);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Effective timeout for this task.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }

    /// Cut `text` down to `max_input_chars` characters (never splits a char).
    pub fn prepare_input<'a>(&self, text: &'a str) -> &'a str {
        match self.max_input_chars {
            Some(limit) => match text.char_indices().nth(limit) {
                Some((byte_idx, _)) => &text[..byte_idx],
                None => text,
            },
            None => text,
        }
    }
}

/// Failure of a single analysis task.
///
/// Task errors are recorded in the task's slot and never fail the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("no analysis provider registered as '{0}'")]
    UnknownProvider(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("provider returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("analysis failed: {0}")]
    Failed(String),
}

/// An analysis backend (LLM endpoint, local model, rule engine, ...).
///
/// Implementations must be safe to call from several workers at once.
#[async_trait]
pub trait AnalysisProvider: Send + Sync + 'static {
    /// Name used for logging.
    fn name(&self) -> &str;

    /// Analyse `text` according to `config`.
    async fn analyze(&self, text: &str, config: &TaskConfig) -> Result<String, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_input_truncates_on_char_boundary() {
        let cfg = TaskConfig::new("p", "x").with_max_input_chars(3);
        assert_eq!(cfg.prepare_input("ação!"), "açã");
        assert_eq!(cfg.prepare_input("ab"), "ab");
    }

    #[test]
    fn prepare_input_without_limit_is_identity() {
        let cfg = TaskConfig::new("p", "x");
        assert_eq!(cfg.prepare_input("hello"), "hello");
    }

    #[test]
    fn timeout_falls_back_to_default() {
        let cfg = TaskConfig::new("p", "x");
        assert_eq!(cfg.timeout_or(Duration::from_secs(9)), Duration::from_secs(9));

        let cfg = cfg.with_timeout(Duration::from_secs(3));
        assert_eq!(cfg.timeout_or(Duration::from_secs(9)), Duration::from_secs(3));
    }

    #[test]
    fn optional_fields_are_omitted_from_json() {
        let cfg = TaskConfig::new("openai", "summarise");
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json, serde_json::json!({"provider": "openai", "prompt": "summarise"}));

        let back: TaskConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn timeout_error_mentions_seconds() {
        assert_eq!(
            TaskError::Timeout(Duration::from_secs(30)).to_string(),
            "timed out after 30s"
        );
    }
}
