//! Binary-level settings: where to listen and which collaborators to wire.

use std::net::SocketAddr;
use std::path::PathBuf;

use docrelay_core::TaskLabel;
use docrelay_infra::ConfigError;

const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Settings only the `docrelay` binary needs; the relay itself is configured
/// through [`docrelay_infra::RelayConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub bind: SocketAddr,
    /// Webhook receiving outbound messages; results are only logged when unset.
    pub sink_url: Option<String>,
    pub document_root: PathBuf,
    /// OpenAI-compatible endpoint; without it every task fails with an unknown provider.
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
    pub provider_model: Option<String>,
    /// Additional named endpoints, registered under their own provider names.
    pub extra_providers: Vec<(String, String)>,
    pub default_prompts: DefaultPrompts,
}

/// Prompts filled into submitted tasks that leave `prompt` out, by task position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultPrompts {
    pub primary: Option<String>,
    pub secondary: Option<String>,
}

impl DefaultPrompts {
    pub fn for_label(&self, label: TaskLabel) -> Option<&str> {
        match label {
            TaskLabel::Primary => self.primary.as_deref(),
            TaskLabel::Secondary => self.secondary.as_deref(),
        }
    }
}

impl ApiSettings {
    /// | Env Var                     | Default        |
    /// |-----------------------------|----------------|
    /// | `DOCRELAY_BIND`             | `0.0.0.0:8080` |
    /// | `DOCRELAY_SINK_URL`         | unset          |
    /// | `DOCRELAY_DOCUMENT_ROOT`    | `.`            |
    /// | `DOCRELAY_PROVIDER_URL`     | unset          |
    /// | `DOCRELAY_PROVIDER_API_KEY` | unset          |
    /// | `DOCRELAY_PROVIDER_MODEL`   | provider default |
    /// | `DOCRELAY_PROVIDERS`        | none (`name=url,...`) |
    /// | `DOCRELAY_PRIMARY_PROMPT`   | unset (or `..._PROMPT_FILE`) |
    /// | `DOCRELAY_SECONDARY_PROMPT` | unset (or `..._PROMPT_FILE`) |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind = match get("DOCRELAY_BIND") {
            None => DEFAULT_BIND.parse().map_err(|_| ConfigError::Invalid {
                key: "DOCRELAY_BIND",
                value: DEFAULT_BIND.to_string(),
                expected: "a socket address",
            })?,
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "DOCRELAY_BIND",
                value: raw,
                expected: "a socket address such as 0.0.0.0:8080",
            })?,
        };

        let prompt = |text_key: &'static str, file_key: &'static str| {
            if let Some(text) = get(text_key) {
                return Ok(Some(text));
            }
            let Some(path) = get(file_key) else {
                return Ok(None);
            };
            match std::fs::read_to_string(&path) {
                Ok(text) if !text.trim().is_empty() => Ok(Some(text.trim().to_string())),
                _ => Err(ConfigError::Invalid {
                    key: file_key,
                    value: path,
                    expected: "a readable, non-empty prompt file",
                }),
            }
        };
        let default_prompts = DefaultPrompts {
            primary: prompt("DOCRELAY_PRIMARY_PROMPT", "DOCRELAY_PRIMARY_PROMPT_FILE")?,
            secondary: prompt("DOCRELAY_SECONDARY_PROMPT", "DOCRELAY_SECONDARY_PROMPT_FILE")?,
        };

        let extra_providers = match get("DOCRELAY_PROVIDERS") {
            None => Vec::new(),
            Some(raw) => parse_providers(&raw).ok_or(ConfigError::Invalid {
                key: "DOCRELAY_PROVIDERS",
                value: raw,
                expected: "comma-separated name=url pairs",
            })?,
        };

        Ok(Self {
            bind,
            sink_url: get("DOCRELAY_SINK_URL"),
            document_root: get("DOCRELAY_DOCUMENT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            provider_url: get("DOCRELAY_PROVIDER_URL"),
            provider_api_key: get("DOCRELAY_PROVIDER_API_KEY"),
            provider_model: get("DOCRELAY_PROVIDER_MODEL"),
            extra_providers,
            default_prompts,
        })
    }
}

fn parse_providers(raw: &str) -> Option<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, url) = entry.split_once('=')?;
            let (name, url) = (name.trim(), url.trim());
            (!name.is_empty() && !url.is_empty()).then(|| (name.to_string(), url.to_string()))
        })
        .collect()
}
