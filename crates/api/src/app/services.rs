//! Relay wiring: store, analysis providers, delivery sink and pipeline.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use docrelay_analysis::{FsContentSource, OpenAiCompatProvider, ProviderRegistry};
use docrelay_infra::RelayConfig;
use docrelay_infra::jobs::{
    DeliverySink, Intake, JobStore, LogSink, OutboundMessage, Pipeline, PipelineHandle,
    SinkDeliveryError, SqliteJobStore, TaskExecutor, WebhookSink,
};

use crate::settings::{ApiSettings, DefaultPrompts};

/// Shared state behind every handler.
pub struct AppServices {
    intake: Intake<dyn JobStore>,
    default_prompts: DefaultPrompts,
}

impl AppServices {
    pub fn new(intake: Intake<dyn JobStore>) -> Self {
        Self {
            intake,
            default_prompts: DefaultPrompts::default(),
        }
    }

    pub fn with_default_prompts(mut self, prompts: DefaultPrompts) -> Self {
        self.default_prompts = prompts;
        self
    }

    pub fn default_prompts(&self) -> &DefaultPrompts {
        &self.default_prompts
    }

    pub fn intake(&self) -> &Intake<dyn JobStore> {
        &self.intake
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.intake.store()
    }
}

/// Sink chosen at startup: a webhook when configured, the log otherwise.
pub enum ConfiguredSink {
    Webhook(WebhookSink),
    Log(LogSink),
}

#[async_trait]
impl DeliverySink for ConfiguredSink {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), SinkDeliveryError> {
        match self {
            ConfiguredSink::Webhook(sink) => sink.send(message).await,
            ConfiguredSink::Log(sink) => sink.send(message).await,
        }
    }
}

pub fn build_sink(settings: &ApiSettings) -> anyhow::Result<ConfiguredSink> {
    match &settings.sink_url {
        Some(url) => {
            let sink = WebhookSink::new(url.clone()).context("failed to build webhook sink")?;
            tracing::info!(url = sink.url(), "delivering results to webhook");
            Ok(ConfiguredSink::Webhook(sink))
        }
        None => {
            tracing::warn!("DOCRELAY_SINK_URL not set; results will only be logged");
            Ok(ConfiguredSink::Log(LogSink))
        }
    }
}

fn openai_compat(settings: &ApiSettings, url: &str) -> anyhow::Result<OpenAiCompatProvider> {
    let mut provider = OpenAiCompatProvider::new(url.to_string())
        .with_context(|| format!("failed to build analysis provider for {url}"))?;
    if let Some(key) = &settings.provider_api_key {
        provider = provider.with_api_key(key.clone());
    }
    if let Some(model) = &settings.provider_model {
        provider = provider.with_default_model(model.clone());
    }
    Ok(provider)
}

/// The main endpoint answers for `openai` and every unregistered name;
/// `DOCRELAY_PROVIDERS` entries answer for their own names only.
pub fn build_registry(settings: &ApiSettings) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for (name, url) in &settings.extra_providers {
        tracing::info!(provider = %name, url = %url, "registering analysis provider");
        registry.register(name.clone(), Arc::new(openai_compat(settings, url)?));
    }

    let Some(url) = &settings.provider_url else {
        if settings.extra_providers.is_empty() {
            tracing::warn!("DOCRELAY_PROVIDER_URL not set; every analysis task will fail");
        }
        return Ok(registry);
    };
    let provider = Arc::new(openai_compat(settings, url)?);
    registry.register("openai", provider.clone());
    registry.register("*", provider);
    Ok(registry)
}

/// Open the store, recover orphans and start workers, dispatcher and sweeper.
pub async fn start_relay(
    relay: &RelayConfig,
    settings: &ApiSettings,
) -> anyhow::Result<PipelineHandle<dyn JobStore>> {
    let store = SqliteJobStore::connect(
        &relay.database_url,
        relay.max_outstanding,
        relay.retry_policy(),
    )
    .await
    .with_context(|| format!("failed to open job store at {}", relay.database_url))?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let source = FsContentSource::new(settings.document_root.clone());
    tracing::info!(root = %source.root().display(), "reading documents");
    let source = Arc::new(source);
    let executor = TaskExecutor::new(source, build_registry(settings)?);
    let sink = build_sink(settings)?;

    Pipeline::new(store, executor, sink, relay.clone())
        .start()
        .await
        .context("failed to start relay pipeline")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(provider_url: Option<&str>, extra: &[(&str, &str)]) -> ApiSettings {
        let mut settings = ApiSettings::from_lookup(|_| None).unwrap();
        settings.provider_url = provider_url.map(str::to_string);
        settings.extra_providers = extra
            .iter()
            .map(|(name, url)| (name.to_string(), url.to_string()))
            .collect();
        settings
    }

    #[test]
    fn sink_follows_the_configured_url() {
        let mut with_url = settings(None, &[]);
        with_url.sink_url = Some("http://127.0.0.1:9/hook".into());
        match build_sink(&with_url).unwrap() {
            ConfiguredSink::Webhook(sink) => assert_eq!(sink.url(), "http://127.0.0.1:9/hook"),
            ConfiguredSink::Log(_) => panic!("expected the webhook sink"),
        }
        assert!(matches!(build_sink(&settings(None, &[])).unwrap(), ConfiguredSink::Log(_)));
    }

    #[test]
    fn extra_endpoints_answer_only_for_their_names() {
        let registry = build_registry(&settings(None, &[("local", "http://127.0.0.1:1/v1")]))
            .unwrap();
        assert!(registry.resolve("local").is_ok());
        assert!(registry.resolve("openai").is_err());

        let registry = build_registry(&settings(
            Some("http://127.0.0.1:2/v1"),
            &[("local", "http://127.0.0.1:1/v1")],
        ))
        .unwrap();
        assert!(registry.resolve("local").is_ok());
        assert!(registry.resolve("openai").is_ok());
        assert!(registry.resolve("anything-else").is_ok());
    }
}
