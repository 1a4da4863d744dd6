use std::sync::Arc;

use anyhow::Context;

use docrelay_api::app::{self, AppServices};
use docrelay_api::settings::ApiSettings;
use docrelay_infra::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to load .env");
        }
    }
    docrelay_observability::init();

    let relay = RelayConfig::from_env().context("invalid relay configuration")?;
    let settings = ApiSettings::from_env().context("invalid server settings")?;

    let pipeline = app::services::start_relay(&relay, &settings).await?;
    let services = Arc::new(
        AppServices::new(pipeline.intake()).with_default_prompts(settings.default_prompts.clone()),
    );
    let router = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind))?;
    tracing::info!(addr = %settings.bind, "listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed");

    // Stop intake, drain workers and flush the dispatcher.
    let report = pipeline.shutdown().await;
    tracing::info!(
        graceful = report.workers.graceful,
        delivered = report.dispatcher.jobs_delivered,
        "shutdown complete"
    );
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
