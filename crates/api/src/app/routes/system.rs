use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};

use docrelay_infra::jobs::JobStore;

use crate::app::{errors, services::AppServices};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "accepting_jobs": !services.intake().is_closed(),
    }))
}

/// Counts per status plus the dead-letter archive.
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store().stats().await {
        Ok(stats) => Json(serde_json::json!({
            "capacity": services.store().capacity(),
            "stored": stats.stored(),
            "pending": stats.pending,
            "processing": stats.processing,
            "completed": stats.completed,
            "failed": stats.failed,
            "dead_lettered": stats.dead_lettered,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
