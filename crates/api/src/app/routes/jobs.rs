use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use docrelay_core::JobId;
use docrelay_infra::jobs::JobStore;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Validate and enqueue a job, waiting up to the configured bound for capacity.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::SubmitJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_payload",
                rejection.body_text(),
            );
        }
    };

    let payload = match body.into_payload(services.default_prompts()) {
        Ok(payload) => payload,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", msg),
    };

    match services.intake().submit(payload).await {
        Ok(id) => {
            tracing::info!(job_id = %id, "job accepted");
            (
                StatusCode::ACCEPTED,
                Json(dto::SubmitJobResponse { id: id.to_string() }),
            )
                .into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("{e}")),
    };

    match services.store().get(id).await {
        Ok(Some(job)) => Json(dto::JobView::from(job)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job {id} not found (delivered jobs are removed)"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::DeadLetterQuery>,
) -> axum::response::Response {
    match services.store().list_dead_letters(query.limit()).await {
        Ok(entries) => {
            let items: Vec<dto::DeadLetterView> = entries.into_iter().map(Into::into).collect();
            Json(items).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
