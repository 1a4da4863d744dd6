use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docrelay_infra::jobs::JobStoreError;

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::Capacity { limit } => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "capacity_exceeded",
            format!("queue is full ({limit} jobs); retry later"),
        ),
        JobStoreError::Closed => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "capacity_exceeded",
            "relay is shutting down",
        ),
        JobStoreError::InvalidPayload(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_payload", msg)
        }
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        e @ JobStoreError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "conflict", e.to_string())
        }
        JobStoreError::Persistence(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
