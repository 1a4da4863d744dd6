use axum::{
    Router,
    routing::{get, post},
};

pub mod jobs;
pub mod system;

/// Router for the intake and inspection endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/dead-letters", get(jobs::list_dead_letters))
        .route("/stats", get(system::stats))
}
