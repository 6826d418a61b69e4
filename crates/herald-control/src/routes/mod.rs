use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::security;
use crate::state::AppState;

pub mod health;
pub mod jobs;

pub fn router(state: AppState) -> Router {
    // Job routes need a user session; state-changing ones also pass the
    // Origin and CSRF checks.
    let jobs_router = Router::new()
        .route("/jobs", get(jobs::list).post(jobs::start))
        .route("/jobs/stop", post(jobs::stop))
        .route("/jobs/:job_id", get(jobs::show))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::require_user,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::csrf_and_origin,
        ));

    Router::new()
        .route("/healthz", get(health::healthz))
        .merge(jobs_router)
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
