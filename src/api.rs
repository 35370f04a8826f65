//! The HTTP surface: a thin `axum` shim over the scheduler's `submit`/
//! `get`/`list`/`cancel` calls (spec §10.5), independent of the
//! upload/auth system named out of scope in spec §1.

use axum::Router;
use axum::routing::get;
use axum::routing::post;
use bon::Builder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::scheduler::Scheduler;

pub mod error;
pub mod handlers;
pub mod models;

use handlers::cancel_job;
use handlers::get_job;
use handlers::list_jobs;
use handlers::submit_job;

/// Application state shared across every handler: just the scheduler
/// handle, which is itself cheaply cloneable (spec §10.5's rationale for
/// not needing a command channel here).
#[derive(Builder, Clone, Debug)]
pub struct AppState {
    /// The scheduler handle.
    scheduler: Scheduler,
}

/// OpenAPI documentation for the job queue surface.
#[derive(OpenApi)]
#[openapi(
    paths(submit_job, get_job, list_jobs, cancel_job),
    components(schemas(
        models::SubmitJobRequest,
        models::JobResponse,
        models::ListJobsQuery,
        models::ListJobsResponse,
        crate::db::Job,
        crate::db::JobStatus,
    )),
    tags(
        (name = "jobs", description = "Training job queue endpoints")
    )
)]
struct ApiDoc;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/v1/jobs", post(submit_job).get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/cancel", post(cancel_job))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
