//! Job API handlers: a thin shim over [`Scheduler::submit`],
//! [`Scheduler::get`], [`Scheduler::list`], and [`Scheduler::cancel`] (spec
//! §6, §10.5).

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use uuid::Uuid;

use super::AppState;
use super::error::Error;
use super::models::JobResponse;
use super::models::ListJobsQuery;
use super::models::ListJobsResponse;
use super::models::SubmitJobRequest;

/// Submit a new training job.
///
/// # Errors
///
/// Returns an error if `name`, `resource`, or `runtime_image` is empty, or
/// if the store cannot be reached.
#[utoipa::path(
    post,
    path = "/jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 200, description = "Job submitted successfully", body = JobResponse),
        (status = 400, description = "Invalid request"),
    )
)]
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<Json<JobResponse>, Error> {
    let job = state
        .scheduler
        .submit(&request.name, &request.resource, &request.runtime_image)
        .await?;

    Ok(Json(job.into()))
}

/// Fetch a job's current state by id.
///
/// # Errors
///
/// Returns an error if no job exists with the given id.
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job found", body = JobResponse),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, Error> {
    let job = state.scheduler.get(id).await?.ok_or(Error::JobNotFound)?;

    Ok(Json(job.into()))
}

/// List jobs, optionally filtered by status.
///
/// # Errors
///
/// Returns an error if the store cannot be reached.
#[utoipa::path(
    get,
    path = "/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs retrieved", body = ListJobsResponse),
    )
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, Error> {
    let jobs = state.scheduler.list(query.status).await?;

    Ok(Json(ListJobsResponse { jobs }))
}

/// Cancel a job, whether pending or running.
///
/// # Errors
///
/// Returns an error if no job exists with the given id.
#[utoipa::path(
    post,
    path = "/jobs/{id}/cancel",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job cancelled", body = JobResponse),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, Error> {
    if !state.scheduler.cancel(id).await? {
        return Err(Error::JobNotFound);
    }

    let job = state.scheduler.get(id).await?.ok_or(Error::JobNotFound)?;
    Ok(Json(job.into()))
}
