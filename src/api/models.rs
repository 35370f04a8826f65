//! API request and response models.

use serde::Deserialize;
use serde::Serialize;
use utoipa::IntoParams;
use utoipa::ToSchema;

use crate::db::Job;
use crate::db::JobStatus;

/// Request to submit a new job (spec §6 `submit`).
///
/// Archive upload handling is out of scope (spec §1); the workspace backing
/// this job is assumed already materialized at the server-known job
/// directory by the time it reaches `running`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitJobRequest {
    /// Display name for the job.
    pub name: String,
    /// Requested resource, e.g. `gpu:0` or `cpu`.
    pub resource: String,
    /// Container image used to run the training script.
    pub runtime_image: String,
}

/// Response for job submission, job lookup, and job cancellation: the
/// current job record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    /// The job record.
    #[serde(flatten)]
    pub job: Job,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self { job }
    }
}

/// Query parameters for listing jobs.
#[derive(Debug, Clone, Serialize, Deserialize, IntoParams, ToSchema)]
pub struct ListJobsQuery {
    /// Filter by status.
    #[serde(default)]
    pub status: Option<JobStatus>,
}

/// Response for the job list query.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListJobsResponse {
    /// The matching jobs, most recent first.
    pub jobs: Vec<Job>,
}
