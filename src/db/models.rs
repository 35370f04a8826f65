//! Database models.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is queued and waiting for its resource to free up.
    Pending,
    /// Job has been dispatched and its container is running.
    Running,
    /// Job's container exited with code `0`.
    Completed,
    /// Job's container exited with a non-zero code, or an internal error
    /// occurred before a container could be launched.
    Failed,
    /// Job was cancelled, either while pending or while running.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal (never transitions further).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// A training job record.
///
/// Once `status` reaches a terminal value, every field except `container_id`
/// (cleared opportunistically during cleanup) is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Job {
    /// Unique identifier.
    #[sqlx(try_from = "String")]
    pub id: Uuid,
    /// Display name, as submitted.
    pub name: String,
    /// Requested resource, e.g. `gpu:0` or `cpu`.
    pub resource: String,
    /// Container image used to run the training script.
    pub runtime_image: String,
    /// Current lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    /// Error message, set when `status` is `failed`.
    pub error: Option<String>,
    /// Container id, set while `running` and while the container still
    /// exists; cleared once the container is removed.
    pub container_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the Scheduler Loop dispatched this job.
    pub started_at: Option<DateTime<Utc>>,
    /// Time this job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Columns selected for a [`Job`] row. Kept in one place so every query
/// reading a full job record stays in sync with [`Job`]'s field order.
pub(super) const JOB_COLUMNS: &str = "id, name, resource, runtime_image, status, error, \
     container_id, created_at, started_at, completed_at";
