//! The shared store: Job Store, Resource Registry, Pending Queue, and the
//! per-job container mapping, unified behind one [`Store`] trait.
//!
//! All four live in the same embedded SQLite database so that the
//! compare-and-set behavior the Resource Registry needs (`acquire`) and the
//! race-free pop the Pending Queue needs (`pop_head`) can be expressed as
//! single SQL statements instead of application-level locking, which is what
//! makes it safe for multiple worker processes to share one database file.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod models;
pub mod sqlite;

pub use models::Job;
pub use models::JobStatus;
pub use sqlite::SqliteStore;

/// Errors raised by a [`Store`] implementation.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A database error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// The shared key-value store backing the Job Store, Resource Registry,
/// Pending Queue, and container mapping (spec §2, §4.1-§4.3, §6).
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    // -- Job Store (§4.2) --------------------------------------------------

    /// Insert a new job with status `pending`.
    async fn create_job(&self, name: &str, resource: &str, runtime_image: &str) -> Result<Job>;

    /// Fetch a job by id.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// List jobs, optionally filtered by status, most recent first.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;

    /// Unconditionally transition a job to `running`, recording
    /// `started_at`. Used by the supervisor reconciliation rule, where the
    /// job is already known to be `running` and is simply being re-adopted.
    ///
    /// Returns `false` if the job does not exist.
    async fn mark_running(&self, id: Uuid) -> Result<bool>;

    /// Transition a job from `pending` to `running`, recording
    /// `started_at`. This is conditional on the current status still being
    /// `pending` so that a cancellation racing with dispatch is never
    /// silently overwritten.
    ///
    /// Returns `false` if the job was not in `pending` status (it was
    /// already cancelled, or does not exist).
    async fn start_job(&self, id: Uuid) -> Result<bool>;

    /// Record the container id for a running job, and mirror it into the
    /// separate `container:<id>` mapping (see [`Store::get_container`]).
    async fn set_container(&self, id: Uuid, container_id: &str) -> Result<()>;

    /// Clear the container id for a job, removing the mirrored mapping.
    async fn clear_container(&self, id: Uuid) -> Result<()>;

    /// Look up the container id mapping for a job, independent of the job
    /// record itself (spec §6, `container:<id>` key).
    async fn get_container(&self, id: Uuid) -> Result<Option<String>>;

    /// Reconcile a job to `completed`, *unless* it has already been
    /// cancelled. This is the "cancelled is sticky" rule (spec §5) realized
    /// as a single conditional `UPDATE`, which is strictly stronger than the
    /// read-modify-write pattern described in the baseline design (spec §9
    /// recommends a compare-and-set on the status field as a preferable
    /// enhancement; this is that enhancement).
    ///
    /// Returns `false` if the job had already been cancelled (the caller
    /// should treat this as "left alone", not as an error).
    async fn reconcile_completed(&self, id: Uuid) -> Result<bool>;

    /// As [`Store::reconcile_completed`], but to `failed` with `error` set.
    async fn reconcile_failed(&self, id: Uuid, error: &str) -> Result<bool>;

    /// Cancel a job: sets `status = cancelled` and `completed_at = now`,
    /// removes it from the Pending Queue, and clears its container mapping.
    /// This is conditional on the current status still being `pending` or
    /// `running`, so a job that already reached a terminal status
    /// (`completed`, `failed`, or a prior `cancelled`) is left alone rather
    /// than reverted (spec.md:28, spec.md:39).
    ///
    /// Returns `None` if the job does not exist, was already terminal, or
    /// had no container mapped. Otherwise returns the container id that was
    /// mapped, so the caller can ask the Container Driver to stop it.
    async fn cancel_job(&self, id: Uuid) -> Result<Option<String>>;

    // -- Pending Queue (§4.3) -----------------------------------------------

    /// Append a job id to the tail of the queue.
    async fn push_tail(&self, id: Uuid) -> Result<()>;

    /// Pop the job id at the head of the queue, if any. Implemented as a
    /// single atomic statement so concurrent worker processes never observe
    /// the same head entry twice.
    async fn pop_head(&self) -> Result<Option<Uuid>>;

    /// Remove every occurrence of a job id from the queue.
    async fn remove_from_queue(&self, id: Uuid) -> Result<()>;

    // -- Resource Registry (§4.1) -------------------------------------------

    /// Whether `resource` currently has no lease holder.
    async fn is_available(&self, resource: &str) -> Result<bool>;

    /// Atomically grant the lease for `resource` to `job_id`, if free.
    /// Returns whether the lease was granted.
    async fn acquire(&self, resource: &str, job_id: Uuid) -> Result<bool>;

    /// Release the lease on `resource`, if held. A no-op otherwise.
    async fn release(&self, resource: &str) -> Result<()>;

    /// List the ids of jobs currently marked `running`, used by the
    /// supervisor reconciliation rule on worker startup (spec §5).
    async fn list_running(&self) -> Result<Vec<Job>>;
}
