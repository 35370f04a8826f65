//! SQLite-backed [`Store`] implementation.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqliteSynchronous;
use uuid::Uuid;

use super::DatabaseError;
use super::Result;
use super::Store;
use super::models::JOB_COLUMNS;
use super::models::Job;
use super::models::JobStatus;

/// Default page size for `list_jobs`.
const DEFAULT_PAGE_SIZE: i64 = 100;

/// SQLite connection string prefix.
const SQLITE_CONNECTION_PREFIX: &str = "sqlite:";

/// Store temporary tables and indices in memory for faster operations.
const SQLITE_TEMP_STORE: &str = "memory";

/// Set memory-mapped I/O size to 4GiB for improved read performance.
const SQLITE_MMAP_SIZE: &str = "4294967296";

/// Set page size to 32KB to reduce I/O operations for sequential scans.
const SQLITE_PAGE_SIZE: &str = "32768";

/// Enable foreign key constraint enforcement for referential integrity.
const SQLITE_FOREIGN_KEYS: &str = "on";

/// Configure 5-second timeout when database is locked to prevent spurious
/// failures, since multiple worker processes share one file.
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// Allocate page cache for improved query performance.
const SQLITE_CACHE_SIZE: &str = "2000";

/// SQLite-backed store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    /// The underlying connection pool.
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to (creating if missing) the SQLite database at `path`,
    /// applying the performance pragmas and running embedded migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let database_url = if path == Path::new(":memory:") {
            format!("{SQLITE_CONNECTION_PREFIX}memory:")
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            format!("{SQLITE_CONNECTION_PREFIX}//{}", path.display())
        };

        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", SQLITE_TEMP_STORE)
            .pragma("mmap_size", SQLITE_MMAP_SIZE)
            .pragma("page_size", SQLITE_PAGE_SIZE)
            .pragma("foreign_keys", SQLITE_FOREIGN_KEYS)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT)
            .pragma("cache_size", SQLITE_CACHE_SIZE);

        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Build a store from an existing pool, running embedded migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Build the `select <columns> from jobs where ...` prefix shared by
    /// every full-record job query.
    fn select_job(clause: &str) -> String {
        format!("select {JOB_COLUMNS} from jobs {clause}")
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_job(&self, name: &str, resource: &str, runtime_image: &str) -> Result<Job> {
        if name.is_empty() {
            return Err(DatabaseError::Validation(String::from(
                "`name` cannot be empty for a job",
            )));
        }
        if resource.is_empty() {
            return Err(DatabaseError::Validation(String::from(
                "`resource` cannot be empty for a job",
            )));
        }
        if runtime_image.is_empty() {
            return Err(DatabaseError::Validation(String::from(
                "`runtime_image` cannot be empty for a job",
            )));
        }

        let id = Uuid::new_v4();

        sqlx::query(
            "insert into jobs (id, name, resource, runtime_image, status) values (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(resource)
        .bind(runtime_image)
        .bind(JobStatus::Pending)
        .execute(&self.pool)
        .await?;

        let job: Job = sqlx::query_as(&Self::select_job("where id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let job: Option<Job> = sqlx::query_as(&Self::select_job("where id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = if let Some(status) = status {
            sqlx::query_as(&Self::select_job(
                "where status = ? order by created_at desc limit ?",
            ))
            .bind(status)
            .bind(DEFAULT_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(&Self::select_job("order by created_at desc limit ?"))
                .bind(DEFAULT_PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
        };

        Ok(jobs)
    }

    async fn mark_running(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "update jobs set status = ?, started_at = current_timestamp where id = ?",
        )
        .bind(JobStatus::Running)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn start_job(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "update jobs set status = ?, started_at = current_timestamp where id = ? and status \
             = ?",
        )
        .bind(JobStatus::Running)
        .bind(id)
        .bind(JobStatus::Pending)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_container(&self, id: Uuid, container_id: &str) -> Result<()> {
        sqlx::query("update jobs set container_id = ? where id = ?")
            .bind(container_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        sqlx::query("insert or replace into containers (job_id, container_id) values (?, ?)")
            .bind(id)
            .bind(container_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn clear_container(&self, id: Uuid) -> Result<()> {
        sqlx::query("update jobs set container_id = null where id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        sqlx::query("delete from containers where job_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_container(&self, id: Uuid) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("select container_id from containers where job_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(container_id,)| container_id))
    }

    async fn reconcile_completed(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "update jobs set status = ?, completed_at = current_timestamp where id = ? and \
             status != ?",
        )
        .bind(JobStatus::Completed)
        .bind(id)
        .bind(JobStatus::Cancelled)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reconcile_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "update jobs set status = ?, error = ?, completed_at = current_timestamp where id = \
             ? and status != ?",
        )
        .bind(JobStatus::Failed)
        .bind(error)
        .bind(id)
        .bind(JobStatus::Cancelled)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_job(&self, id: Uuid) -> Result<Option<String>> {
        let result = sqlx::query(
            "update jobs set status = ?, completed_at = current_timestamp where id = ? and \
             status in (?, ?)",
        )
        .bind(JobStatus::Cancelled)
        .bind(id)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let container_id = self.get_container(id).await?;
        self.remove_from_queue(id).await?;
        self.clear_container(id).await?;

        Ok(container_id)
    }

    async fn push_tail(&self, id: Uuid) -> Result<()> {
        sqlx::query("insert into queue_entries (job_id) values (?)")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn pop_head(&self) -> Result<Option<Uuid>> {
        let row: Option<(String,)> = sqlx::query_as(
            "delete from queue_entries where seq = (select min(seq) from queue_entries) \
             returning job_id",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((id,)) => Some(Uuid::parse_str(&id).map_err(|e| {
                DatabaseError::Validation(format!("invalid job id in queue: {e}"))
            })?),
            None => None,
        })
    }

    async fn remove_from_queue(&self, id: Uuid) -> Result<()> {
        sqlx::query("delete from queue_entries where job_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn is_available(&self, resource: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("select job_id from resource_leases where resource = ?")
                .bind(resource)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_none())
    }

    async fn acquire(&self, resource: &str, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "insert into resource_leases (resource, job_id) values (?, ?) on conflict(resource) \
             do nothing",
        )
        .bind(resource)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, resource: &str) -> Result<()> {
        sqlx::query("delete from resource_leases where resource = ?")
            .bind(resource)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = sqlx::query_as(&Self::select_job("where status = ?"))
            .bind(JobStatus::Running)
            .fetch_all(&self.pool)
            .await?;

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::new(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let store = store().await;
        let job = store
            .create_job("my-job", "gpu:0", "pytorch/pytorch:latest")
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.name, "my-job");
    }

    #[tokio::test]
    async fn create_job_rejects_empty_fields() {
        let store = store().await;
        let err = store.create_job("", "gpu:0", "image").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Validation(_)));
    }

    #[tokio::test]
    async fn queue_is_fifo_with_tail_requeue() {
        let store = store().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        store.push_tail(a).await.unwrap();
        store.push_tail(b).await.unwrap();
        store.push_tail(c).await.unwrap();

        assert_eq!(store.pop_head().await.unwrap(), Some(a));

        // Simulate a requeue-on-busy: b goes back to the tail.
        store.push_tail(b).await.unwrap();

        assert_eq!(store.pop_head().await.unwrap(), Some(c));
        assert_eq!(store.pop_head().await.unwrap(), Some(b));
        assert_eq!(store.pop_head().await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_from_queue_drops_all_occurrences() {
        let store = store().await;
        let id = Uuid::new_v4();
        store.push_tail(id).await.unwrap();
        store.push_tail(id).await.unwrap();
        store.remove_from_queue(id).await.unwrap();
        assert_eq!(store.pop_head().await.unwrap(), None);
    }

    #[tokio::test]
    async fn acquire_is_exclusive_and_release_is_idempotent() {
        let store = store().await;
        let j1 = Uuid::new_v4();
        let j2 = Uuid::new_v4();

        assert!(store.is_available("gpu:0").await.unwrap());
        assert!(store.acquire("gpu:0", j1).await.unwrap());
        assert!(!store.is_available("gpu:0").await.unwrap());
        assert!(!store.acquire("gpu:0", j2).await.unwrap());

        store.release("gpu:0").await.unwrap();
        // Releasing an already-free resource is a no-op, not an error.
        store.release("gpu:0").await.unwrap();
        assert!(store.is_available("gpu:0").await.unwrap());
        assert!(store.acquire("gpu:0", j2).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_is_sticky_against_reconcile() {
        let store = store().await;
        let job = store.create_job("j", "gpu:0", "image").await.unwrap();

        assert!(store.start_job(job.id).await.unwrap());
        let container = store.cancel_job(job.id).await.unwrap();
        assert!(container.is_none());

        // The Runner's reconcile step must not be able to overwrite this.
        let changed = store.reconcile_completed(job.id).await.unwrap();
        assert!(!changed);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_refuses_already_completed_job() {
        let store = store().await;
        let job = store.create_job("j", "gpu:0", "image").await.unwrap();

        assert!(store.start_job(job.id).await.unwrap());
        assert!(store.reconcile_completed(job.id).await.unwrap());

        // A job that already finished must never revert to cancelled
        // (spec.md:28, spec.md:39).
        let container = store.cancel_job(job.id).await.unwrap();
        assert!(container.is_none());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn start_job_refuses_non_pending() {
        let store = store().await;
        let job = store.create_job("j", "gpu:0", "image").await.unwrap();
        assert!(store.start_job(job.id).await.unwrap());
        // Already running: a second dispatch attempt must not succeed.
        assert!(!store.start_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn container_mapping_tracks_job_container_id() {
        let store = store().await;
        let job = store.create_job("j", "gpu:0", "image").await.unwrap();

        store.set_container(job.id, "abc123").await.unwrap();
        assert_eq!(
            store.get_container(job.id).await.unwrap(),
            Some(String::from("abc123"))
        );

        store.clear_container(job.id).await.unwrap();
        assert_eq!(store.get_container(job.id).await.unwrap(), None);
    }
}
