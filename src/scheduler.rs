//! The Scheduler Loop and the `submit`/`cancel` entry points consumed by the
//! API layer (spec §4.6, §6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::container::ContainerDriver;
use crate::db::DatabaseError;
use crate::db::Job;
use crate::db::JobStatus;
use crate::db::Store;
use crate::runner;
use crate::workspace::DataDirs;

/// How long the loop sleeps when the Pending Queue is empty (spec §4.6 step
/// 1).
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_secs(5);

/// How long the loop sleeps after requeuing a job whose resource is busy
/// (spec §4.6 step 3).
const BUSY_RESOURCE_SLEEP: Duration = Duration::from_secs(2);

/// Reason recorded when the supervisor reconciliation rule (spec §5) finds a
/// `running` job whose container is gone after a worker restart.
const WORKER_RESTARTED_ERROR: &str = "worker restarted mid-run";

/// Errors raised by the scheduler's `submit`/`cancel` entry points.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The shared store could not be reached.
    #[error("store error: {0}")]
    Store(#[from] DatabaseError),

    /// The container engine rejected a request.
    #[error("container driver error: {0}")]
    Driver(#[from] crate::container::DriverError),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// A cloneable handle onto the scheduler's shared dependencies: the store,
/// the container driver, the job workspace layout, and the in-process
/// registry of per-job cancellation tokens that `cancel` consults to
/// interrupt an in-flight Runner promptly (spec §5, structured cancellation).
///
/// This mirrors the donor's `RunManagerSvc`/`runs: Arc<Mutex<HashMap<Uuid,
/// CancellationContext>>>` pattern, but without the actor/channel
/// indirection: `submit`/`cancel` here are simple enough to be direct async
/// methods on a cloned handle rather than commands routed through a single
/// owning task.
#[derive(Clone, Debug)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    driver: Arc<dyn ContainerDriver>,
    dirs: DataDirs,
    host_data_dir: Option<PathBuf>,
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl Scheduler {
    /// Build a new scheduler handle over `store` and `driver`, rooted at
    /// `dirs`. `host_data_dir` is set when the worker itself runs inside a
    /// container (spec §4.4, §6 `HOST_DATA_DIR`).
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn ContainerDriver>,
        dirs: DataDirs,
        host_data_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            driver,
            dirs,
            host_data_dir,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The job workspace layout this scheduler is rooted at.
    pub fn dirs(&self) -> &DataDirs {
        &self.dirs
    }

    /// The shared store this scheduler is backed by.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// `submit(job_record)` (spec §6): create the job record with status
    /// `pending` and append it to the Pending Queue's tail.
    pub async fn submit(&self, name: &str, resource: &str, runtime_image: &str) -> Result<Job> {
        let job = self.store.create_job(name, resource, runtime_image).await?;
        self.store.push_tail(job.id).await?;
        info!(job_id = %job.id, %resource, "job submitted");
        Ok(job)
    }

    /// `cancel(job_id)` (spec §6, §5): set `status = cancelled`, remove from
    /// the Pending Queue, and stop+remove any known container, all performed
    /// by [`Store::cancel_job`] as a single mutation. If a Runner task for
    /// this job is registered in-process, its cancellation token is also
    /// fired so in-flight waits are interrupted promptly rather than relying
    /// solely on the container being killed.
    ///
    /// Returns `false` if the job does not exist, or has already reached a
    /// terminal status (`completed`, `failed`, or `cancelled`) — terminal
    /// statuses never revert (spec.md:39). Idempotent and safe in every
    /// state, per spec §5.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let Some(job) = self.store.get_job(id).await? else {
            return Ok(false);
        };

        if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            return Ok(false);
        }

        let container_id = self.store.cancel_job(id).await?;

        if let Some(token) = self.tokens.lock().await.get(&id) {
            token.cancel();
        }

        if let Some(container_id) = container_id {
            if let Err(e) = self
                .driver
                .stop(&container_id, crate::container::STOP_GRACE_SECONDS)
                .await
            {
                warn!(job_id = %id, error = %e, "failed to stop container during cancellation");
            }
            let _ = self.driver.remove(&container_id).await;
        }

        info!(job_id = %id, "job cancelled");
        Ok(true)
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.store.get_job(id).await?)
    }

    /// List jobs, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs(status).await?)
    }

    /// The supervisor/reconciliation rule for crash tolerance (spec §5): on
    /// worker start, every job left `running` from a prior process either
    /// has a container still alive (left alone; a future enhancement could
    /// re-attach a log stream to it) or is gone, in which case it is marked
    /// `failed` and its lease and queue entry are cleared.
    pub async fn reconcile_on_startup(&self) -> Result<()> {
        for job in self.store.list_running().await? {
            let name = runner::container_name(job.id);
            let alive = self.driver.is_running(&name).await.unwrap_or(false);

            if alive {
                info!(job_id = %job.id, "re-attaching to container surviving worker restart");
                continue;
            }

            warn!(job_id = %job.id, "container missing after worker restart; marking failed");
            self.store
                .reconcile_failed(job.id, WORKER_RESTARTED_ERROR)
                .await?;
            self.store.release(&job.resource).await?;
            self.store.remove_from_queue(job.id).await?;
        }

        Ok(())
    }

    /// Run the Scheduler Loop forever (spec §4.6). Every iteration pops one
    /// id, checks resource availability, acquires the lease, and dispatches
    /// a Job Runner inline — this worker process's concurrency across
    /// resources comes from running it alongside other worker processes
    /// sharing the same store, not from fanning out within one loop.
    pub async fn run_loop(self) {
        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler loop iteration failed; retrying");
                tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
            }
        }
    }

    /// One iteration of the Scheduler Loop.
    async fn tick(&self) -> Result<()> {
        let Some(id) = self.store.pop_head().await? else {
            tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
            return Ok(());
        };

        let Some(job) = self.store.get_job(id).await? else {
            return Ok(());
        };

        if job.status != JobStatus::Pending {
            return Ok(());
        }

        if !self.store.is_available(&job.resource).await? {
            self.store.push_tail(id).await?;
            tokio::time::sleep(BUSY_RESOURCE_SLEEP).await;
            return Ok(());
        }

        if !self.store.acquire(&job.resource, id).await? {
            // Lost the compare-and-set race to another worker process.
            self.store.push_tail(id).await?;
            tokio::time::sleep(BUSY_RESOURCE_SLEEP).await;
            return Ok(());
        }

        let token = CancellationToken::new();
        self.tokens.lock().await.insert(id, token.clone());

        let store = self.store.clone();
        let driver = self.driver.clone();
        let dirs = self.dirs.clone();
        let host_data_dir = self.host_data_dir.clone();
        let tokens = self.tokens.clone();

        runner::run(store, driver, dirs, host_data_dir, job, token).await;
        tokens.lock().await.remove(&id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use futures::Stream;
    use tempfile::TempDir;

    use super::*;
    use crate::container::DriverError;
    use crate::container::Result as DriverResult;
    use crate::container::RunSpec;
    use crate::db::SqliteStore;

    /// A driver whose containers exit 0 immediately and never fail to stop
    /// or remove, sufficient for exercising scheduler control flow without a
    /// real engine.
    #[derive(Debug, Default)]
    struct ImmediateDriver;

    #[async_trait::async_trait]
    impl ContainerDriver for ImmediateDriver {
        async fn run(&self, spec: &RunSpec) -> DriverResult<String> {
            Ok(spec.name.clone())
        }

        fn logs_stream(
            &self,
            _container_id: &str,
        ) -> Pin<Box<dyn Stream<Item = DriverResult<Vec<u8>>> + Send>> {
            Box::pin(futures::stream::empty())
        }

        async fn wait(&self, _container_id: &str) -> DriverResult<i64> {
            Ok(0)
        }

        async fn is_running(&self, _container_id: &str) -> DriverResult<bool> {
            Ok(false)
        }

        async fn stop(&self, _container_id: &str, _grace_seconds: u32) -> DriverResult<()> {
            Ok(())
        }

        async fn remove(&self, _container_id: &str) -> DriverResult<()> {
            Ok(())
        }
    }

    /// A driver modeling "no such container" — used to exercise the
    /// supervisor reconciliation rule's missing-container branch.
    #[derive(Debug, Default)]
    struct NoContainerDriver;

    #[async_trait::async_trait]
    impl ContainerDriver for NoContainerDriver {
        async fn run(&self, spec: &RunSpec) -> DriverResult<String> {
            Ok(spec.name.clone())
        }

        fn logs_stream(
            &self,
            _container_id: &str,
        ) -> Pin<Box<dyn Stream<Item = DriverResult<Vec<u8>>> + Send>> {
            Box::pin(futures::stream::empty())
        }

        async fn wait(&self, _container_id: &str) -> DriverResult<i64> {
            Err(DriverError::WaitStreamEnded)
        }

        async fn is_running(&self, _container_id: &str) -> DriverResult<bool> {
            Ok(false)
        }

        async fn stop(&self, _container_id: &str, _grace_seconds: u32) -> DriverResult<()> {
            Ok(())
        }

        async fn remove(&self, _container_id: &str) -> DriverResult<()> {
            Ok(())
        }
    }

    /// A driver whose container is still running, modeling a container that
    /// survived a worker restart — used to exercise the reconciliation
    /// rule's "still alive" branch (spec §5).
    #[derive(Debug, Default)]
    struct SurvivingDriver;

    #[async_trait::async_trait]
    impl ContainerDriver for SurvivingDriver {
        async fn run(&self, spec: &RunSpec) -> DriverResult<String> {
            Ok(spec.name.clone())
        }

        fn logs_stream(
            &self,
            _container_id: &str,
        ) -> Pin<Box<dyn Stream<Item = DriverResult<Vec<u8>>> + Send>> {
            Box::pin(futures::stream::empty())
        }

        async fn wait(&self, _container_id: &str) -> DriverResult<i64> {
            Err(DriverError::WaitStreamEnded)
        }

        async fn is_running(&self, _container_id: &str) -> DriverResult<bool> {
            Ok(true)
        }

        async fn stop(&self, _container_id: &str, _grace_seconds: u32) -> DriverResult<()> {
            Ok(())
        }

        async fn remove(&self, _container_id: &str) -> DriverResult<()> {
            Ok(())
        }
    }

    fn archive(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("upload.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("train.py", options).unwrap();
        zip.start_file("requirements.txt", options).unwrap();
        zip.finish().unwrap();
        path
    }

    async fn scheduler_with(driver: Arc<dyn ContainerDriver>, temp: &TempDir) -> Scheduler {
        let dirs = DataDirs::under(temp.path());
        dirs.ensure().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(":memory:").await.unwrap());
        Scheduler::new(store, driver, dirs, None)
    }

    #[tokio::test]
    async fn submit_then_tick_dispatches_and_completes() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(ImmediateDriver), &temp).await;

        let job = scheduler
            .submit("j1", "gpu:0", "pytorch/pytorch:latest")
            .await
            .unwrap();
        std::fs::copy(archive(temp.path()), scheduler.dirs().upload_path(job.id)).unwrap();

        scheduler.tick().await.unwrap();

        let finished = scheduler.get(job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert!(scheduler.store().is_available("gpu:0").await.unwrap());
    }

    #[tokio::test]
    async fn tick_on_empty_queue_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(ImmediateDriver), &temp).await;
        scheduler.tick().await.unwrap();
    }

    #[tokio::test]
    async fn busy_resource_requeues_at_tail() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(ImmediateDriver), &temp).await;

        let holder = Uuid::new_v4();
        scheduler.store().acquire("gpu:0", holder).await.unwrap();

        let job = scheduler
            .submit("j2", "gpu:0", "pytorch/pytorch:latest")
            .await
            .unwrap();

        // `tick` pops the job, sees the resource is busy, and pushes it back
        // onto the tail rather than dropping it (spec §4.6 step 3).
        scheduler.tick().await.unwrap();

        assert_eq!(scheduler.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(scheduler.store().pop_head().await.unwrap(), Some(job.id));
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_false() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(ImmediateDriver), &temp).await;
        assert!(!scheduler.cancel(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_while_pending_removes_from_queue() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(ImmediateDriver), &temp).await;

        let job = scheduler
            .submit("j3", "gpu:0", "pytorch/pytorch:latest")
            .await
            .unwrap();

        assert!(scheduler.cancel(job.id).await.unwrap());

        let finished = scheduler.get(job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert_eq!(scheduler.store().pop_head().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_refuses_already_terminal_job() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(ImmediateDriver), &temp).await;

        let job = scheduler
            .submit("j5", "gpu:0", "pytorch/pytorch:latest")
            .await
            .unwrap();
        scheduler.tick().await.unwrap();
        assert_eq!(scheduler.get(job.id).await.unwrap().unwrap().status, JobStatus::Completed);

        // A job that already finished must never revert to cancelled
        // (spec.md:39: terminal statuses never revert).
        assert!(!scheduler.cancel(job.id).await.unwrap());
        assert_eq!(scheduler.get(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn reconcile_on_startup_leaves_surviving_containers_running() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(SurvivingDriver), &temp).await;

        let job = scheduler
            .submit("j6", "gpu:0", "pytorch/pytorch:latest")
            .await
            .unwrap();
        scheduler.store().pop_head().await.unwrap();
        scheduler.store().acquire("gpu:0", job.id).await.unwrap();
        scheduler.store().mark_running(job.id).await.unwrap();

        scheduler.reconcile_on_startup().await.unwrap();

        let job = scheduler.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(!scheduler.store().is_available("gpu:0").await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_on_startup_fails_jobs_with_missing_containers() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(NoContainerDriver), &temp).await;

        let job = scheduler
            .submit("j4", "gpu:0", "pytorch/pytorch:latest")
            .await
            .unwrap();
        scheduler.store().pop_head().await.unwrap();
        scheduler.store().acquire("gpu:0", job.id).await.unwrap();
        scheduler.store().mark_running(job.id).await.unwrap();

        scheduler.reconcile_on_startup().await.unwrap();

        let finished = scheduler.get(job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.error.as_deref(), Some(WORKER_RESTARTED_ERROR));
        assert!(scheduler.store().is_available("gpu:0").await.unwrap());
    }
}
