//! The Job Runner: executes a single job on a single leased resource
//! (spec §4.5).

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::container::ContainerDriver;
use crate::container::DriverError;
use crate::container::GpuRequest;
use crate::container::Mount;
use crate::container::RunSpec;
use crate::container::training_command;
use crate::db::DatabaseError;
use crate::db::Job;
use crate::db::Store;
use crate::workspace::DataDirs;
use crate::workspace::WorkspaceError;

/// Container name prefix, so a restarted worker can re-attach to a job's
/// container by deterministic name rather than a remembered id (spec §9).
const CONTAINER_NAME_PREFIX: &str = "forgeyard-job";

/// Errors raised while running a single job. Every variant is trapped by
/// [`run`] and converted into a `failed` status transition; this type exists
/// so callers can log the cause.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The shared store could not be reached.
    #[error("store error: {0}")]
    Store(#[from] DatabaseError),

    /// The workspace could not be prepared.
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    /// The container engine rejected a request.
    #[error("container driver error: {0}")]
    Driver(#[from] DriverError),

    /// An I/O error streaming logs.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The deterministic container name for a job, used both to launch it and to
/// re-attach to it after a worker restart.
pub fn container_name(job_id: Uuid) -> String {
    format!("{CONTAINER_NAME_PREFIX}-{job_id}")
}

/// Build the [`RunSpec`] for a job's container (spec §4.5 Launch phase).
fn build_run_spec(job: &Job, dirs: &DataDirs) -> RunSpec {
    let job_dir = dirs.job_dir(job.id);
    let output_dir = dirs.output_dir(job.id);

    let gpu = job
        .resource
        .strip_prefix("gpu:")
        .map(|index| GpuRequest {
            device_index: index.to_string(),
        });

    RunSpec {
        image: job.runtime_image.clone(),
        command: training_command(),
        mounts: vec![
            Mount {
                source: job_dir.to_string_lossy().into_owned(),
                target: String::from("/workspace"),
            },
            Mount {
                source: output_dir.to_string_lossy().into_owned(),
                target: String::from("/output"),
            },
        ],
        gpu,
        env: vec![],
        name: container_name(job.id),
    }
}

/// Run `job` to completion: Prepare, Launch, Stream, Reconcile, Cleanup (spec
/// §4.5). Always releases the resource lease on the way out, regardless of
/// outcome.
pub async fn run(
    store: Arc<dyn Store>,
    driver: Arc<dyn ContainerDriver>,
    dirs: DataDirs,
    host_data_dir: Option<std::path::PathBuf>,
    mut job: Job,
    cancellation: CancellationToken,
) {
    let job_id = job.id;
    let resource = job.resource.clone();

    match run_inner(&store, &driver, &dirs, host_data_dir, &mut job, &cancellation).await {
        Ok(()) => {}
        Err(e) => {
            error!(%job_id, error = %e, "job runner failed");
            if let Err(e) = store.reconcile_failed(job_id, &e.to_string()).await {
                error!(%job_id, error = %e, "failed to record runner failure");
            }
        }
    }

    if let Err(e) = store.release(&resource).await {
        error!(%job_id, %resource, error = %e, "failed to release resource lease during cleanup");
    }
}

/// The fallible body of [`run`], split out so every error path funnels
/// through one `reconcile_failed` call.
async fn run_inner(
    store: &Arc<dyn Store>,
    driver: &Arc<dyn ContainerDriver>,
    dirs: &DataDirs,
    host_data_dir: Option<std::path::PathBuf>,
    job: &mut Job,
    cancellation: &CancellationToken,
) -> Result<(), RunnerError> {
    // -- Prepare --------------------------------------------------------
    let job_dir = dirs.job_dir(job.id);
    let output_dir = dirs.output_dir(job.id);
    let upload_path = dirs.upload_path(job.id);

    crate::workspace::extract_archive(&upload_path, &job_dir)?;
    std::fs::create_dir_all(&output_dir)?;
    crate::workspace::validate_contains_required_files(&job_dir)?;
    crate::workspace::write_log_header(&job_dir, &job.resource, &job.runtime_image)?;

    if !store.start_job(job.id).await? {
        info!(job_id = %job.id, "job was cancelled before dispatch; aborting prepare");
        return Ok(());
    }

    info!(job_id = %job.id, resource = %job.resource, "job running");

    // -- Launch -----------------------------------------------------------
    let mut spec = build_run_spec(job, dirs);
    if let Some(host_data_dir) = host_data_dir {
        let data_dir = dirs.jobs_dir.parent().unwrap_or(dirs.jobs_dir.as_path());
        spec.rewrite_mounts_for_host(data_dir, &host_data_dir);
    }

    let container_id = driver.run(&spec).await?;
    store.set_container(job.id, &container_id).await?;
    info!(job_id = %job.id, %container_id, "container launched");

    // -- Stream -------------------------------------------------------------
    let log_path = crate::workspace::output_log_path(&job_dir);
    let mut log_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await?;

    let mut logs = driver.logs_stream(&container_id);
    let drain = async {
        loop {
            match logs.next().await {
                Some(Ok(bytes)) => {
                    log_file.write_all(&bytes).await.map_err(RunnerError::from)?;
                    log_file.flush().await.map_err(RunnerError::from)?;
                }
                Some(Err(e)) => {
                    warn!(job_id = %job.id, error = %e, "error reading container logs");
                    break;
                }
                None => break,
            }
        }
        driver.wait(&container_id).await.map_err(RunnerError::from)
    };
    tokio::pin!(drain);

    let exit_code = tokio::select! {
        biased;

        () = cancellation.cancelled() => {
            warn!(job_id = %job.id, "cancellation requested; stopping container");
            let _ = driver.stop(&container_id, crate::container::STOP_GRACE_SECONDS).await;
            (&mut drain).await?
        }
        result = &mut drain => result?,
    };

    info!(job_id = %job.id, exit_code, "container exited");

    // -- Reconcile ------------------------------------------------------
    let current = store.get_job(job.id).await?;
    let already_cancelled = matches!(
        current.as_ref().map(|j| j.status),
        Some(crate::db::JobStatus::Cancelled)
    );

    if already_cancelled {
        info!(job_id = %job.id, "job was cancelled; leaving terminal status alone");
    } else if exit_code == 0 {
        store.reconcile_completed(job.id).await?;
    } else {
        store
            .reconcile_failed(job.id, &format!("container exited with code {exit_code}"))
            .await?;
    }

    // -- Cleanup --------------------------------------------------------
    let _ = driver.remove(&container_id).await;
    store.clear_container(job.id).await?;

    Ok(())
}
