//! The Job workspace: the per-job directory tree on shared storage (spec
//! §3, §6). Owned by the Runner for the job's lifetime.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Log file name, append-only and streamed to during the Stream phase.
const OUTPUT_LOG_FILE: &str = "output.log";

/// The required entrypoint script (spec §4.4, §6 "Container contract").
const TRAIN_SCRIPT: &str = "train.py";

/// The required dependency manifest (spec §4.4, §6 "Container contract").
const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Errors raised while preparing or inspecting a job workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// An I/O error while creating directories or files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The uploaded archive could not be opened or read as a zip file.
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// The extracted archive is missing a file the container contract
    /// requires (spec §7, "user input errors").
    #[error("archive is missing required file `{0}`")]
    MissingRequiredFile(&'static str),
}

/// Result type for workspace operations.
pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// The three data directories a job's workspace is laid out across (spec
/// §6): the original upload, the extracted job directory, and the mounted
/// output directory.
#[derive(Debug, Clone)]
pub struct DataDirs {
    /// Root for `<UPLOADS_DIR>/<job_id>.zip`.
    pub uploads_dir: PathBuf,
    /// Root for `<JOBS_DIR>/<job_id>/`.
    pub jobs_dir: PathBuf,
    /// Root for `<OUTPUTS_DIR>/<job_id>/`.
    pub outputs_dir: PathBuf,
}

impl DataDirs {
    /// Lay out `uploads/`, `jobs/`, `outputs/` subtrees under a single
    /// `data_dir` root (spec §6 `DATA_DIR`).
    pub fn under(data_dir: impl AsRef<Path>) -> Self {
        let root = data_dir.as_ref();
        Self {
            uploads_dir: root.join("uploads"),
            jobs_dir: root.join("jobs"),
            outputs_dir: root.join("outputs"),
        }
    }

    /// Create the three subtrees if they don't already exist.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.uploads_dir)?;
        std::fs::create_dir_all(&self.jobs_dir)?;
        std::fs::create_dir_all(&self.outputs_dir)?;
        Ok(())
    }

    /// Path to the original archive for a job.
    pub fn upload_path(&self, job_id: Uuid) -> PathBuf {
        self.uploads_dir.join(format!("{job_id}.zip"))
    }

    /// The job's extracted workspace directory.
    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.jobs_dir.join(job_id.to_string())
    }

    /// The job's output directory, mounted at `/output` inside the
    /// container.
    pub fn output_dir(&self, job_id: Uuid) -> PathBuf {
        self.outputs_dir.join(job_id.to_string())
    }
}

/// Extract `archive` into `destination`, creating `destination` if needed.
/// Idempotent: re-extracting over an existing directory overwrites files in
/// place rather than failing.
pub fn extract_archive(archive: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<()> {
    let destination = destination.as_ref();
    std::fs::create_dir_all(destination)?;

    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(destination)?;

    Ok(())
}

/// Find the shallowest occurrence of `name` under `root`, tolerating either a
/// bare project layout or one wrapped in an enclosing folder (spec §4.4's
/// "recursive search, selecting the shallowest match"). Host-side mirror of
/// the search the container's own launch command repeats, so a malformed
/// archive is rejected before a container is ever started, not after (spec
/// §7, "user input errors").
fn find_shallowest(root: &Path, name: &str) -> Option<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name() == name)
        .min_by_key(walkdir::DirEntry::depth)
        .map(walkdir::DirEntry::into_path)
}

/// Verify the extracted job directory contains `train.py` and
/// `requirements.txt` at some depth, failing fast with a message that
/// identifies the defect rather than letting the container discover it.
pub fn validate_contains_required_files(job_dir: impl AsRef<Path>) -> Result<()> {
    let job_dir = job_dir.as_ref();

    if find_shallowest(job_dir, TRAIN_SCRIPT).is_none() {
        return Err(WorkspaceError::MissingRequiredFile(TRAIN_SCRIPT));
    }
    if find_shallowest(job_dir, REQUIREMENTS_FILE).is_none() {
        return Err(WorkspaceError::MissingRequiredFile(REQUIREMENTS_FILE));
    }

    Ok(())
}

/// Write the `output.log` header recorded at the start of the Prepare phase
/// (spec §4.5): `started_at`, `resource`, and `runtime_image`.
pub fn write_log_header(
    job_dir: impl AsRef<Path>,
    resource: &str,
    runtime_image: &str,
) -> Result<()> {
    let path = job_dir.as_ref().join(OUTPUT_LOG_FILE);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    writeln!(
        file,
        "=== job started at {} on resource {resource} using image {runtime_image} ===",
        chrono::Utc::now().to_rfc3339(),
    )?;

    Ok(())
}

/// Path to a job's append-only log file.
pub fn output_log_path(job_dir: impl AsRef<Path>) -> PathBuf {
    job_dir.as_ref().join(OUTPUT_LOG_FILE)
}
