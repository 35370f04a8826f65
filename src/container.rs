//! The Container Driver: the abstraction over the container engine used to
//! run, stream, stop, and remove a job's container (spec §4.4).

use std::path::Path;
use std::path::PathBuf;

use bollard::Docker;
use bollard::container::Config as ContainerConfig;
use bollard::container::CreateContainerOptions;
use bollard::container::InspectContainerOptions;
use bollard::container::KillContainerOptions;
use bollard::container::LogOutput;
use bollard::container::LogsOptions;
use bollard::container::RemoveContainerOptions;
use bollard::container::StartContainerOptions;
use bollard::container::WaitContainerOptions;
use bollard::models::DeviceRequest;
use bollard::models::HostConfig;
use futures::Stream;
use futures::StreamExt;
use thiserror::Error;

/// Environment variable set unbuffered so the training script's stdout is
/// flushed line-by-line rather than block-buffered (spec §4.5).
const PYTHONUNBUFFERED: &str = "PYTHONUNBUFFERED=1";

/// Grace period, in seconds, given to a cancelled job's container before a
/// forcible kill (spec §8 scenario 4). Shared by the Job Runner's
/// cancellation path and the scheduler's `cancel` entry point so the value
/// lives in one place.
pub const STOP_GRACE_SECONDS: u32 = 5;

/// Errors raised by the Container Driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Could not establish a connection to any container engine socket.
    #[error("failed to connect to a container engine: {0}")]
    Connect(String),

    /// The underlying bollard/Docker API call failed.
    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    /// The container's wait stream ended without ever reporting an exit.
    #[error("container wait stream ended unexpectedly")]
    WaitStreamEnded,
}

/// Result type for Container Driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// A read-write bind mount from a host (or host-visible, see
/// [`RunSpec::rewrite_mounts_for_host`]) path to a path inside the container.
#[derive(Debug, Clone)]
pub struct Mount {
    /// Path on the container engine's side (host, or host-visible).
    pub source: String,
    /// Path as seen from inside the container.
    pub target: String,
}

/// A request to attach an accelerator device to a container.
#[derive(Debug, Clone)]
pub struct GpuRequest {
    /// The device index, e.g. `0` for `gpu:0`.
    pub device_index: String,
}

/// Everything needed to launch a job's container (spec §4.4, §4.5).
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Container image reference.
    pub image: String,
    /// Shell command to run inside the container.
    pub command: Vec<String>,
    /// Read-write bind mounts.
    pub mounts: Vec<Mount>,
    /// Accelerator attachment, absent for `resource = cpu`.
    pub gpu: Option<GpuRequest>,
    /// Additional environment variables, as `KEY=value` pairs.
    pub env: Vec<String>,
    /// Human-readable container name, derived from the job id.
    pub name: String,
}

/// The shell command run inside every training container: locate
/// `requirements.txt` and `train.py` by recursive, shallowest-match search
/// (tolerating an enclosing project folder or not), install requirements,
/// and run the script from the directory it was found in (spec §4.4).
pub fn training_command() -> Vec<String> {
    let script = r#"
set -e
cd /workspace
req=$(find . -name requirements.txt -printf '%d %p\n' | sort -n | head -n1 | cut -d' ' -f2-)
train=$(find . -name train.py -printf '%d %p\n' | sort -n | head -n1 | cut -d' ' -f2-)
if [ -z "$train" ]; then
  echo "train.py not found in archive" >&2
  exit 1
fi
dir=$(dirname "$train")
cd "$dir"
if [ -n "$req" ]; then
  pip install --no-cache-dir -r "$(basename "$req")"
fi
python train.py
"#;
    vec![
        String::from("/bin/sh"),
        String::from("-c"),
        String::from(script),
    ]
}

impl RunSpec {
    /// Rewrite every mount source by replacing a `data_dir` prefix with
    /// `host_data_dir`, for when the worker runs inside a container but
    /// launches sibling containers via the host engine (spec §4.4).
    pub fn rewrite_mounts_for_host(&mut self, data_dir: &Path, host_data_dir: &Path) {
        let data_dir = data_dir.to_string_lossy().into_owned();
        let host_data_dir = host_data_dir.to_string_lossy().into_owned();

        for mount in &mut self.mounts {
            if let Some(rest) = mount.source.strip_prefix(&data_dir) {
                mount.source = format!("{host_data_dir}{rest}");
            }
        }
    }
}

/// The Container Driver trait (spec §4.4). A single implementation
/// ([`BollardDriver`]) is provided; the trait exists so the Job Runner and
/// Scheduler Loop depend on the contract, not the engine.
#[async_trait::async_trait]
pub trait ContainerDriver: Send + Sync + std::fmt::Debug {
    /// Start a detached container per `spec`, returning its id.
    async fn run(&self, spec: &RunSpec) -> Result<String>;

    /// Follow stdout+stderr until the container exits, yielding every chunk
    /// exactly once.
    fn logs_stream(
        &self,
        container_id: &str,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

    /// Block until the container exits, returning its exit code.
    async fn wait(&self, container_id: &str) -> Result<i64>;

    /// Non-blocking check of whether the container is currently running,
    /// used by the supervisor reconciliation rule (spec §5) to tell a
    /// container that survived a worker restart from one that is gone,
    /// without blocking on the former until it happens to exit.
    async fn is_running(&self, container_id: &str) -> Result<bool>;

    /// Signal the container to stop, with a grace period before a forcible
    /// kill. Safe to call concurrently with an active log stream.
    async fn stop(&self, container_id: &str, grace_seconds: u32) -> Result<()>;

    /// Remove the container record. Tolerant of it already being removed.
    async fn remove(&self, container_id: &str) -> Result<()>;
}

/// The per-user Docker Desktop socket path, rooted at `home`.
fn user_socket_path(home: &Path) -> PathBuf {
    home.join(".docker").join("run").join("docker.sock")
}

/// Connect to the local container engine, trying in order: the
/// platform-specific per-user socket, the well-known system socket, then an
/// environment-directed override (`DOCKER_HOST`). This order must be
/// preserved for operator reproducibility (spec §6).
pub fn connect() -> Result<Docker> {
    if let Some(home) = dirs::home_dir() {
        let socket = user_socket_path(&home);
        if socket.exists() {
            if let Ok(docker) = Docker::connect_with_socket(
                &socket.to_string_lossy(),
                120,
                bollard::API_DEFAULT_VERSION,
            ) {
                return Ok(docker);
            }
        }
    }

    if Path::new("/var/run/docker.sock").exists() {
        if let Ok(docker) =
            Docker::connect_with_socket("/var/run/docker.sock", 120, bollard::API_DEFAULT_VERSION)
        {
            return Ok(docker);
        }
    }

    Docker::connect_with_defaults()
        .map_err(|e| DriverError::Connect(format!("no reachable container engine socket: {e}")))
}

/// A [`ContainerDriver`] backed directly by the Docker Engine API via
/// `bollard`.
#[derive(Debug, Clone)]
pub struct BollardDriver {
    /// The underlying connection handle. `bollard::Docker` is itself a cheap
    /// handle over a connection pool, so this is shared by clone rather than
    /// behind an `Arc`.
    docker: Docker,
}

impl BollardDriver {
    /// Wrap an already-connected [`Docker`] handle.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait::async_trait]
impl ContainerDriver for BollardDriver {
    async fn run(&self, spec: &RunSpec) -> Result<String> {
        let binds = spec
            .mounts
            .iter()
            .map(|m| format!("{}:{}:rw", m.source, m.target))
            .collect();

        let device_requests = spec.gpu.as_ref().map(|gpu| {
            vec![DeviceRequest {
                device_ids: Some(vec![gpu.device_index.clone()]),
                capabilities: Some(vec![vec![String::from("gpu")]]),
                ..Default::default()
            }]
        });

        let mut env = spec.env.clone();
        env.push(String::from(PYTHONUNBUFFERED));

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            host_config: Some(HostConfig {
                binds: Some(binds),
                device_requests,
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(container.id)
    }

    fn logs_stream(
        &self,
        container_id: &str,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>> {
        let stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        Box::pin(stream.map(|chunk| {
            chunk.map(|output| match output {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => message.to_vec(),
            })
            .map_err(DriverError::from)
        }))
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(DriverError::from(e)),
            None => Err(DriverError::WaitStreamEnded),
        }
    }

    async fn is_running(&self, container_id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(response.state.and_then(|state| state.running).unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(DriverError::from(e)),
        }
    }

    async fn stop(&self, container_id: &str, grace_seconds: u32) -> Result<()> {
        let options = bollard::container::StopContainerOptions {
            t: i64::from(grace_seconds),
        };

        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(_) => {
                // The grace period elapsed without the container stopping on
                // its own, or it was already gone; force a kill and swallow
                // "already stopped"/"no such container" errors either way,
                // since `stop` must be safe to call concurrently with a
                // log stream that may observe the exit first.
                let _ = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await;
                Ok(())
            }
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(DriverError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_socket_path_is_rooted_at_home() {
        let socket = user_socket_path(Path::new("/home/ci"));
        assert_eq!(socket, Path::new("/home/ci/.docker/run/docker.sock"));
    }

    #[test]
    fn rewrite_mounts_for_host_replaces_prefix() {
        let mut spec = RunSpec {
            image: String::from("pytorch/pytorch:latest"),
            command: training_command(),
            mounts: vec![Mount {
                source: String::from("/data/jobs/abc"),
                target: String::from("/workspace"),
            }],
            gpu: None,
            env: vec![],
            name: String::from("job-abc"),
        };

        spec.rewrite_mounts_for_host(Path::new("/data"), Path::new("/host/data"));
        assert_eq!(spec.mounts[0].source, "/host/data/jobs/abc");
    }

    #[test]
    fn training_command_searches_recursively() {
        let command = training_command();
        let script = &command[2];
        assert!(script.contains("find . -name train.py"));
        assert!(script.contains("find . -name requirements.txt"));
    }
}
