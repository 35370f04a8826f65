//! Service configuration (spec §10.3).

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

/// Default shared-store location: an in-memory SQLite database, suitable
/// only for a single-process development run.
const DEFAULT_STORE_URL: &str = "sqlite::memory:";

/// Default root for the uploads/jobs/outputs subtrees.
const DEFAULT_DATA_DIR: &str = "./data";

/// Default address the HTTP surface binds to.
const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";

/// Default data directory function for serde.
fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

/// Default bind address function for serde.
fn default_bind_address() -> String {
    String::from(DEFAULT_BIND_ADDRESS)
}

/// Default store URL function for serde.
fn default_store_url() -> String {
    String::from(DEFAULT_STORE_URL)
}

/// Service configuration, loaded from an optional TOML file and overlaid
/// with environment variables (spec §6, §10.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared key-value store endpoint: a filesystem path to the embedded
    /// SQLite database, accepted either as a bare path or a `sqlite:` URL
    /// (default: an in-memory database, `STORE_URL`).
    #[serde(default = "default_store_url")]
    pub store_url: String,
    /// Root for the `uploads/`, `jobs/`, and `outputs/` subtrees (default:
    /// `./data`, `DATA_DIR`).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// If set, the worker runs inside a container; this is the host path
    /// that maps to `data_dir`, used to rewrite mount paths when spawning
    /// sibling containers (default: unset, `HOST_DATA_DIR`).
    #[serde(default)]
    pub host_data_dir: Option<PathBuf>,
    /// Container engine socket override (`DOCKER_HOST`).
    #[serde(default)]
    pub docker_host: Option<String>,
    /// Address the HTTP surface binds to (default: `127.0.0.1:8080`,
    /// `BIND_ADDRESS`).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            data_dir: default_data_dir(),
            host_data_dir: None,
            docker_host: None,
            bind_address: default_bind_address(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay it with any of the
    /// recognized environment variables that are set, and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file `{}`", path.display()))?;

        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables alone, starting from
    /// defaults, and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay recognized environment variables onto `self`, if set.
    fn overlay_env(&mut self) {
        if let Ok(value) = std::env::var("STORE_URL") {
            self.store_url = value;
        }
        if let Ok(value) = std::env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("HOST_DATA_DIR") {
            self.host_data_dir = Some(PathBuf::from(value));
        }
        if let Ok(value) = std::env::var("DOCKER_HOST") {
            self.docker_host = Some(value);
        }
        if let Ok(value) = std::env::var("BIND_ADDRESS") {
            self.bind_address = value;
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `data_dir` is empty, and canonicalizes it to an
    /// absolute path (so jobs keyed only by a relative-path config still
    /// resolve consistently regardless of the process's working directory).
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("`data_dir` cannot be empty");
        }

        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create data dir `{}`", self.data_dir.display()))?;
        self.data_dir = self
            .data_dir
            .canonicalize()
            .context("failed to canonicalize `data_dir`")?;

        Ok(())
    }

    /// The filesystem path [`crate::db::SqliteStore::new`] should connect
    /// to, accepting `store_url` either as a bare path or as a `sqlite:`
    /// URL (spec §6 `STORE_URL`).
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(
            self.store_url
                .strip_prefix("sqlite://")
                .or_else(|| self.store_url.strip_prefix("sqlite:"))
                .unwrap_or(&self.store_url),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_fallbacks() {
        let config = Config::default();
        assert_eq!(config.store_url, "sqlite::memory:");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert!(config.host_data_dir.is_none());
        assert_eq!(config.bind_address, "127.0.0.1:8080");
    }

    #[test]
    fn validate_rejects_empty_data_dir() {
        let mut config = Config {
            data_dir: PathBuf::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_canonicalizes_data_dir() {
        let temp = tempfile::tempdir().unwrap();
        let relative = temp.path().join("data");

        let mut config = Config {
            data_dir: relative.clone(),
            ..Default::default()
        };
        config.validate().unwrap();

        assert!(config.data_dir.is_absolute());
        assert!(config.data_dir.ends_with("data"));
    }

    #[test]
    fn store_path_strips_sqlite_url_prefix() {
        let config = Config {
            store_url: String::from("sqlite:///var/lib/forgeyard/jobs.db"),
            ..Default::default()
        };
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/forgeyard/jobs.db"));

        let config = Config {
            store_url: String::from("sqlite::memory:"),
            ..Default::default()
        };
        assert_eq!(config.store_path(), PathBuf::from(":memory:"));

        let config = Config {
            store_url: String::from("/data/jobs.db"),
            ..Default::default()
        };
        assert_eq!(config.store_path(), PathBuf::from("/data/jobs.db"));
    }

    #[test]
    fn from_toml_overrides_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            store_url = "sqlite://jobs.db"
            data_dir = "{}"
            bind_address = "0.0.0.0:9000"
            "#,
            temp.path().join("data").display()
        );

        let config_path = temp.path().join("config.toml");
        std::fs::write(&config_path, toml).unwrap();

        // SAFETY: this process-wide mutation is confined to this test and
        // the variable is not read by any other concurrently running test.
        unsafe {
            std::env::remove_var("STORE_URL");
        }

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.store_url, "sqlite://jobs.db");
        assert_eq!(config.bind_address, "0.0.0.0:9000");
    }
}
