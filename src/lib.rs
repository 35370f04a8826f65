//! `forgeyard`: a multi-tenant queue and runner for containerized model
//! training jobs.
//!
//! A single worker process owns a shared SQLite-backed store (the Job
//! Store, Resource Registry, and Pending Queue), a Scheduler Loop that
//! dispatches queued jobs onto free resources, a Job Runner that drives
//! each container through its Prepare/Launch/Stream/Reconcile/Cleanup
//! phases, and a thin `axum` HTTP surface over the same scheduler handle.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;

pub mod api;
pub mod config;
pub mod container;
pub mod db;
pub mod logging;
pub mod runner;
pub mod scheduler;
pub mod workspace;

use config::Config;
use container::BollardDriver;
use db::SqliteStore;
use db::Store;
use scheduler::Scheduler;
use workspace::DataDirs;

/// Command line arguments for the `forgeyard` worker/API process.
#[derive(Parser, Debug)]
#[command(
    name = "forgeyard",
    about = "A multi-tenant queue and runner for containerized model training jobs",
    version
)]
pub struct Args {
    /// Configuration file path. If unset, configuration comes from
    /// environment variables and defaults alone (spec §10.3).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The verbosity flags. Defaults to `info` (spec §10.1); `-q` lowers it,
    /// `-v` raises it, and `RUST_LOG` can refine it further per-module.
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Build the store, container driver, and scheduler from `config`, run the
/// startup reconciliation rule (spec §5), then run the Scheduler Loop and
/// the HTTP server concurrently until either exits.
///
/// # Errors
///
/// Returns an error if the store cannot be opened and migrated, if no
/// container engine socket is reachable, or if the HTTP server fails to
/// bind its configured address.
pub async fn run(args: Args) -> anyhow::Result<()> {
    logging::init(&args.verbose);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let dirs = DataDirs::under(&config.data_dir);
    dirs.ensure()?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(config.store_path()).await?);

    if let Some(docker_host) = &config.docker_host {
        // SAFETY: this runs once, before any other task reads the
        // environment, during single-threaded startup.
        unsafe {
            std::env::set_var("DOCKER_HOST", docker_host);
        }
    }
    let docker = container::connect()?;
    let driver: Arc<dyn container::ContainerDriver> = Arc::new(BollardDriver::new(docker));

    let scheduler = Scheduler::new(store, driver, dirs, config.host_data_dir.clone());

    scheduler.reconcile_on_startup().await?;

    let app = api::create_router(api::AppState::builder().scheduler(scheduler.clone()).build());
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "HTTP surface listening");

    let serve = axum::serve(listener, app);

    tokio::select! {
        result = serve => result.map_err(anyhow::Error::from),
        () = scheduler.run_loop() => Ok(()),
    }
}
