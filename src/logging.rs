//! Tracing subscriber setup for the `forgeyard` binary.

use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// The verbosity flag sets the default level (`info` unless raised or
/// lowered by `-v`/`-q`, spec §10.1); `RUST_LOG` can further refine it
/// per-module, and takes precedence where the two disagree.
pub fn init(verbosity: &Verbosity<InfoLevel>) {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
