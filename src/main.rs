//! The `forgeyard` worker/API binary.

use clap::Parser;
use forgeyard::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgeyard::run(Args::parse()).await
}
