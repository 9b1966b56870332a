//! GridHarvest CLI: bulk acquisition of per-coordinate records.
//!
//! Enumerates a spatial mask, fetches each required record from the upstream
//! service with retry and consensus checks, and keeps a resumable cache log.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
