//! snapvault - incremental, deduplicating directory backups
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use snapvault::cli::{Cli, Commands};
use snapvault::logging::init_logging;
use snapvault::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Backup(args) => snapvault::cli::backup::run(args).await,
        Commands::Snapshots(args) => snapvault::cli::snapshots::run(args).await,
        Commands::Restore(args) => snapvault::cli::restore::run(args).await,
    }
}
