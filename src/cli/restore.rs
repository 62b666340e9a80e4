//! Restore command implementation.

use crate::restore::{RestoreEngine, RestoreOptions};
use crate::snapshot::{latest_snapshot, snapshot_path, Snapshot};
use crate::{Error, Result};
use clap::Args;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Arguments for the restore command
#[derive(Args)]
pub struct RestoreArgs {
    /// Backup destination directory to restore from
    #[arg(short, long)]
    pub destination: PathBuf,

    /// Snapshot id to restore; the latest snapshot when omitted
    #[arg(short, long)]
    pub snapshot: Option<String>,

    /// Directory to restore into
    #[arg(short, long)]
    pub target: PathBuf,

    /// Restore recorded modification times
    #[arg(long)]
    pub preserve_mod_times: bool,

    /// Ignore pattern for entries that must not be restored (repeatable)
    #[arg(short, long = "ignore")]
    pub ignore_patterns: Vec<String>,
}

/// Run the restore command. Ctrl-C cancels the pass cooperatively.
pub async fn run(args: RestoreArgs) -> Result<()> {
    let snapshot = match &args.snapshot {
        Some(id) => Snapshot::load(&snapshot_path(&args.destination, id))?,
        None => latest_snapshot(&args.destination)?.ok_or_else(|| Error::Precondition {
            operation: "restore",
            reason: format!("no snapshots in {}", args.destination.display()),
        })?,
    };

    println!(
        "Restoring snapshot {} ({} files) into {}",
        snapshot.id,
        snapshot.files.len(),
        args.target.display()
    );

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling restore...");
            signal_token.cancel();
        }
    });

    let options = RestoreOptions {
        preserve_mod_times: args.preserve_mod_times,
        preserve_permissions: true,
        ignore_patterns: args.ignore_patterns,
    };

    let summary = tokio::task::spawn_blocking(move || {
        RestoreEngine::new(&args.destination).restore(&snapshot, &args.target, &options, &token)
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;

    println!("Restore finished");
    println!("  Files restored: {}", summary.files_restored);
    println!("  Files skipped: {}", summary.files_skipped);
    if summary.files_failed > 0 {
        println!("  Files failed: {}", summary.files_failed);
    }
    println!("  Bytes copied: {}", summary.bytes_copied);

    Ok(())
}
