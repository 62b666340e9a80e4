//! Backup command implementation.

use crate::engine::BackupEngine;
use crate::progress::{BackupProgress, ProgressSink};
use crate::{Error, Result};
use clap::Args;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// Backup destination directory
    #[arg(short, long)]
    pub destination: PathBuf,

    /// Source directory to back up (repeatable)
    #[arg(short, long = "source", required = true)]
    pub sources: Vec<PathBuf>,

    /// Ignore pattern (repeatable)
    #[arg(short, long = "ignore")]
    pub ignore_patterns: Vec<String>,
}

/// Run the backup command. Ctrl-C cancels the run cooperatively.
pub async fn run(args: BackupArgs) -> Result<()> {
    println!(
        "Backing up {} source(s) into {}",
        args.sources.len(),
        args.destination.display()
    );

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling backup...");
            signal_token.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel::<BackupProgress>(256);
    let printer = tokio::spawn(async move {
        // Per-file statuses are too chatty for a terminal; echo the phase
        // transitions only.
        let mut last_status = String::new();
        while let Some(progress) = rx.recv().await {
            if progress.status != last_status
                && !progress.status.starts_with("Storing ")
                && !progress.status.starts_with("Unchanged ")
            {
                println!("{}", progress.status);
                last_status = progress.status;
            }
        }
    });

    let summary = tokio::task::spawn_blocking(move || {
        BackupEngine::new(&args.destination).run(
            &args.sources,
            &args.ignore_patterns,
            &ProgressSink::new(tx),
            &token,
        )
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;
    let _ = printer.await;

    println!("Backup completed successfully!");
    println!("  Snapshot ID: {}", summary.snapshot_id);
    println!("  Files: {}", summary.total_files);
    println!("  Changed: {}", summary.changed_files);
    println!("  Bytes transferred: {}", summary.bytes_transferred);
    if summary.scan_errors > 0 {
        println!("  Scan errors: {}", summary.scan_errors);
    }

    Ok(())
}
