//! Snapshot listing command.

use crate::snapshot::{list_snapshot_ids, snapshot_path, Snapshot};
use crate::Result;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the snapshots command
#[derive(Args)]
pub struct SnapshotsArgs {
    /// Backup destination directory
    #[arg(short, long)]
    pub destination: PathBuf,
}

/// List the snapshots in a destination, oldest first.
pub async fn run(args: SnapshotsArgs) -> Result<()> {
    let ids = list_snapshot_ids(&args.destination)?;
    if ids.is_empty() {
        println!("No snapshots in {}", args.destination.display());
        return Ok(());
    }

    for id in &ids {
        match Snapshot::load(&snapshot_path(&args.destination, id)) {
            Ok(snapshot) => println!(
                "{}  {}  {} files  sources: {}",
                id,
                snapshot.timestamp.format("%Y-%m-%d %H:%M:%S"),
                snapshot.files.len(),
                snapshot.source.join(", ")
            ),
            Err(e) => println!("{}  (unreadable: {})", id, e),
        }
    }

    Ok(())
}
