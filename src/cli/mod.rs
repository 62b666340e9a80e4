//! Command-line interface for snapvault.
//!
//! This module provides a CLI using clap for running backups, listing
//! snapshots, and restoring files from a destination store.

use clap::{Parser, Subcommand};

pub mod backup;
pub mod restore;
pub mod snapshots;

/// snapvault - incremental, deduplicating directory backups
#[derive(Parser)]
#[command(name = "snapvault")]
#[command(about = "Incremental, deduplicating backups into a portable content-addressed store")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a backup snapshot
    Backup(backup::BackupArgs),
    /// List snapshots in a destination
    Snapshots(snapshots::SnapshotsArgs),
    /// Restore files from a snapshot
    Restore(restore::RestoreArgs),
}
