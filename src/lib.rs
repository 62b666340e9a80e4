//! # snapvault
//!
//! Incremental, deduplicating backups of directory trees into a portable
//! content-addressed destination store.
//!
//! ## Features
//!
//! - **Content-addressed storage**: file contents keyed by SHA-256, so
//!   equal content is stored once across all snapshots
//! - **Rsync-style change detection**: unchanged size and mtime carries the
//!   prior hash forward without reading the file
//! - **Streaming manifests**: snapshots with millions of entries are
//!   written with bounded memory and published atomically
//! - **Cooperative cancellation**: every byte-moving primitive polls a
//!   cancellation token
//! - **Pause/stop/resume**: durable backup state survives interruption
//! - **CLI interface**: backup, snapshot listing, and restore commands

pub mod cli;
pub mod controller;
pub mod copier;
pub mod engine;
pub mod error;
pub mod ignore;
pub mod logging;
pub mod progress;
pub mod restore;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod writer;

pub use error::{Error, Result};
