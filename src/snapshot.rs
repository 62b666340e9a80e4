//! Snapshot manifests and the on-disk snapshot catalog.
//!
//! A snapshot maps forward-slash relative paths to file entries and is
//! stored as pretty-printed JSON under `snapshots/<id>.json`, where the id
//! is the creation time rendered as `YYYYMMDDhhmmss`. Timestamp ids give a
//! total order without a separate index: lexicographic equals chronological.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Snapshot id time format.
pub const SNAPSHOT_ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// One regular file within a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path from the source root, forward-slash normalized.
    pub path: String,
    /// SHA-256 content hash, 64 hex characters.
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
    /// POSIX permission bits.
    pub mode: u32,
    /// Last modification time.
    pub mod_time: DateTime<Utc>,
}

/// A point-in-time backup manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Absolute source paths that were backed up.
    pub source: Vec<String>,
    /// Relative path -> entry. Iteration order is not part of the contract.
    pub files: BTreeMap<String, FileEntry>,
}

impl Snapshot {
    pub fn new(id: String, timestamp: DateTime<Utc>, source: Vec<String>) -> Self {
        Self {
            id,
            timestamp,
            source,
            files: BTreeMap::new(),
        }
    }

    /// Render a snapshot id for the given creation time.
    pub fn generate_id(time: DateTime<Utc>) -> String {
        time.format(SNAPSHOT_ID_FORMAT).to_string()
    }

    /// Parse a snapshot id back into its timestamp.
    pub fn parse_id(id: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(id, SNAPSHOT_ID_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Save atomically: write a `.tmp` sibling and rename into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| Error::CorruptSnapshot {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// POSIX permission bits for a manifest entry. Hosts without a mode concept
/// report the conventional `0o644`.
pub fn mode_bits(metadata: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

pub fn snapshots_dir(destination: &Path) -> PathBuf {
    destination.join("snapshots")
}

pub fn snapshot_path(destination: &Path, id: &str) -> PathBuf {
    snapshots_dir(destination).join(format!("{}.json", id))
}

/// Enumerate valid snapshot ids in a destination, oldest first. Entries
/// whose basename does not parse as a timestamp are skipped with a warning.
pub fn list_snapshot_ids(destination: &Path) -> Result<Vec<String>> {
    let dir = snapshots_dir(destination);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if Snapshot::parse_id(stem).is_none() {
            warn!("Skipping snapshot with invalid id format: {}", stem);
            continue;
        }
        ids.push(stem.to_string());
    }

    ids.sort();
    Ok(ids)
}

/// Load the most recent snapshot in a destination, or `None` when no valid
/// snapshot exists. A winner that fails to parse is a `CorruptSnapshot`.
pub fn latest_snapshot(destination: &Path) -> Result<Option<Snapshot>> {
    let ids = list_snapshot_ids(destination)?;
    let Some(latest) = ids.last() else {
        return Ok(None);
    };
    Snapshot::load(&snapshot_path(destination, latest)).map(Some)
}
