//! Durable backup state for pause/stop/resume.
//!
//! The controller persists its state at `<destination>/.backup_state.json`
//! while a backup is underway. The file is removed on successful completion
//! and retained on pause, stop, and failure so an interrupted backup can be
//! discovered and resumed later.

use crate::progress::BackupProgress;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the state file inside the destination directory.
pub const STATE_FILE_NAME: &str = ".backup_state.json";

/// Lifecycle status of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
    /// Event-only value for a run cancelled without an explicit command;
    /// never persisted to the state file.
    Cancelled,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupStatus::Running => "Running",
            BackupStatus::Paused => "Paused",
            BackupStatus::Stopped => "Stopped",
            BackupStatus::Completed => "Completed",
            BackupStatus::Failed => "Failed",
            BackupStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", name)
    }
}

/// The engine-facing configuration recorded for resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub destination: PathBuf,
    pub sources: Vec<PathBuf>,
    pub ignore_patterns: Vec<String>,
}

/// Durable snapshot of an in-progress (or interrupted) backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupState {
    pub id: Uuid,
    pub status: BackupStatus,
    pub progress: BackupProgress,
    pub config: BackupConfig,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub processed_paths: HashSet<String>,
    pub current_file: Option<String>,
}

impl BackupState {
    pub fn new(config: BackupConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: BackupStatus::Running,
            progress: BackupProgress::default(),
            config,
            start_time: now,
            last_update: now,
            processed_paths: HashSet::new(),
            current_file: None,
        }
    }

    pub fn state_file(destination: &Path) -> PathBuf {
        destination.join(STATE_FILE_NAME)
    }

    /// Persist to the destination recorded in the config.
    pub fn save(&self) -> Result<()> {
        let path = Self::state_file(&self.config.destination);
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Load the state file from a destination; `None` when absent.
    pub fn load(destination: &Path) -> Result<Option<Self>> {
        let path = Self::state_file(destination);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Delete the state file; missing files are fine.
    pub fn remove(destination: &Path) -> Result<()> {
        match fs::remove_file(Self::state_file(destination)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
