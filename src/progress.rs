//! Backup progress reporting.
//!
//! Progress flows from the engine over a bounded channel. Delivery is
//! best-effort: when the consumer lags, updates are dropped rather than
//! back-pressuring the walk.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Transient progress payload emitted to the embedding shell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    /// Files discovered so far.
    pub total_files: u64,
    /// Files processed; entries identified as unchanged decrement this so
    /// the processed/total fraction tracks actual transfer work.
    pub files_processed: u64,
    /// Path currently being handled.
    pub current_file: String,
    /// Bytes written to the object store (unchanged files count zero).
    pub bytes_transferred: u64,
    /// Total bytes seen across all discovered files.
    pub total_bytes: u64,
    /// Free-text phase description.
    pub status: String,
    /// Most recent non-fatal error, if any.
    pub error: Option<String>,
    /// Count of non-fatal per-file source errors.
    pub scan_errors: u64,
}

impl BackupProgress {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }
}

/// Clonable handle the engine uses to publish progress. A `disabled` sink
/// swallows updates, for callers that do not observe progress.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<BackupProgress>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<BackupProgress>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Best-effort emit; drops the update when the channel is full or the
    /// receiver is gone.
    pub fn emit(&self, progress: &BackupProgress) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(progress.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_sink_swallows_updates() {
        let sink = ProgressSink::disabled();
        sink.emit(&BackupProgress::with_status("Scanning"));
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ProgressSink::new(tx);

        sink.emit(&BackupProgress::with_status("first"));
        sink.emit(&BackupProgress::with_status("dropped"));

        assert_eq!(rx.try_recv().unwrap().status, "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_harmless() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = ProgressSink::new(tx);
        sink.emit(&BackupProgress::default());
    }
}
