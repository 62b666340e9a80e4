//! Streaming snapshot serialization.
//!
//! The manifest is written in two phases: entries are appended to a
//! buffered `.json.tmp` file as the walk produces them (durability and
//! bounded memory), then `close` rewrites the file with the canonical
//! serialization and renames it into place. No reader ever observes a
//! partial snapshot at the canonical name.

use crate::snapshot::{snapshot_path, snapshots_dir, FileEntry, Snapshot};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// When the buffered writer is forced to the operating system.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Flush after this many entries.
    pub max_entries: usize,
    /// Flush at least this often.
    pub max_interval: Duration,
    /// Flush once this many serialized bytes have accumulated.
    pub max_buffered_bytes: u64,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_entries: 5_000,
            max_interval: Duration::from_secs(60),
            max_buffered_bytes: 200 * 1024 * 1024,
        }
    }
}

/// Accepts file entries incrementally and publishes one atomic manifest.
pub struct SnapshotWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    snapshot: Snapshot,
    policy: FlushPolicy,
    entries_since_flush: usize,
    bytes_since_flush: u64,
    last_flush: Instant,
}

impl SnapshotWriter {
    /// Create `snapshots/` if needed and open `<id>.json.tmp` for writing.
    pub fn open(
        destination: &Path,
        id: &str,
        sources: Vec<String>,
        timestamp: DateTime<Utc>,
        policy: FlushPolicy,
    ) -> Result<Self> {
        let dir = snapshots_dir(destination);
        fs::create_dir_all(&dir).map_err(|e| Error::DestinationIo {
            path: dir.clone(),
            source: e,
        })?;

        let final_path = snapshot_path(destination, id);
        let temp_path = final_path.with_extension("json.tmp");

        let file = File::create(&temp_path).map_err(|e| Error::DestinationIo {
            path: temp_path.clone(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);

        let snapshot = Snapshot::new(id.to_string(), timestamp, sources);

        // Header line first, so even the append phase starts with the
        // snapshot identity.
        let header = serde_json::to_vec(&snapshot)?;
        Self::write_line(&mut writer, &header, &temp_path)?;

        Ok(Self {
            temp_path,
            final_path,
            writer: Some(writer),
            snapshot,
            policy,
            entries_since_flush: 0,
            bytes_since_flush: header.len() as u64,
            last_flush: Instant::now(),
        })
    }

    fn write_line(writer: &mut BufWriter<File>, data: &[u8], path: &Path) -> Result<()> {
        writer
            .write_all(data)
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| Error::DestinationIo {
                path: path.to_path_buf(),
                source: e,
            })
    }

    /// Record an entry. A later entry for the same path overwrites the
    /// earlier one. Applies the flush policy after appending.
    pub fn add(&mut self, entry: FileEntry) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(Error::Precondition {
                operation: "add",
                reason: "snapshot writer is closed".to_string(),
            });
        };

        let line = serde_json::to_vec(&entry)?;
        Self::write_line(writer, &line, &self.temp_path)?;

        self.snapshot.files.insert(entry.path.clone(), entry);
        self.entries_since_flush += 1;
        self.bytes_since_flush += line.len() as u64 + 1;

        if self.entries_since_flush >= self.policy.max_entries
            || self.bytes_since_flush >= self.policy.max_buffered_bytes
            || self.last_flush.elapsed() >= self.policy.max_interval
        {
            self.flush()?;
        }

        Ok(())
    }

    /// Force buffered entries to the operating system.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| Error::DestinationIo {
                path: self.temp_path.clone(),
                source: e,
            })?;
        }
        self.entries_since_flush = 0;
        self.bytes_since_flush = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Rewrite the file with the canonical serialization and atomically
    /// rename it to the final name. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        let mut file = writer
            .into_inner()
            .map_err(|e| Error::DestinationIo {
                path: self.temp_path.clone(),
                source: e.into_error(),
            })?;

        let io_err = |e: std::io::Error, path: &Path| Error::DestinationIo {
            path: path.to_path_buf(),
            source: e,
        };

        file.seek(SeekFrom::Start(0))
            .map_err(|e| io_err(e, &self.temp_path))?;
        file.set_len(0).map_err(|e| io_err(e, &self.temp_path))?;
        serde_json::to_writer_pretty(&mut file, &self.snapshot)?;
        file.sync_all().map_err(|e| io_err(e, &self.temp_path))?;
        drop(file);

        fs::rename(&self.temp_path, &self.final_path)
            .map_err(|e| io_err(e, &self.final_path))?;

        debug!(
            "Published snapshot {} with {} entries",
            self.snapshot.id,
            self.snapshot.files.len()
        );
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.snapshot.files.len()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry(path: &str, hash: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            hash: hash.to_string(),
            size: 2,
            mode: 0o644,
            mod_time: Utc.with_ymd_and_hms(2023, 12, 7, 11, 30, 0).unwrap(),
        }
    }

    fn open_writer(dest: &Path, policy: FlushPolicy) -> Result<SnapshotWriter> {
        SnapshotWriter::open(
            dest,
            "20231207120000",
            vec!["/abs/src".to_string()],
            Utc.with_ymd_and_hms(2023, 12, 7, 12, 0, 0).unwrap(),
            policy,
        )
    }

    #[test]
    fn test_open_creates_temp_not_canonical() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let writer = open_writer(temp_dir.path(), FlushPolicy::default())?;
        assert!(writer.temp_path().exists());
        assert!(!writer.final_path().exists());
        Ok(())
    }

    #[test]
    fn test_close_publishes_atomically() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut writer = open_writer(temp_dir.path(), FlushPolicy::default())?;
        writer.add(entry("a.txt", "aa"))?;
        writer.add(entry("b/c.txt", "bb"))?;
        assert_eq!(writer.entry_count(), 2);
        writer.close()?;

        assert!(!writer.temp_path().exists());
        let loaded = Snapshot::load(writer.final_path())?;
        assert_eq!(loaded.id, "20231207120000");
        assert_eq!(loaded.files.len(), 2);
        assert_eq!(loaded.files["a.txt"].hash, "aa");
        Ok(())
    }

    #[test]
    fn test_later_duplicate_wins() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut writer = open_writer(temp_dir.path(), FlushPolicy::default())?;
        writer.add(entry("a.txt", "old"))?;
        writer.add(entry("a.txt", "new"))?;
        writer.close()?;

        let loaded = Snapshot::load(writer.final_path())?;
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files["a.txt"].hash, "new");
        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut writer = open_writer(temp_dir.path(), FlushPolicy::default())?;
        writer.add(entry("a.txt", "aa"))?;
        writer.close()?;
        writer.close()?;
        assert!(writer.final_path().exists());
        Ok(())
    }

    #[test]
    fn test_add_after_close_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut writer = open_writer(temp_dir.path(), FlushPolicy::default())?;
        writer.close()?;
        let result = writer.add(entry("late.txt", "cc"));
        assert!(matches!(result, Err(Error::Precondition { .. })));
        Ok(())
    }

    #[test]
    fn test_entry_threshold_forces_flush() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let policy = FlushPolicy {
            max_entries: 1,
            ..FlushPolicy::default()
        };
        let mut writer = open_writer(temp_dir.path(), policy)?;
        writer.add(entry("visible.txt", "dd"))?;

        // With the one-entry policy, the appended line reached the OS
        // without an explicit flush call.
        let on_disk = fs::read_to_string(writer.temp_path())?;
        assert!(on_disk.contains("visible.txt"));
        Ok(())
    }

    #[test]
    fn test_unflushed_entries_stay_buffered() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut writer = open_writer(temp_dir.path(), FlushPolicy::default())?;
        // Header is flushed through File::create + first write buffering;
        // read what is on disk before and after an unflushed add.
        writer.flush()?;
        let before = fs::read_to_string(writer.temp_path())?;
        writer.add(entry("buffered.txt", "ee"))?;
        let after = fs::read_to_string(writer.temp_path())?;
        assert_eq!(before, after);

        writer.flush()?;
        let flushed = fs::read_to_string(writer.temp_path())?;
        assert!(flushed.contains("buffered.txt"));
        Ok(())
    }

    #[test]
    fn test_append_phase_keeps_header_first() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut writer = open_writer(temp_dir.path(), FlushPolicy::default())?;
        writer.add(entry("a.txt", "aa"))?;
        writer.flush()?;

        let on_disk = fs::read_to_string(writer.temp_path())?;
        let first_line = on_disk.lines().next().unwrap();
        let header: serde_json::Value = serde_json::from_str(first_line)?;
        assert_eq!(header["id"], "20231207120000");
        Ok(())
    }
}
