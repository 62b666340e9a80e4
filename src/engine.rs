//! The backup engine: walk, diff, store, write.
//!
//! One run walks every source tree, carries forward entries whose size and
//! mtime match the previous snapshot, streams changed files into the object
//! store, and feeds the streaming snapshot writer. Source-side errors are
//! tolerated per file; destination-side errors abort the run.

use crate::ignore::{normalize_path, IgnoreMatcher};
use crate::progress::{BackupProgress, ProgressSink};
use crate::snapshot::{latest_snapshot, mode_bits, FileEntry, Snapshot};
use crate::store::ObjectStore;
use crate::writer::{FlushPolicy, SnapshotWriter};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Result of a completed backup run.
#[derive(Debug, Clone, Default)]
pub struct BackupSummary {
    pub snapshot_id: String,
    pub total_files: u64,
    pub changed_files: u64,
    pub bytes_transferred: u64,
    pub scan_errors: u64,
}

/// Drives one backup run against a destination store.
pub struct BackupEngine {
    destination: PathBuf,
    flush_policy: FlushPolicy,
}

impl BackupEngine {
    pub fn new<P: AsRef<Path>>(destination: P) -> Self {
        Self {
            destination: destination.as_ref().to_path_buf(),
            flush_policy: FlushPolicy::default(),
        }
    }

    pub fn with_flush_policy(mut self, flush_policy: FlushPolicy) -> Self {
        self.flush_policy = flush_policy;
        self
    }

    /// Run a full backup of `sources`, blocking until it completes, fails,
    /// or observes cancellation. On cancellation the partial `.json.tmp`
    /// manifest is left behind and nothing is published.
    pub fn run(
        &self,
        sources: &[PathBuf],
        ignore_patterns: &[String],
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<BackupSummary> {
        fs::create_dir_all(&self.destination).map_err(|e| Error::DestinationIo {
            path: self.destination.clone(),
            source: e,
        })?;
        let destination = fs::canonicalize(&self.destination).map_err(|e| {
            Error::DestinationIo {
                path: self.destination.clone(),
                source: e,
            }
        })?;

        let mut progress = BackupProgress::with_status("Loading previous snapshot");
        sink.emit(&progress);

        // A missing or unreadable previous snapshot means a fresh backup,
        // never a failed one.
        let previous = match latest_snapshot(&destination) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Could not load previous snapshot, starting fresh: {}", e);
                progress.status = "No usable previous snapshot, starting fresh".to_string();
                sink.emit(&progress);
                None
            }
        };

        let now = Utc::now();
        let id = Snapshot::generate_id(now);
        let source_labels: Vec<String> = sources.iter().map(|s| normalize_path(s)).collect();

        let store = ObjectStore::new(&destination);
        let matcher = IgnoreMatcher::new(ignore_patterns, &destination);
        let mut writer = SnapshotWriter::open(
            &destination,
            &id,
            source_labels,
            now,
            self.flush_policy.clone(),
        )?;

        info!(
            "Starting backup {} of {} source(s) into {}",
            id,
            sources.len(),
            destination.display()
        );

        let mut summary = BackupSummary {
            snapshot_id: id.clone(),
            ..BackupSummary::default()
        };

        for source in sources {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let root = match fs::canonicalize(source) {
                Ok(root) => root,
                Err(e) => {
                    warn!("Cannot access source {}: {}", source.display(), e);
                    summary.scan_errors += 1;
                    progress.scan_errors = summary.scan_errors;
                    progress.error = Some(format!("Cannot access {}: {}", source.display(), e));
                    sink.emit(&progress);
                    continue;
                }
            };

            progress.status = format!("Scanning {}", root.display());
            sink.emit(&progress);

            self.walk_source(
                &root,
                &store,
                &matcher,
                previous.as_ref(),
                &mut writer,
                &mut summary,
                &mut progress,
                sink,
                cancel,
            )?;
        }

        progress.status = format!(
            "Saving snapshot ({}/{} files changed)",
            summary.changed_files, summary.total_files
        );
        sink.emit(&progress);

        writer.close()?;

        progress.status = "Completed".to_string();
        progress.current_file = String::new();
        sink.emit(&progress);

        info!(
            "Backup {} completed: {} files, {} changed, {} bytes transferred, {} scan errors",
            summary.snapshot_id,
            summary.total_files,
            summary.changed_files,
            summary.bytes_transferred,
            summary.scan_errors
        );

        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_source(
        &self,
        root: &Path,
        store: &ObjectStore,
        matcher: &IgnoreMatcher,
        previous: Option<&Snapshot>,
        writer: &mut SnapshotWriter,
        summary: &mut BackupSummary,
        progress: &mut BackupProgress,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(item) = walker.next() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Error reading entry under {}: {}", root.display(), e);
                    summary.scan_errors += 1;
                    progress.scan_errors = summary.scan_errors;
                    progress.error = Some(e.to_string());
                    sink.emit(progress);
                    continue;
                }
            };

            let path = entry.path();
            let file_type = entry.file_type();
            let is_dir = file_type.is_dir();

            if matcher.is_excluded(path, is_dir) {
                debug!("Excluded: {}", path.display());
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            if is_dir {
                continue;
            }

            // Policy for non-regular files: log and skip. Symlinks are not
            // followed, so a link never stands in for its target's bytes.
            if file_type.is_symlink() || !file_type.is_file() {
                debug!("Skipping non-regular file: {}", path.display());
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Cannot stat {}: {}", path.display(), e);
                    summary.scan_errors += 1;
                    progress.scan_errors = summary.scan_errors;
                    progress.error = Some(format!("Cannot stat {}: {}", path.display(), e));
                    sink.emit(progress);
                    continue;
                }
            };

            let rel_path = match path.strip_prefix(root) {
                Ok(rel) if !rel.as_os_str().is_empty() => normalize_path(rel),
                // A source that is itself a file keys on its name.
                _ => match path.file_name() {
                    Some(name) => name.to_string_lossy().into_owned(),
                    None => continue,
                },
            };

            let mod_time = match metadata.modified() {
                Ok(time) => DateTime::<Utc>::from(time),
                Err(e) => {
                    warn!("Cannot read mtime of {}: {}", path.display(), e);
                    summary.scan_errors += 1;
                    progress.scan_errors = summary.scan_errors;
                    sink.emit(progress);
                    continue;
                }
            };
            let size = metadata.len();
            let mode = mode_bits(&metadata);
            let file_name = entry.file_name().to_string_lossy().into_owned();

            summary.total_files += 1;
            progress.total_files = summary.total_files;
            progress.files_processed += 1;
            progress.total_bytes += size;
            progress.current_file = normalize_path(path);

            // rsync-style fast path: an unchanged size and mtime carries
            // the prior hash forward without reading the file.
            let carried = previous
                .and_then(|s| s.files.get(&rel_path))
                .filter(|p| p.size == size && p.mod_time == mod_time)
                .map(|p| p.hash.clone());

            let hash = match carried {
                Some(hash) => {
                    progress.status = format!("Unchanged {}", file_name);
                    progress.files_processed = progress.files_processed.saturating_sub(1);
                    sink.emit(progress);
                    hash
                }
                None => {
                    progress.status = format!("Storing {}", file_name);
                    sink.emit(progress);
                    match store.store(path, cancel) {
                        Ok(hash) => {
                            summary.changed_files += 1;
                            summary.bytes_transferred += size;
                            progress.bytes_transferred = summary.bytes_transferred;
                            hash
                        }
                        Err(e @ Error::SourceIo { .. }) => {
                            warn!("Skipping unreadable file {}: {}", path.display(), e);
                            summary.scan_errors += 1;
                            summary.total_files -= 1;
                            progress.scan_errors = summary.scan_errors;
                            progress.error = Some(e.to_string());
                            progress.total_files = summary.total_files;
                            progress.total_bytes -= size;
                            progress.files_processed = progress.files_processed.saturating_sub(1);
                            sink.emit(progress);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            writer.add(FileEntry {
                path: rel_path,
                hash,
                size,
                mode,
                mod_time,
            })?;

            sink.emit(progress);
        }

        Ok(())
    }
}
