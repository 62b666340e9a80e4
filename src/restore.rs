//! Restore functionality for reconstructing files from snapshots.
//!
//! Restoring is deliberately conservative: a target file whose content
//! already matches the manifest entry is left untouched, and a missing
//! object fails that file without aborting the rest of the pass.

use crate::copier::{copy_and_hash, hash_file};
use crate::ignore::IgnoreMatcher;
use crate::snapshot::Snapshot;
use crate::store::ObjectStore;
use crate::{Error, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for restore operations
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Restore each file's recorded modification time.
    pub preserve_mod_times: bool,
    /// Restore each file's recorded permission bits (unix only).
    pub preserve_permissions: bool,
    /// Manifest entries matching these patterns are not restored.
    pub ignore_patterns: Vec<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            preserve_mod_times: true,
            preserve_permissions: true,
            ignore_patterns: Vec::new(),
        }
    }
}

/// Outcome of a restore pass.
#[derive(Debug, Clone, Default)]
pub struct RestoreSummary {
    pub total_files: u64,
    pub files_restored: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub bytes_copied: u64,
}

/// Reconstructs files from a snapshot against an object store.
pub struct RestoreEngine {
    store: ObjectStore,
}

impl RestoreEngine {
    /// `store_root` is the backup destination the snapshot was written to.
    pub fn new<P: AsRef<Path>>(store_root: P) -> Self {
        Self {
            store: ObjectStore::new(store_root),
        }
    }

    /// Restore every manifest entry into `target`, skipping files whose
    /// content already matches.
    pub fn restore(
        &self,
        snapshot: &Snapshot,
        target: &Path,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreSummary> {
        let matcher = IgnoreMatcher::new(&options.ignore_patterns, self.store.root());
        let mut summary = RestoreSummary::default();

        info!(
            "Restoring snapshot {} ({} files) into {}",
            snapshot.id,
            snapshot.files.len(),
            target.display()
        );

        for (rel_path, entry) in &snapshot.files {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if matcher.is_excluded(Path::new(rel_path), false) {
                debug!("Not restoring excluded entry {}", rel_path);
                continue;
            }
            summary.total_files += 1;

            let target_path = join_relative(target, rel_path);

            // Skip content that is already in place.
            if target_path.exists() {
                match hash_file(&target_path, cancel) {
                    Ok((hash, _)) if hash == entry.hash => {
                        debug!("Skipping identical file {}", rel_path);
                        summary.files_skipped += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        debug!("Could not hash existing {}: {}", rel_path, e);
                    }
                }
            }

            match self.restore_file(entry.hash.as_str(), &target_path, entry, options, cancel) {
                Ok(bytes) => {
                    summary.files_restored += 1;
                    summary.bytes_copied += bytes;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("Failed to restore {}: {}", rel_path, e);
                    summary.files_failed += 1;
                }
            }
        }

        info!(
            "Restore of {} finished: {} restored, {} skipped, {} failed",
            snapshot.id, summary.files_restored, summary.files_skipped, summary.files_failed
        );
        Ok(summary)
    }

    fn restore_file(
        &self,
        hash: &str,
        target_path: &Path,
        entry: &crate::snapshot::FileEntry,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut object = self.store.retrieve(hash)?;

        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = File::create(target_path)?;
        let (_, bytes) = copy_and_hash(&mut object, Some(&mut file), cancel)?;

        #[cfg(unix)]
        if options.preserve_permissions {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(target_path, fs::Permissions::from_mode(entry.mode))?;
        }

        if options.preserve_mod_times {
            file.set_modified(entry.mod_time.into())?;
        }

        Ok(bytes)
    }
}

/// Join a forward-slash relative manifest path onto a target root.
fn join_relative(target: &Path, rel_path: &str) -> PathBuf {
    let mut path = target.to_path_buf();
    for component in rel_path.split('/') {
        path.push(component);
    }
    path
}
