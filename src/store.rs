//! Content-addressed object storage.
//!
//! Objects are keyed by the SHA-256 of their content and live under
//! `objects/<aa>/<bb>/<hash>`. The two-level fan-out keeps directory sizes
//! tolerable on filesystems that degrade with large directories.

use crate::copier::copy_and_hash;
use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A content-addressed object store rooted at a destination directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path for an object. Hashes shorter than four characters
    /// fall back to a flat `objects/<hash>` layout.
    pub fn object_path(&self, hash: &str) -> PathBuf {
        let objects = self.root.join("objects");
        if hash.len() < 4 {
            return objects.join(hash);
        }
        objects.join(&hash[0..2]).join(&hash[2..4]).join(hash)
    }

    /// Check whether an object with this hash is already present.
    pub fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).exists()
    }

    /// Store the content of the file at `source`, returning its hash.
    /// Re-storing existing content is a no-op.
    pub fn store(&self, source: &Path, cancel: &CancellationToken) -> Result<String> {
        let mut file = File::open(source).map_err(|e| Error::SourceIo {
            path: source.to_path_buf(),
            source: e,
        })?;

        // First pass: hash only. Failures here are source-side.
        let (hash, _) = copy_and_hash::<_, std::io::Sink>(&mut file, None, cancel).map_err(
            |e| match e {
                Error::Io(io) => Error::SourceIo {
                    path: source.to_path_buf(),
                    source: io,
                },
                other => other,
            },
        )?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let object_path = self.object_path(&hash);
        if object_path.exists() {
            debug!("Object {} already stored", hash);
            return Ok(hash);
        }

        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::DestinationIo {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        file.seek(SeekFrom::Start(0)).map_err(|e| Error::SourceIo {
            path: source.to_path_buf(),
            source: e,
        })?;

        // Write to a sibling temp name and rename so a concurrent reader
        // never observes a partial object.
        let temp_path = object_path.with_extension(format!("tmp.{}", std::process::id()));
        let mut temp = File::create(&temp_path).map_err(|e| Error::DestinationIo {
            path: temp_path.clone(),
            source: e,
        })?;

        // The source streamed fully during the hashing pass, so copy
        // failures here are attributed to the destination.
        let copied = copy_and_hash(&mut file, Some(&mut temp), cancel)
            .and_then(|_| {
                temp.sync_all().map_err(|e| Error::DestinationIo {
                    path: temp_path.clone(),
                    source: e,
                })
            })
            .map_err(|e| match e {
                Error::Io(io) => Error::DestinationIo {
                    path: temp_path.clone(),
                    source: io,
                },
                other => other,
            });

        if let Err(e) = copied {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        drop(temp);

        fs::rename(&temp_path, &object_path).map_err(|e| Error::DestinationIo {
            path: object_path.clone(),
            source: e,
        })?;

        debug!("Stored object {}", hash);
        Ok(hash)
    }

    /// Open a stored object for reading.
    pub fn retrieve(&self, hash: &str) -> Result<File> {
        let path = self.object_path(hash);
        File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ObjectNotFound {
                    hash: hash.to_string(),
                }
            } else {
                Error::Io(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    const HI_SHA256: &str = "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4";

    fn object_count(root: &Path) -> usize {
        WalkDir::new(root.join("objects"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_store_and_retrieve() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"hi")?;

        let store = ObjectStore::new(temp_dir.path().join("dest"));
        let hash = store.store(&source, &CancellationToken::new())?;
        assert_eq!(hash, HI_SHA256);
        assert!(store.contains(&hash));

        let mut content = String::new();
        store.retrieve(&hash)?.read_to_string(&mut content)?;
        assert_eq!(content, "hi");
        Ok(())
    }

    #[test]
    fn test_store_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"hi")?;

        let dest = temp_dir.path().join("dest");
        let store = ObjectStore::new(&dest);
        let first = store.store(&source, &CancellationToken::new())?;
        let second = store.store(&source, &CancellationToken::new())?;

        assert_eq!(first, second);
        assert_eq!(object_count(&dest), 1);
        Ok(())
    }

    #[test]
    fn test_object_path_fan_out() {
        let store = ObjectStore::new("/dest");
        let hash = "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4";
        assert_eq!(
            store.object_path(hash),
            PathBuf::from("/dest/objects/8f/43").join(hash)
        );
    }

    #[test]
    fn test_object_path_degenerate_short_hash() {
        let store = ObjectStore::new("/dest");
        assert_eq!(store.object_path("abc"), PathBuf::from("/dest/objects/abc"));
    }

    #[test]
    fn test_retrieve_missing_object() {
        let temp_dir = TempDir::new().unwrap();
        let store = ObjectStore::new(temp_dir.path());
        let result = store.retrieve("0000000000000000000000000000000000000000000000000000000000000000");
        assert!(matches!(result, Err(Error::ObjectNotFound { .. })));
    }

    #[test]
    fn test_store_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let store = ObjectStore::new(temp_dir.path().join("dest"));
        let result = store.store(&temp_dir.path().join("nope"), &CancellationToken::new());
        assert!(matches!(result, Err(Error::SourceIo { .. })));
    }

    #[test]
    fn test_cancelled_store_leaves_no_object() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"hi")?;

        let dest = temp_dir.path().join("dest");
        let store = ObjectStore::new(&dest);
        let token = CancellationToken::new();
        token.cancel();

        let result = store.store(&source, &token);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!dest.join("objects").exists());
        Ok(())
    }
}
