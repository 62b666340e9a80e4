//! Streaming SHA-256 with cooperative cancellation.
//!
//! Every file read in the system funnels through [`copy_and_hash`], so
//! cancellation latency is bounded by one buffer's worth of work.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Copy buffer size. Large enough to amortize syscall cost, small enough
/// that a cancellation is observed promptly.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Streams `reader` into a rolling SHA-256 state and, when given, into
/// `writer`. The cancellation token is polled before every read and every
/// write. Returns the lowercase hex hash and the number of bytes processed.
pub fn copy_and_hash<R: Read, W: Write>(
    reader: &mut R,
    mut writer: Option<&mut W>,
    cancel: &CancellationToken,
) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut processed = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);

        if let Some(w) = writer.as_deref_mut() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            w.write_all(&buf[..n])?;
        }

        processed += n as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), processed))
}

/// Computes the content hash of the file at `path` without writing anywhere.
pub fn hash_file(path: &Path, cancel: &CancellationToken) -> Result<(String, u64)> {
    let mut file = File::open(path).map_err(|e| Error::SourceIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    copy_and_hash::<_, std::io::Sink>(&mut file, None, cancel)
}
