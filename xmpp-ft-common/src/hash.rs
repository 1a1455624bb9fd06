//! File content hashing
//!
//! Offers may advertise a content hash for the file. Once a receive
//! finishes the file on disk is hashed and compared. Hashing runs under
//! `spawn_blocking` with a 1MB buffer so the service loop is never stalled
//! by a large file.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::HASH_BUFFER_SIZE;

/// Hash algorithm names as they appear on the wire
pub const ALGO_SHA256: &str = "sha-256";

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LENGTH: usize = 64;

/// Result of comparing a received file against an advertised hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheck {
    Match,
    Mismatch,
    /// Algorithm not supported here, file is accepted unchecked
    Unsupported,
}

/// Compute SHA-256 hash of an entire file
///
/// Runs on a blocking thread pool to avoid blocking async workers.
pub async fn compute_sha256(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_sha256_sync(&path))
        .await
        .map_err(|e| io::Error::other(format!("hash task failed: {e}")))?
}

/// Compute SHA-256 hash of an entire file (blocking)
pub fn compute_sha256_sync(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file against an advertised hash
///
/// Without an explicit `algo` the digest length decides: 64 hex digits is
/// SHA-256, anything else (the MD5 of plain SI offers) is left unchecked.
/// Comparison ignores hex case.
pub async fn verify_file_hash(
    path: &Path,
    algo: Option<&str>,
    expected: &str,
) -> io::Result<HashCheck> {
    let supported = match algo {
        Some(algo) => algo.eq_ignore_ascii_case(ALGO_SHA256),
        None => expected.trim().len() == SHA256_HEX_LENGTH,
    };
    if !supported {
        return Ok(HashCheck::Unsupported);
    }
    let actual = compute_sha256(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(HashCheck::Match)
    } else {
        Ok(HashCheck::Mismatch)
    }
}
