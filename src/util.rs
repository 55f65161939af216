use std::{
    io::{Result, Write},
    path::Path,
};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Hex-encoded SHA-1 of the given bytes.  This is the leaf digest of the Merkle tree.
pub(crate) fn sha1_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha1(data))
}

/// Hex-encoded SHA-256 over the concatenation of two hex strings.
///
/// Parent and chain digests are computed over the *text* of the two child digests, not their
/// binary values.
pub(crate) fn sha256_concat(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Atomically replace the contents of `path`.
///
/// The data is written to a temporary file in the same directory, synced, and renamed over the
/// target, so readers see either the old document or the new one.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
