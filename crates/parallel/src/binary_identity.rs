use std::path::PathBuf;
use std::sync::OnceLock;

use parallel_core::ParallelError;

static CACHED_HASH: OnceLock<[u8; 16]> = OnceLock::new();

/// Locates the absolute path of the currently running executable.
pub fn locate() -> Result<PathBuf, ParallelError> {
    std::env::current_exe()
        .and_then(|path| path.canonicalize())
        .map_err(|err| ParallelError::BinaryNotLocatable(err.to_string()))
}

/// Returns the MD5 digest of the current executable's contents, computing
/// it once and caching the result for the lifetime of the process — the
/// binary never changes under a running process, so repeated hashing (once
/// per spawn) would be pure waste.
pub fn hash() -> Result<[u8; 16], ParallelError> {
    if let Some(cached) = CACHED_HASH.get() {
        return Ok(*cached);
    }

    let path = locate()?;
    let bytes = std::fs::read(&path).map_err(|err| ParallelError::BinaryReadFailed(err.to_string()))?;
    let digest = md5::compute(&bytes).0;

    // A racing concurrent call may have already written the cache; either
    // value is correct since both read the same on-disk file.
    Ok(*CACHED_HASH.get_or_init(|| digest))
}

/// Hex-encodes a digest for logging and for the `PARALLEL_BINARY_MD5` env var.
pub fn hash_hex() -> Result<String, ParallelError> {
    Ok(hex::encode(hash()?))
}

/// Parses a hex-encoded digest received from a peer's handshake.
pub fn parse_hash_hex(s: &str) -> Result<[u8; 16], ParallelError> {
    let bytes = hex::decode(s)
        .map_err(|err| ParallelError::BinaryMismatch {
            expected: "16-byte md5 hex string".to_string(),
            actual: format!("{s} ({err})"),
        })?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| ParallelError::BinaryMismatch {
            expected: "16 bytes".to_string(),
            actual: format!("{} bytes", bytes.len()),
        })
}
