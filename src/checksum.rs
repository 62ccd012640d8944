//! Content checksums
//!
//! Archive checksums are lowercase hex SHA-256 digests.

use std::path::Path;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::Result;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Checksum of an in-memory buffer
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Checksum of a file, streamed from disk
pub async fn file_checksum(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
