//! Archive checksum computation and validation.
//!
//! Checksums are hex SHA-256 over the stored archive bytes. Validation is
//! pure and read-only; a missing archive is an outcome, not an error, so
//! batch audits can continue past one bad record.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Mismatch { actual: String },
    MissingFile,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Streaming file checksum; never loads the whole archive into memory.
pub fn checksum_file_sync(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub async fn checksum_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    let checksum = tokio::task::spawn_blocking(move || checksum_file_sync(&path))
        .await
        .map_err(anyhow::Error::new)??;
    Ok(checksum)
}

/// Recompute and compare an archive's checksum.
pub async fn validate(archive_path: &Path, expected_checksum: &str) -> Result<ValidationOutcome> {
    if !archive_path.exists() {
        return Ok(ValidationOutcome::MissingFile);
    }
    let actual = checksum_file(archive_path).await?;
    if actual.eq_ignore_ascii_case(expected_checksum) {
        Ok(ValidationOutcome::Valid)
    } else {
        Ok(ValidationOutcome::Mismatch { actual })
    }
}
