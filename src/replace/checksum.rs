//! SHA-256 comparison of installed artifacts.

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Compute the SHA-256 checksum of a file as `sha256:<hex>`.
pub async fn compute_sha256(file_path: &Path) -> Result<String> {
    debug!("Computing SHA256 checksum for: {}", file_path.display());

    let contents = fs::read(file_path)
        .await
        .with_context(|| format!("Failed to read file: {}", file_path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Fail unless `file_path` hashes to `expected` (case-insensitive).
pub async fn verify_checksum(file_path: &Path, expected: &str) -> Result<()> {
    let actual = compute_sha256(file_path).await?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!("Checksum mismatch for {}\n  Expected: {expected}\n  Actual:   {actual}", file_path.display());
    }
    debug!("Checksum verified for {}", file_path.display());
    Ok(())
}
