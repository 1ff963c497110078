//! Checksums for migration sources and the advisory lock key

use sha2::{Digest, Sha256};

/// Name every migrator instance hashes to find the shared advisory lock
pub const LOCK_NAME: &str = "lockstep";

/// Calculate the hex SHA-256 of a migration's source text
///
/// Stored with each applied migration so later runs can detect that a file was
/// edited after deployment.
pub fn calculate_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Checksum of a migration split across an up file and an optional down file
///
/// Equal to [`calculate_checksum`] of the up text when there is no down file,
/// so editing either file of an applied migration changes it.
pub fn calculate_pair_checksum(up: &[u8], down: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(up);
    if let Some(down) = down {
        hasher.update([0u8]);
        hasher.update(down);
    }
    format!("{:x}", hasher.finalize())
}

/// Fixed advisory lock identifier shared by every migrator process
///
/// The first eight bytes of `SHA-256("lockstep")`, read big-endian.
pub fn advisory_lock_key() -> i64 {
    let digest = Sha256::digest(LOCK_NAME.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
