use sha2::{Digest, Sha256};

/// Computes a deterministic SHA-256 digest over a serialized payload.
///
/// The digest is taken over the exact bytes that were written to the blob
/// store, so any post-write corruption or tampering shows up as a mismatch
/// when the payload is re-read and re-hashed.
pub fn payload_checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest = hasher.finalize();
    hex::encode(digest)
}
