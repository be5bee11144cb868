use std::fmt::Write as _;

use sha2::{Digest, Sha256};

/// SHA-256 of raw bytes, lowercase hex. Content hashes must be stable
/// across releases; a change of algorithm requires bumping the cache
/// schema version.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}
