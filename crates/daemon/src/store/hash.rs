// Index content hashing for change detection.
//
// The store remembers the digest of the last bytes it wrote or absorbed so
// the reconciler can skip passes triggered by this process's own writes.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 hash of index content.
pub type ContentHash = String;

/// Compute the SHA-256 hash of the given bytes, returned as a lowercase hex string.
pub fn sha256_hex(content: &[u8]) -> ContentHash {
    let digest = Sha256::digest(content);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
