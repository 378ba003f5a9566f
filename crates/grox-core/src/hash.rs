//! Content hashing for deduplicated indexing.

use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a content hash (128 bits).
const HASH_BYTES: usize = 16;

/// Stable identity key for a text snippet.
///
/// The text is trimmed and lowercased before hashing, so snippets that
/// differ only in surrounding whitespace or case share one key. Returns
/// 32 lowercase hex characters.
pub fn content_hash(text: &str) -> String {
    let normalized = text.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..HASH_BYTES])
}
