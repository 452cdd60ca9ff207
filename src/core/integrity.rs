/// Download integrity verification (spec §4.3, §7 `Integrity`).
use md5::{Digest, Md5};

/// Computes the lowercase hex MD5 digest of `bytes`.
pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Verifies that the assembled bytes match the declared MD5, when one was
/// supplied in the manifest (§4.3 "MD5 verification is optional").
pub fn verify_md5(bytes: &[u8], expected: &str) -> bool {
    md5_hex(bytes).eq_ignore_ascii_case(expected)
}

/// Verifies bulk completion bookkeeping: every chunk landed and the byte
/// count matches, independent of content hashing.
pub fn verify_completion(
    downloaded_bytes: u64,
    total_size: u64,
    chunks_present: usize,
    total_chunks: u64,
) -> bool {
    downloaded_bytes == total_size && chunks_present as u64 == total_chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_matches_known_vector() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn verify_md5_is_case_insensitive() {
        assert!(verify_md5(b"hello", "5D41402ABC4B2A76B9719D911017C592"));
        assert!(!verify_md5(b"hello", "deadbeef"));
    }

    #[test]
    fn verify_completion_requires_both_conditions() {
        assert!(verify_completion(100, 100, 4, 4));
        assert!(!verify_completion(90, 100, 4, 4));
        assert!(!verify_completion(100, 100, 3, 4));
    }
}
