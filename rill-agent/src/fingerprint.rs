//! Content fingerprints used as the idempotency key of stored records.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// Base64 encoded SHA-256 digest of the raw record contents.
///
/// Two records with byte-identical contents always map to the same fingerprint,
/// which is what the store's unique index relies on when the live tail and the
/// reconciliation path deliver the same line.
pub fn fingerprint(contents: &str) -> String {
    STANDARD.encode(Sha256::digest(contents.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_contents_hash_matches_known_digest() {
        assert_eq!(
            fingerprint(""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn identical_contents_share_a_fingerprint() {
        let line = "Mar  1 11:37:20 jabbah2 EP 11:37:20.272 0322 0 tDCCli DC_P2P connected";
        assert_eq!(fingerprint(line), fingerprint(line));
    }

    #[test]
    fn whitespace_changes_the_fingerprint() {
        assert_ne!(fingerprint("a b"), fingerprint("a  b"));
    }
}
