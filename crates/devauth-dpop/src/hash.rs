//! SHA-256 hashing helpers, including the App Attest client-data hash.

use sha2::{Digest, Sha256};

/// `SHA256( nonce ‖ SHA256(canonical_jwk) )`, the value signed by the attestation key.
#[must_use]
pub fn client_data_hash(nonce: &[u8], canonical_jwk_bytes: &[u8]) -> [u8; 32] {
    let jwk_digest = Sha256::digest(canonical_jwk_bytes);
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(jwk_digest);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_vector() {
        let canonical = br#"{"crv":"P-256","kty":"EC","x":"abc","y":"def"}"#;
        let expected = {
            let jwk_digest = Sha256::digest(canonical);
            let mut hasher = Sha256::new();
            hasher.update(b"nonce");
            hasher.update(jwk_digest);
            hasher.finalize()
        };
        assert_eq!(client_data_hash(b"nonce", canonical), expected.as_slice());
    }

    #[test]
    fn is_defined_over_arbitrary_inputs() {
        let a = client_data_hash(b"n1", b"jwk1");
        let b = client_data_hash(b"n2", b"jwk1");
        assert_ne!(a, b, "different nonces must produce different hashes");
    }
}
