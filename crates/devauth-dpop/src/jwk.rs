//! The device's public JWK and its canonical serialization.
//!
//! The canonical form is part of the wire contract (§9 of the design notes): both the
//! thumbprint and the client-data hash derive from the exact byte sequence
//! `{"crv":"P-256","kty":"EC","x":"<x>","y":"<y>"}`, members in that literal order, no
//! whitespace, regardless of what a JSON library would emit by default.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::base64url_encode;

/// A P-256 public key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl DeviceJwk {
    /// Build a JWK from the 32-byte x/y coordinates of a P-256 public key.
    #[must_use]
    pub fn from_coordinates(x: &[u8; 32], y: &[u8; 32]) -> Self {
        Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: base64url_encode(x),
            y: base64url_encode(y),
        }
    }

    /// The exact byte sequence `{"crv":"P-256","kty":"EC","x":"<x>","y":"<y>"}`.
    ///
    /// Hand-assembled rather than delegated to `serde_json` so that member order and the
    /// absence of whitespace are guaranteed regardless of the JSON library's defaults.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        )
        .into_bytes()
    }

    /// base64url(SHA-256(canonical JWK bytes)).
    #[must_use]
    pub fn thumbprint(&self) -> String {
        let digest = Sha256::digest(self.canonical_bytes());
        base64url_encode(&digest)
    }
}
