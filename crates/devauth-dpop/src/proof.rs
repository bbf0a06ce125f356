//! DPoP proof generation (RFC 9449-shaped, ES256 only).
//!
//! A proof is a compact JWT: `base64url(header) . base64url(payload) . base64url(signature)`.
//! Header and payload JSON MUST serialize with lexicographically sorted keys so the bytes
//! actually signed are reproducible independent of struct field declaration order.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{base64url_encode, der_to_raw_ecdsa, CodecError};
use crate::jwk::DeviceJwk;
use crate::key_store::{DeviceKeyMaterial, KeyStoreError};

/// DPoP JWT type header value, per RFC 9449.
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

/// Errors from proof construction.
#[derive(Debug, Error)]
pub enum ProofError {
    /// The device key failed to sign the proof's signing input.
    #[error("failed to sign DPoP proof: {0}")]
    SigningFailure(#[from] KeyStoreError),
    /// The DER-to-raw conversion of the produced signature failed.
    #[error("failed to encode DPoP signature: {0}")]
    SignatureEncoding(#[from] CodecError),
}

/// Sorted-key JSON for the DPoP JWT header.
#[derive(Serialize)]
struct DpopHeaderJson<'a> {
    alg: &'static str,
    jwk: &'a DeviceJwk,
    typ: &'static str,
}

/// Sorted-key JSON for the DPoP JWT payload. Field order here is alphabetical
/// (`htm`, `htu`, `iat`, `jti`, `nonce`) to match the wire contract exactly; `serde_json`
/// does not reorder object keys, so declaration order here *is* serialization order.
#[derive(Serialize)]
struct DpopPayloadJson<'a> {
    htm: &'a str,
    htu: &'a str,
    iat: i64,
    jti: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
}

/// Builds and signs DPoP proofs over a borrowed device key. Stateless apart from the
/// borrow, so it is safe to reuse concurrently: every call mints a fresh `jti`/`iat`.
#[derive(Debug)]
pub struct DpopProofBuilder<'a> {
    key: &'a DeviceKeyMaterial,
}

impl<'a> DpopProofBuilder<'a> {
    /// Borrow `key` for the lifetime of proofs built from this builder.
    #[must_use]
    pub fn new(key: &'a DeviceKeyMaterial) -> Self {
        Self { key }
    }

    /// Build and sign a compact DPoP JWT for `method`/`url`, optionally carrying `nonce`.
    pub fn proof(&self, method: &str, url: &str, nonce: Option<&str>) -> Result<String, ProofError> {
        let jti = Uuid::new_v4().to_string();
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is after the Unix epoch")
            .as_secs() as i64;

        let header = DpopHeaderJson {
            alg: "ES256",
            jwk: self.key.public_jwk(),
            typ: DPOP_JWT_TYPE,
        };
        let payload = DpopPayloadJson {
            htm: &method.to_uppercase(),
            htu: url,
            iat,
            jti: &jti,
            nonce,
        };

        let header_json = serde_json::to_vec(&header).expect("header serializes");
        let payload_json = serde_json::to_vec(&payload).expect("payload serializes");

        let header_b64 = base64url_encode(&header_json);
        let payload_b64 = base64url_encode(&payload_json);
        let signing_input = format!("{header_b64}.{payload_b64}");

        let der_signature = self.key.sign(signing_input.as_bytes())?;
        let raw_signature = der_to_raw_ecdsa(&der_signature)?;
        let signature_b64 = base64url_encode(&raw_signature);

        Ok(format!("{signing_input}.{signature_b64}"))
    }
}

/// SHA-256 of an access token, not currently part of the engine's payload (the spec's DPoP
/// payload carries no `ath` claim) but kept here as the single place token-hash logic would
/// live if a future revision of the wire contract added one.
#[must_use]
pub fn access_token_hash(token: &str) -> String {
    base64url_encode(&Sha256::digest(token.as_bytes()))
}
