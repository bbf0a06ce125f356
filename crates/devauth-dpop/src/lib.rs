//! Device-bound P-256 keys and DPoP (RFC 9449-shaped) proof generation.
//!
//! ## Architecture
//!
//! - `codec` — base64url and DER-to-raw ECDSA signature conversion
//! - `hash` — SHA-256 helpers, including the App Attest client-data hash
//! - `jwk` — the device's public JWK and its canonical, byte-exact serialization
//! - `key_store` — load-or-create a hardware-backed P-256 keypair
//! - `proof` — DPoP proof construction over a borrowed device key
//!
//! This crate only builds proofs; deciding *when* to attach a nonce, when to mint a new
//! access token, and how to recover from server challenges is the job of the session
//! engine crate that sits above this one.

pub mod codec;
pub mod hash;
pub mod jwk;
pub mod key_store;
pub mod proof;

pub use codec::{base64url_decode, base64url_encode, decode_nonce_lenient, der_to_raw_ecdsa, CodecError};
pub use hash::client_data_hash;
pub use jwk::DeviceJwk;
pub use key_store::{
    DefaultDeviceKeyStore, DeviceKeyMaterial, DeviceKeyStore, KeyPersistence, KeyStoreError,
    OsCredentialStore, SigningHandle, SoftwareSigningHandle,
};
pub use proof::{DpopProofBuilder, ProofError, DPOP_JWT_TYPE};
