//! The engine's error taxonomy.
//!
//! The engine recovers locally from exactly three conditions (a nonce challenge, a
//! provider-signaled invalid key, a server-reported "registration required"); every other
//! failure here propagates to the caller unchanged, and clears the mint-coalescing slot so
//! the next caller gets a fresh attempt rather than a cached failure.

use std::collections::HashMap;

use devauth_dpop::{CodecError, KeyStoreError};
use thiserror::Error;

/// Structured server error envelope: `{"error": "<code>", "error_description": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ServerError {
    /// Machine-readable error code, e.g. `attestation_failed`.
    pub error: String,
    /// Optional human-readable detail.
    pub error_description: Option<String>,
}

impl ServerError {
    /// True if the description contains wording indicating the device needs to (re-)register
    /// its attestation key before `/token` will accept it.
    #[must_use]
    pub fn indicates_registration_required(&self) -> bool {
        self.error == "attestation_failed"
            && self
                .error_description
                .as_deref()
                .is_some_and(|d| d.to_ascii_lowercase().contains("registration required"))
    }
}

/// The engine's unified error type.
///
/// `Clone` so a single mint failure can be replayed to every waiter coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Invalid engine input: an undecodable nonce, dev-token misuse, or a malformed config.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The device key store refused hardware-backed storage.
    #[error("secure enclave unavailable")]
    SecureEnclaveUnavailable,

    /// The attestation provider reports the platform does not support attestation at all.
    #[error("attestation unavailable on this platform")]
    AttestationUnavailable,

    /// The attestation key failed to produce a usable artifact, or registration was rejected.
    #[error("attestation failed: {0}")]
    AttestationFailed(String),

    /// A transport-level failure talking to the auth API.
    #[error("network error: {0}")]
    Network(String),

    /// A non-2xx response from the auth API that the engine did not locally recover from.
    #[error("server error: status={status}, error={server_error:?}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Parsed server error body, if the response was JSON.
        server_error: Option<ServerError>,
        /// Response headers, case-insensitively addressable by the caller.
        headers: HashMap<String, String>,
    },

    /// The server's response body did not match the expected schema.
    #[error("failed to decode server response: {0}")]
    Decoding(String),

    /// The server's response lacked the expected framing (e.g. non-JSON body on a 2xx).
    #[error("invalid response framing")]
    InvalidResponse,

    /// A bearer token was requested before any mint ever succeeded.
    #[error("no access token has been minted yet")]
    TokenMissing,
}

impl From<CodecError> for EngineError {
    fn from(e: CodecError) -> Self {
        EngineError::Configuration(e.to_string())
    }
}

impl From<KeyStoreError> for EngineError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::SecureEnclaveUnavailable { .. } => EngineError::SecureEnclaveUnavailable,
            KeyStoreError::SigningFailure { reason } => EngineError::AttestationFailed(reason),
            KeyStoreError::CorruptKeyMaterial { reason } => EngineError::Configuration(reason),
        }
    }
}

impl From<devauth_dpop::ProofError> for EngineError {
    fn from(e: devauth_dpop::ProofError) -> Self {
        EngineError::AttestationFailed(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Network(e.to_string())
    }
}
