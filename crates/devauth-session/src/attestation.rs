//! Platform attestation capability.
//!
//! [`AttestationProvider`] is a thin state-tracking shell over a host-supplied
//! [`AttestationBackend`] that performs the actual platform calls (App Attest, Play
//! Integrity, or equivalent) — that FFI seam is out of scope here. The engine depends only
//! on the capability, never on which backend is behind it, so it is fully testable without
//! the platform SDK.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// A stored attestation key id plus whether it has completed server-side registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationKeyRecord {
    pub key_id: String,
    pub attested: bool,
}

/// Failure signals the provider MUST distinguish so the engine can recover.
#[derive(Debug, Error)]
pub enum AttestationError {
    /// The key id exists but has not completed registration with the server yet.
    #[error("attestation key is not attested yet")]
    NotAttested,
    /// The platform reports the stored key id is no longer usable.
    #[error("attestation key is no longer valid")]
    InvalidKey,
    /// The platform/runtime cannot perform attestation at all.
    #[error("attestation is unavailable on this platform")]
    Unavailable,
    /// Any other backend failure.
    #[error("attestation operation failed: {0}")]
    Failed(String),
}

/// Host-supplied seam performing the actual platform attestation calls. The engine never
/// talks to App Attest / Play Integrity directly; it talks to this trait.
#[async_trait]
pub trait AttestationBackend: Send + Sync {
    /// Whether this backend can produce attestation at all on the current runtime.
    fn is_supported(&self) -> bool;

    /// Generate a new platform key id. Does not mark it attested.
    async fn generate_key_id(&self) -> Result<String, AttestationError>;

    /// Produce a one-time attestation blob binding `key_id` to `client_data_hash`.
    async fn attest(&self, key_id: &str, client_data_hash: &[u8]) -> Result<Vec<u8>, AttestationError>;

    /// Produce a fresh assertion blob binding `key_id` to `client_data_hash`.
    async fn generate_assertion(&self, key_id: &str, client_data_hash: &[u8]) -> Result<Vec<u8>, AttestationError>;
}

/// Backend that always reports attestation as unavailable: the default for platforms with
/// no attestation primitive at all (and the base for the development-token path).
#[derive(Debug, Default)]
pub struct UnsupportedAttestationBackend;

#[async_trait]
impl AttestationBackend for UnsupportedAttestationBackend {
    fn is_supported(&self) -> bool {
        false
    }

    async fn generate_key_id(&self) -> Result<String, AttestationError> {
        Err(AttestationError::Unavailable)
    }

    async fn attest(&self, _key_id: &str, _client_data_hash: &[u8]) -> Result<Vec<u8>, AttestationError> {
        Err(AttestationError::Unavailable)
    }

    async fn generate_assertion(&self, _key_id: &str, _client_data_hash: &[u8]) -> Result<Vec<u8>, AttestationError> {
        Err(AttestationError::Unavailable)
    }
}

/// Tracks the local attestation key lifecycle (`absent → generated → attested`) over a
/// host-supplied [`AttestationBackend`].
pub struct AttestationProvider {
    backend: Arc<dyn AttestationBackend>,
    record: Mutex<Option<AttestationKeyRecord>>,
}

impl AttestationProvider {
    #[must_use]
    pub fn new(backend: Arc<dyn AttestationBackend>) -> Self {
        Self {
            backend,
            record: Mutex::new(None),
        }
    }

    /// Whether this process/runtime can produce attestation at all. The engine's
    /// development-token gate reads this instead of inspecting the platform itself.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.backend.is_supported()
    }

    /// Return the stored key id, generating one via the backend if none exists yet. Never
    /// marks the key as attested.
    pub async fn ensure_key_id(&self) -> Result<String, AttestationError> {
        let mut guard = self.record.lock().await;
        if let Some(record) = guard.as_ref() {
            return Ok(record.key_id.clone());
        }
        let key_id = self.backend.generate_key_id().await?;
        *guard = Some(AttestationKeyRecord {
            key_id: key_id.clone(),
            attested: false,
        });
        Ok(key_id)
    }

    /// Produce a one-time attestation blob. Called at most once per key id over its
    /// lifetime by the engine's registration sub-flow.
    pub async fn attest(&self, key_id: &str, client_data_hash: &[u8]) -> Result<Vec<u8>, AttestationError> {
        self.backend.attest(key_id, client_data_hash).await
    }

    /// Record locally that `key_id` has completed server-side registration.
    pub async fn mark_attested(&self, key_id: &str) {
        let mut guard = self.record.lock().await;
        if let Some(record) = guard.as_mut() {
            if record.key_id == key_id {
                record.attested = true;
            }
        }
    }

    /// Produce a fresh assertion bound to `client_data_hash`. If the locally stored record
    /// is not yet attested, surfaces [`AttestationError::NotAttested`] without calling the
    /// backend, so the engine can register before retrying.
    pub async fn generate_assertion(&self, key_id: &str, client_data_hash: &[u8]) -> Result<Vec<u8>, AttestationError> {
        let attested = {
            let guard = self.record.lock().await;
            guard.as_ref().is_some_and(|r| r.key_id == key_id && r.attested)
        };
        if !attested {
            return Err(AttestationError::NotAttested);
        }
        self.backend.generate_assertion(key_id, client_data_hash).await
    }

    /// Delete the stored key id, returning the state machine to `absent`.
    pub async fn clear(&self) {
        let mut guard = self.record.lock().await;
        *guard = None;
    }
}

/// In-memory [`AttestationBackend`] test double with deterministic, scriptable behavior for
/// the engine's own test suite.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support {
    use super::{AttestationBackend, AttestationError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// How many times `generate_assertion` should report `InvalidKey` before succeeding.
    #[derive(Debug, Default)]
    pub struct TestAttestationBackend {
        supported: std::sync::atomic::AtomicBool,
        invalid_key_signals_remaining: AtomicUsize,
        key_counter: AtomicU64,
        attest_calls: AtomicUsize,
        assertion_calls: AtomicUsize,
        generated_key_ids: Mutex<Vec<String>>,
    }

    impl TestAttestationBackend {
        #[must_use]
        pub fn new() -> Self {
            Self {
                supported: std::sync::atomic::AtomicBool::new(true),
                invalid_key_signals_remaining: AtomicUsize::new(0),
                key_counter: AtomicU64::new(0),
                attest_calls: AtomicUsize::new(0),
                assertion_calls: AtomicUsize::new(0),
                generated_key_ids: Mutex::new(Vec::new()),
            }
        }

        /// Build a backend that reports itself as unsupported (simulator/emulator path).
        #[must_use]
        pub fn unsupported() -> Self {
            let backend = Self::new();
            backend.supported.store(false, Ordering::SeqCst);
            backend
        }

        /// The next `count` calls to `generate_assertion` fail with `InvalidKey`.
        pub fn fail_next_assertions_with_invalid_key(&self, count: usize) {
            self.invalid_key_signals_remaining.store(count, Ordering::SeqCst);
        }

        #[must_use]
        pub fn attest_call_count(&self) -> usize {
            self.attest_calls.load(Ordering::SeqCst)
        }

        #[must_use]
        pub fn assertion_call_count(&self) -> usize {
            self.assertion_calls.load(Ordering::SeqCst)
        }

        #[must_use]
        pub fn generated_key_ids(&self) -> Vec<String> {
            self.generated_key_ids.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttestationBackend for TestAttestationBackend {
        fn is_supported(&self) -> bool {
            self.supported.load(Ordering::SeqCst)
        }

        async fn generate_key_id(&self) -> Result<String, AttestationError> {
            let n = self.key_counter.fetch_add(1, Ordering::SeqCst);
            let key_id = format!("test-key-{n}");
            self.generated_key_ids.lock().unwrap().push(key_id.clone());
            Ok(key_id)
        }

        async fn attest(&self, _key_id: &str, _client_data_hash: &[u8]) -> Result<Vec<u8>, AttestationError> {
            self.attest_calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"test-attestation-blob".to_vec())
        }

        async fn generate_assertion(&self, _key_id: &str, _client_data_hash: &[u8]) -> Result<Vec<u8>, AttestationError> {
            self.assertion_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.invalid_key_signals_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.invalid_key_signals_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(AttestationError::InvalidKey);
            }
            Ok(b"test-assertion-blob".to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestAttestationBackend;
    use super::*;

    #[tokio::test]
    async fn ensure_key_id_generates_once_and_reuses() {
        let provider = AttestationProvider::new(Arc::new(TestAttestationBackend::new()));
        let a = provider.ensure_key_id().await.unwrap();
        let b = provider.ensure_key_id().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn generate_assertion_before_registration_reports_not_attested() {
        let provider = AttestationProvider::new(Arc::new(TestAttestationBackend::new()));
        let key_id = provider.ensure_key_id().await.unwrap();
        let err = provider.generate_assertion(&key_id, b"cdh").await.unwrap_err();
        assert!(matches!(err, AttestationError::NotAttested));
    }

    #[tokio::test]
    async fn mark_attested_unblocks_assertion_generation() {
        let provider = AttestationProvider::new(Arc::new(TestAttestationBackend::new()));
        let key_id = provider.ensure_key_id().await.unwrap();
        provider.mark_attested(&key_id).await;
        assert!(provider.generate_assertion(&key_id, b"cdh").await.is_ok());
    }

    #[tokio::test]
    async fn clear_resets_to_absent() {
        let provider = AttestationProvider::new(Arc::new(TestAttestationBackend::new()));
        let first = provider.ensure_key_id().await.unwrap();
        provider.mark_attested(&first).await;
        provider.clear().await;
        let second = provider.ensure_key_id().await.unwrap();
        assert_ne!(first, second);
        let err = provider.generate_assertion(&second, b"cdh").await.unwrap_err();
        assert!(matches!(err, AttestationError::NotAttested));
    }

    #[tokio::test]
    async fn unsupported_backend_reports_is_supported_false() {
        let provider = AttestationProvider::new(Arc::new(TestAttestationBackend::unsupported()));
        assert!(!provider.is_supported());
    }
}
