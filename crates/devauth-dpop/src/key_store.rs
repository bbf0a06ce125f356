//! Device keypair management: load-or-create a P-256 signing key in a hardware-backed
//! key store, and expose a signing handle plus derived public JWK.

use std::sync::Arc;

use async_trait::async_trait;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::jwk::DeviceJwk;

/// Errors from the device key store.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// The platform refused hardware-backed storage for the key.
    #[error("hardware-backed key storage unavailable: {reason}")]
    SecureEnclaveUnavailable {
        /// Platform-reported reason, if any.
        reason: String,
    },
    /// The signing handle failed to produce a signature.
    #[error("signing operation failed: {reason}")]
    SigningFailure {
        /// What went wrong, as reported by the signing backend.
        reason: String,
    },
    /// Persisted key material could not be parsed.
    #[error("stored key material is corrupt: {reason}")]
    CorruptKeyMaterial {
        /// Decoding/parsing failure detail.
        reason: String,
    },
}

/// A signing handle over a device-bound private key. The handle never exposes the raw
/// private scalar; it only signs bytes on request.
///
/// Production deployments substitute a Secure Enclave / StrongBox-backed implementation of
/// this trait; the crate ships [`SoftwareSigningHandle`] as the in-process default.
pub trait SigningHandle: Send + Sync + std::fmt::Debug {
    /// Sign `message` and return a DER-encoded ECDSA signature.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyStoreError>;

    /// The uncompressed SEC1 public key (`0x04 ‖ x ‖ y`, 65 bytes for P-256).
    fn public_key_sec1(&self) -> [u8; 65];
}

/// In-process P-256 signing key, zeroized on drop. Stands in for a hardware-backed handle
/// when no platform secure-element binding is wired up.
#[derive(Debug)]
pub struct SoftwareSigningHandle {
    signing_key: SigningKey,
}

impl SoftwareSigningHandle {
    fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    fn from_pkcs8_der(der: &[u8]) -> Result<Self, KeyStoreError> {
        let signing_key = SigningKey::from_pkcs8_der(der).map_err(|e| KeyStoreError::CorruptKeyMaterial {
            reason: e.to_string(),
        })?;
        Ok(Self { signing_key })
    }

    fn to_pkcs8_der(&self) -> Result<Vec<u8>, KeyStoreError> {
        use p256::pkcs8::EncodePrivateKey;
        self.signing_key
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| KeyStoreError::CorruptKeyMaterial { reason: e.to_string() })
    }
}

impl SigningHandle for SoftwareSigningHandle {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let signature: Signature = self.signing_key.try_sign(message).map_err(|e| KeyStoreError::SigningFailure {
            reason: e.to_string(),
        })?;
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn public_key_sec1(&self) -> [u8; 65] {
        let verifying_key: VerifyingKey = VerifyingKey::from(&self.signing_key);
        let point = verifying_key.to_encoded_point(false);
        let mut out = [0u8; 65];
        out.copy_from_slice(point.as_bytes());
        out
    }
}

impl Drop for SoftwareSigningHandle {
    fn drop(&mut self) {
        // `SigningKey` does not implement `Zeroize` directly; replace it with a fresh
        // throwaway key so the previous scalar's bytes are overwritten before deallocation.
        let mut replacement = SigningKey::random(&mut OsRng);
        std::mem::swap(&mut self.signing_key, &mut replacement);
        drop(replacement);
    }
}

/// The device's long-lived keypair: a non-exportable signing handle plus its derived
/// public JWK and thumbprint.
#[derive(Debug, Clone)]
pub struct DeviceKeyMaterial {
    signing_handle: Arc<dyn SigningHandle>,
    public_jwk: DeviceJwk,
    thumbprint: String,
}

impl DeviceKeyMaterial {
    fn from_handle(signing_handle: Arc<dyn SigningHandle>) -> Self {
        let sec1 = signing_handle.public_key_sec1();
        debug_assert_eq!(sec1[0], 0x04, "expected uncompressed SEC1 point");
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&sec1[1..33]);
        y.copy_from_slice(&sec1[33..65]);
        let public_jwk = DeviceJwk::from_coordinates(&x, &y);
        let thumbprint = public_jwk.thumbprint();
        Self {
            signing_handle,
            public_jwk,
            thumbprint,
        }
    }

    /// The device's public JWK.
    #[must_use]
    pub fn public_jwk(&self) -> &DeviceJwk {
        &self.public_jwk
    }

    /// base64url(SHA-256(canonical JWK bytes)).
    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Sign `message`, returning a DER-encoded ECDSA signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.signing_handle.sign(message)
    }

    /// Build directly from a signing handle, bypassing persistence. Exposed for tests that
    /// only need a valid keypair, not the load-or-create lifecycle.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn for_test(signing_handle: Arc<dyn SigningHandle>) -> Self {
        Self::from_handle(signing_handle)
    }
}

/// Test-only helpers for constructing device key material without a real persistence
/// backend.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support {
    use super::SoftwareSigningHandle;

    /// Generate a throwaway in-memory signing handle.
    #[must_use]
    pub fn generate_software_handle() -> SoftwareSigningHandle {
        SoftwareSigningHandle::generate()
    }
}

/// Persists the key store's own bookkeeping: on hosts without a genuine hardware-backed
/// store, this is where the wrapped private key material itself lives.
///
/// Kept as a narrow trait so the default OS-credential-store backend can be swapped for a
/// real hardware-backed one without touching [`DeviceKeyStore`]'s load-or-create logic.
pub trait KeyPersistence: Send + Sync {
    /// Fetch previously persisted PKCS#8 DER bytes for `tag`, if any.
    fn load(&self, tag: &str) -> Result<Option<Vec<u8>>, KeyStoreError>;

    /// Persist PKCS#8 DER bytes under `tag`.
    fn store(&self, tag: &str, pkcs8_der: &[u8]) -> Result<(), KeyStoreError>;
}

/// OS credential-store backed persistence (Keychain / Credential Manager / Secret Service,
/// depending on platform) via the `keyring` crate.
pub struct OsCredentialStore {
    service: String,
}

impl OsCredentialStore {
    /// `service` namespaces entries in the OS credential store; the engine passes the
    /// bundle identifier.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, tag: &str) -> Result<keyring::Entry, KeyStoreError> {
        keyring::Entry::new(&self.service, tag).map_err(|e| KeyStoreError::SecureEnclaveUnavailable {
            reason: e.to_string(),
        })
    }
}

impl KeyPersistence for OsCredentialStore {
    fn load(&self, tag: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        let entry = self.entry(tag)?;
        match entry.get_secret() {
            Ok(bytes) => Ok(Some(bytes)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeyStoreError::SecureEnclaveUnavailable { reason: e.to_string() }),
        }
    }

    fn store(&self, tag: &str, pkcs8_der: &[u8]) -> Result<(), KeyStoreError> {
        let entry = self.entry(tag)?;
        entry
            .set_secret(pkcs8_der)
            .map_err(|e| KeyStoreError::SecureEnclaveUnavailable { reason: e.to_string() })
    }
}

/// Load-or-create a device keypair, tagged by bundle identity.
#[async_trait]
pub trait DeviceKeyStore: Send + Sync {
    /// Return the existing device key material, or create and persist a new one.
    /// Idempotent: repeated calls return material for the same underlying key.
    async fn load_or_create(&self) -> Result<Arc<DeviceKeyMaterial>, KeyStoreError>;
}

/// Default [`DeviceKeyStore`]: one P-256 key per bundle identifier, persisted through a
/// [`KeyPersistence`] backend and cached in memory after first load.
pub struct DefaultDeviceKeyStore<P: KeyPersistence> {
    persistence: P,
    tag: String,
    cached: tokio::sync::Mutex<Option<Arc<DeviceKeyMaterial>>>,
}

impl<P: KeyPersistence> DefaultDeviceKeyStore<P> {
    /// `bundle_identifier` becomes the persistence tag.
    #[must_use]
    pub fn new(persistence: P, bundle_identifier: impl Into<String>) -> Self {
        Self {
            persistence,
            tag: bundle_identifier.into(),
            cached: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl<P: KeyPersistence> DeviceKeyStore for DefaultDeviceKeyStore<P> {
    async fn load_or_create(&self) -> Result<Arc<DeviceKeyMaterial>, KeyStoreError> {
        let mut guard = self.cached.lock().await;
        if let Some(material) = guard.as_ref() {
            return Ok(Arc::clone(material));
        }

        let handle: Arc<dyn SigningHandle> = match self.persistence.load(&self.tag)? {
            Some(der) => {
                trace!(tag = %self.tag, "loaded existing device key");
                Arc::new(SoftwareSigningHandle::from_pkcs8_der(&der)?)
            }
            None => {
                debug!(tag = %self.tag, "generating new device key");
                let handle = SoftwareSigningHandle::generate();
                let der = handle.to_pkcs8_der()?;
                self.persistence.store(&self.tag, &der)?;
                let mut der = der;
                der.zeroize();
                Arc::new(handle)
            }
        };

        let material = Arc::new(DeviceKeyMaterial::from_handle(handle));
        *guard = Some(Arc::clone(&material));
        Ok(material)
    }
}
