//! The authentication session engine.
//!
//! Coordinates challenge → attest/register (at most once per key) → assertion → token
//! exchange, caches the resulting access token, and coalesces concurrent mints behind a
//! single `futures::future::Shared` future so K concurrent callers on a cold cache trigger
//! exactly one `/token` call.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{info, warn};

use devauth_dpop::{DeviceJwk, DeviceKeyMaterial, DeviceKeyStore, DpopProofBuilder};

use crate::api_client::{ApiErrorResponse, AuthApiClient, ChallengeResponse, RegisterRequest, TokenRequest};
use crate::attestation::{AttestationError, AttestationProvider};
use crate::config::EngineConfig;
use crate::error::{EngineError, ServerError};

/// A minted access token, held in memory only.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    /// The server's `mode` field (e.g. `"prod"`, `"dev"`), if it sent one. Surfaced but not
    /// acted on; policy is left to the host.
    pub mode: Option<String>,
    expires_at: tokio::time::Instant,
}

impl AccessToken {
    fn from_response(resp: crate::api_client::TokenResponse) -> Self {
        let ttl = Duration::from_secs(resp.expires_in.max(0) as u64);
        Self {
            value: resp.access_token,
            mode: resp.mode,
            expires_at: tokio::time::Instant::now() + ttl,
        }
    }

    /// Valid iff `expires_at - now > 60s`.
    fn is_fresh(&self) -> bool {
        self.expires_at
            .checked_duration_since(tokio::time::Instant::now())
            .is_some_and(|remaining| remaining > Duration::from_secs(60))
    }
}

/// `{bearer, dpop}` produced per request; never cached.
#[derive(Debug, Clone)]
pub struct AuthorizationContext {
    pub bearer: String,
    pub dpop: String,
}

type MintFuture = Shared<BoxFuture<'static, Result<AccessToken, EngineError>>>;

struct SessionInner {
    config: EngineConfig,
    key_store: Arc<dyn DeviceKeyStore>,
    attestation: Arc<AttestationProvider>,
    api: AuthApiClient,
    cache: Mutex<Option<AccessToken>>,
    mint_slot: Mutex<Option<MintFuture>>,
}

/// Coordinates attestation-backed token minting for one device identity.
///
/// Cheaply cloneable: clones share the same token cache, mint slot, and underlying clients.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

impl AuthSession {
    /// Validate `config`, build an [`AuthApiClient`] over it, and wire up `key_store` and
    /// `attestation` as the engine's two suspendable collaborators.
    pub fn new(
        config: EngineConfig,
        key_store: Arc<dyn DeviceKeyStore>,
        attestation: Arc<AttestationProvider>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let api = AuthApiClient::new(config.base_url.clone())?;
        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                key_store,
                attestation,
                api,
                cache: Mutex::new(None),
                mint_slot: Mutex::new(None),
            }),
        })
    }

    /// Ensure a valid token, then build a DPoP proof for this exact `(method, url, nonce?)`.
    pub async fn headers(&self, url: &str, method: &str, nonce: Option<&str>) -> Result<AuthorizationContext, EngineError> {
        let token = self.ensure_token().await?;
        let key = self.inner.key_store.load_or_create().await?;
        let builder = DpopProofBuilder::new(&key);
        let dpop = builder.proof(method, url, nonce)?;
        Ok(AuthorizationContext { bearer: token.value, dpop })
    }

    /// Ensure a valid token and return its bearer value.
    pub async fn current_token(&self) -> Result<String, EngineError> {
        Ok(self.ensure_token().await?.value)
    }

    /// Cancel any in-flight mint (by dropping the engine's own handle to it) and discard the
    /// token cache. Does not destroy keys or the attestation record.
    pub async fn reset(&self) {
        *self.inner.mint_slot.lock().await = None;
        *self.inner.cache.lock().await = None;
    }

    async fn ensure_token(&self) -> Result<AccessToken, EngineError> {
        if let Some(token) = self.cached_if_fresh().await {
            return Ok(token);
        }
        self.mint_coalesced().await
    }

    async fn cached_if_fresh(&self) -> Option<AccessToken> {
        let guard = self.inner.cache.lock().await;
        guard.as_ref().filter(|t| t.is_fresh()).cloned()
    }

    async fn mint_coalesced(&self) -> Result<AccessToken, EngineError> {
        let mut slot = self.inner.mint_slot.lock().await;
        if let Some(in_flight) = slot.as_ref() {
            let in_flight = in_flight.clone();
            drop(slot);
            return in_flight.await;
        }

        let inner = Arc::clone(&self.inner);
        let boxed: BoxFuture<'static, Result<AccessToken, EngineError>> = Box::pin(mint(inner));
        let shared = boxed.shared();
        *slot = Some(shared.clone());
        drop(slot);

        let result = shared.await;

        if let Ok(token) = &result {
            *self.inner.cache.lock().await = Some(token.clone());
        }
        *self.inner.mint_slot.lock().await = None;

        result
    }
}

async fn mint(inner: Arc<SessionInner>) -> Result<AccessToken, EngineError> {
    let use_development_path = inner.config.development_token.is_some() && !inner.attestation.is_supported();
    if use_development_path {
        mint_development(&inner).await
    } else {
        mint_production(&inner).await
    }
}

async fn mint_development(inner: &SessionInner) -> Result<AccessToken, EngineError> {
    if inner.attestation.is_supported() {
        return Err(EngineError::Configuration(
            "development token cannot be used when attestation is supported on this runtime".into(),
        ));
    }
    let dev_token = inner
        .config
        .development_token
        .as_deref()
        .ok_or_else(|| EngineError::Configuration("no development token configured".into()))?;

    let key = inner.key_store.load_or_create().await?;
    let jwk = key.public_jwk().clone();
    let builder = DpopProofBuilder::new(&key);
    let token_url = inner.api.endpoint("/token");

    let dpop = builder.proof("POST", &token_url, None)?;
    let request = TokenRequest::development(&inner.config.bundle_identifier, &jwk, dev_token, &dpop);

    match inner.api.token(&request, &dpop).await? {
        Ok(resp) => {
            info!(mode = resp.mode.as_deref().unwrap_or("dev"), "minted token via development path");
            Ok(AccessToken::from_response(resp))
        }
        Err(api_err) => {
            if api_err.status == 401 {
                if let Some(nonce) = api_err.header("dpop-nonce") {
                    let nonce = nonce.to_string();
                    let dpop2 = builder.proof("POST", &token_url, Some(&nonce))?;
                    let request2 = TokenRequest::development(&inner.config.bundle_identifier, &jwk, dev_token, &dpop2);
                    return match inner.api.token(&request2, &dpop2).await? {
                        Ok(resp) => Ok(AccessToken::from_response(resp)),
                        Err(e2) => Err(classify_api_error(e2)),
                    };
                }
            }
            Err(classify_api_error(api_err))
        }
    }
}

async fn mint_production(inner: &SessionInner) -> Result<AccessToken, EngineError> {
    let key = inner.key_store.load_or_create().await?;
    let jwk = key.public_jwk().clone();
    let canonical = jwk.canonical_bytes();

    let challenge = fetch_challenge(inner).await?;
    let nonce_bytes =
        devauth_dpop::decode_nonce_lenient(&challenge.nonce).map_err(|e| EngineError::Configuration(e.to_string()))?;
    let cdh = devauth_dpop::client_data_hash(&nonce_bytes, &canonical);

    let mut key_id = inner.attestation.ensure_key_id().await.map_err(map_attestation_err)?;

    for attempt in 1..=2u8 {
        let assertion = match assertion_with_registration(inner, &key, &jwk, &key_id, &cdh, &challenge.nonce).await {
            Ok(assertion) => assertion,
            Err(AssertionFailure::InvalidKey) if attempt == 1 => {
                warn!("attestation key reported invalid, clearing and regenerating");
                inner.attestation.clear().await;
                key_id = inner.attestation.ensure_key_id().await.map_err(map_attestation_err)?;
                continue;
            }
            Err(AssertionFailure::InvalidKey) => {
                return Err(EngineError::AttestationFailed("attestation key invalid after retry".into()));
            }
            Err(AssertionFailure::Other(e)) => return Err(e),
        };

        let assertion_b64 = devauth_dpop::base64url_encode(&assertion);
        let builder = DpopProofBuilder::new(&key);
        let token_url = inner.api.endpoint("/token");
        let dpop = builder.proof("POST", &token_url, None)?;
        let request = TokenRequest::attested(
            &inner.config.bundle_identifier,
            &jwk,
            &key_id,
            &inner.config.team_identifier,
            &assertion_b64,
            &dpop,
        );

        match inner.api.token(&request, &dpop).await? {
            Ok(resp) => {
                info!("minted token via production attestation path");
                return Ok(AccessToken::from_response(resp));
            }
            Err(api_err) => {
                if api_err.status == 401 && api_err.header("dpop-nonce").is_some() {
                    let nonce = api_err.header("dpop-nonce").unwrap().to_string();
                    let dpop2 = builder.proof("POST", &token_url, Some(&nonce))?;
                    let request2 = TokenRequest::attested(
                        &inner.config.bundle_identifier,
                        &jwk,
                        &key_id,
                        &inner.config.team_identifier,
                        &assertion_b64,
                        &dpop2,
                    );
                    return match inner.api.token(&request2, &dpop2).await? {
                        Ok(resp) => Ok(AccessToken::from_response(resp)),
                        Err(e2) => Err(classify_api_error(e2)),
                    };
                }
                if attempt == 1
                    && api_err.status == 401
                    && api_err.server_error.as_ref().is_some_and(ServerError::indicates_registration_required)
                {
                    warn!("server reports registration required, clearing attestation record");
                    inner.attestation.clear().await;
                    key_id = inner.attestation.ensure_key_id().await.map_err(map_attestation_err)?;
                    continue;
                }
                return Err(classify_api_error(api_err));
            }
        }
    }

    Err(EngineError::AttestationFailed("attempt loop exhausted".into()))
}

enum AssertionFailure {
    InvalidKey,
    Other(EngineError),
}

/// Produce a fresh assertion, transparently performing the registration sub-flow if the
/// provider reports the key is not attested yet.
async fn assertion_with_registration(
    inner: &SessionInner,
    key: &DeviceKeyMaterial,
    jwk: &DeviceJwk,
    key_id: &str,
    cdh: &[u8],
    raw_nonce: &str,
) -> Result<Vec<u8>, AssertionFailure> {
    match inner.attestation.generate_assertion(key_id, cdh).await {
        Ok(assertion) => Ok(assertion),
        Err(AttestationError::NotAttested) => {
            register(inner, key, jwk, key_id, raw_nonce).await.map_err(AssertionFailure::Other)?;
            match inner.attestation.generate_assertion(key_id, cdh).await {
                Ok(assertion) => Ok(assertion),
                Err(AttestationError::InvalidKey) => Err(AssertionFailure::InvalidKey),
                Err(other) => Err(AssertionFailure::Other(map_attestation_err(other))),
            }
        }
        Err(AttestationError::InvalidKey) => Err(AssertionFailure::InvalidKey),
        Err(other) => Err(AssertionFailure::Other(map_attestation_err(other))),
    }
}

/// Registration sub-flow: attest the key, call `/attest/register`, and mark it attested on
/// success. Never marks the key attested on any failure.
async fn register(
    inner: &SessionInner,
    key: &DeviceKeyMaterial,
    jwk: &DeviceJwk,
    key_id: &str,
    raw_nonce: &str,
) -> Result<(), EngineError> {
    let canonical = jwk.canonical_bytes();
    let nonce_bytes = devauth_dpop::decode_nonce_lenient(raw_nonce).map_err(|e| EngineError::Configuration(e.to_string()))?;
    let cdh = devauth_dpop::client_data_hash(&nonce_bytes, &canonical);

    let attestation_blob = inner.attestation.attest(key_id, &cdh).await.map_err(map_attestation_err)?;
    let attestation_b64 = devauth_dpop::base64url_encode(&attestation_blob);

    let builder = DpopProofBuilder::new(key);
    let register_url = inner.api.endpoint("/attest/register");
    let dpop = builder.proof("POST", &register_url, None)?;
    let request = RegisterRequest::new(
        &inner.config.bundle_identifier,
        jwk,
        key_id,
        &inner.config.team_identifier,
        &attestation_b64,
        raw_nonce,
        &dpop,
    );

    match inner.api.register(&request, &dpop).await? {
        Ok(resp) if resp.registered => {
            inner.attestation.mark_attested(key_id).await;
            Ok(())
        }
        Ok(_) => Err(EngineError::AttestationFailed("registration rejected by server".into())),
        Err(api_err) => Err(EngineError::AttestationFailed(format!(
            "registration failed with status {}",
            api_err.status
        ))),
    }
}

async fn fetch_challenge(inner: &SessionInner) -> Result<ChallengeResponse, EngineError> {
    match inner.api.challenge().await? {
        Ok(resp) => Ok(resp),
        Err(api_err) => Err(classify_api_error(api_err)),
    }
}

fn classify_api_error(api_err: ApiErrorResponse) -> EngineError {
    EngineError::Server {
        status: api_err.status,
        server_error: api_err.server_error,
        headers: api_err.headers,
    }
}

fn map_attestation_err(e: AttestationError) -> EngineError {
    match e {
        AttestationError::Unavailable => EngineError::AttestationUnavailable,
        other => EngineError::AttestationFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::test_support::TestAttestationBackend;
    use devauth_dpop::key_store::test_support::generate_software_handle;
    use std::sync::Arc as StdArc;

    struct FixedKeyStore {
        material: StdArc<DeviceKeyMaterial>,
    }

    impl FixedKeyStore {
        fn new() -> Self {
            Self {
                material: StdArc::new(DeviceKeyMaterial::for_test(StdArc::new(generate_software_handle()))),
            }
        }
    }

    #[async_trait::async_trait]
    impl DeviceKeyStore for FixedKeyStore {
        async fn load_or_create(&self) -> Result<StdArc<DeviceKeyMaterial>, devauth_dpop::KeyStoreError> {
            Ok(StdArc::clone(&self.material))
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            base_url: "https://auth.example.com".into(),
            bundle_identifier: "com.example.app".into(),
            team_identifier: "ABCDE12345".into(),
            development_token: Some("dev-token-value".into()),
            log_level: crate::config::LogLevel::Info,
        }
    }

    fn session_with(attestation: Arc<AttestationProvider>) -> AuthSession {
        AuthSession::new(test_config(), Arc::new(FixedKeyStore::new()), attestation).unwrap()
    }

    #[tokio::test]
    async fn rejects_malformed_config_at_construction() {
        let mut config = test_config();
        config.team_identifier = "short".into();
        let attestation = Arc::new(AttestationProvider::new(Arc::new(TestAttestationBackend::unsupported())));
        let err = AuthSession::new(config, Arc::new(FixedKeyStore::new()), attestation).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn current_token_before_any_mint_requires_a_real_mint_attempt() {
        // There is no cached token yet, so `current_token` must always go through `mint`,
        // never synthesize a value; with no server reachable this surfaces as `Network`.
        let attestation = Arc::new(AttestationProvider::new(Arc::new(TestAttestationBackend::unsupported())));
        let mut config = test_config();
        config.base_url = "http://127.0.0.1:1".into();
        let session = AuthSession::new(config, Arc::new(FixedKeyStore::new()), attestation).unwrap();
        let err = session.current_token().await.unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));
    }

    #[tokio::test]
    async fn development_mint_rejects_when_attestation_is_supported() {
        let attestation = Arc::new(AttestationProvider::new(Arc::new(TestAttestationBackend::new())));
        let inner = SessionInner {
            config: test_config(),
            key_store: Arc::new(FixedKeyStore::new()),
            attestation,
            api: AuthApiClient::new("https://auth.example.com").unwrap(),
            cache: Mutex::new(None),
            mint_slot: Mutex::new(None),
        };
        let err = mint_development(&inner).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn reset_clears_cache_and_forces_a_fresh_mint() {
        let attestation = Arc::new(AttestationProvider::new(Arc::new(TestAttestationBackend::unsupported())));
        let session = session_with(attestation);
        *session.inner.cache.lock().await = Some(AccessToken {
            value: "cached".into(),
            mode: None,
            expires_at: tokio::time::Instant::now() + Duration::from_secs(300),
        });
        assert!(session.cached_if_fresh().await.is_some());
        session.reset().await;
        assert!(session.cached_if_fresh().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_refreshed_once_fewer_than_60s_of_virtual_life_remain() {
        let attestation = Arc::new(AttestationProvider::new(Arc::new(TestAttestationBackend::unsupported())));
        let session = session_with(attestation);
        *session.inner.cache.lock().await = Some(AccessToken {
            value: "cached".into(),
            mode: None,
            expires_at: tokio::time::Instant::now() + Duration::from_secs(120),
        });

        assert!(session.cached_if_fresh().await.is_some(), "120s remaining is fresh");

        tokio::time::advance(Duration::from_secs(70)).await;
        assert!(
            session.cached_if_fresh().await.is_none(),
            "50s remaining is under the 60s freshness floor"
        );
    }
}
