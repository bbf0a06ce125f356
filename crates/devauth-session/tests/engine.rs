//! End-to-end mint/retry/coalescing scenarios, mocking the auth gateway with `wiremock` and
//! driving attestation through the in-memory `TestAttestationBackend` test double.

use std::sync::Arc;
use std::time::Duration;

use devauth_dpop::key_store::test_support::generate_software_handle;
use devauth_dpop::{DeviceKeyMaterial, DeviceKeyStore, KeyStoreError};
use devauth_session::attestation::test_support::TestAttestationBackend;
use devauth_session::{AttestationProvider, AuthSession, EngineConfig, EngineError, LogLevel};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FixedKeyStore {
    material: Arc<DeviceKeyMaterial>,
}

impl FixedKeyStore {
    fn new() -> Self {
        Self {
            material: Arc::new(DeviceKeyMaterial::for_test(Arc::new(generate_software_handle()))),
        }
    }
}

#[async_trait::async_trait]
impl DeviceKeyStore for FixedKeyStore {
    async fn load_or_create(&self) -> Result<Arc<DeviceKeyMaterial>, KeyStoreError> {
        Ok(Arc::clone(&self.material))
    }
}

fn config_for(base_url: &str) -> EngineConfig {
    EngineConfig {
        base_url: base_url.to_string(),
        bundle_identifier: "com.example.app".into(),
        team_identifier: "ABCDE12345".into(),
        development_token: None,
        log_level: LogLevel::Info,
    }
}

async fn mount_challenge(server: &MockServer, nonce: &str) {
    Mock::given(method("POST"))
        .and(path("/attest/challenge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"nonce": nonce, "exp": 9_999_999_999i64})))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_register_success(server: &MockServer) {
    // No `.expect(n)`: some scenarios legitimately register more than once (e.g. after an
    // invalid-key or registration-required recovery regenerates the key).
    Mock::given(method("POST"))
        .and(path("/attest/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"registered": true, "key_id": "ignored"})))
        .mount(server)
        .await;
}

/// Scenario 1: cold start, happy path.
#[tokio::test]
async fn cold_start_happy_path_registers_once_and_caches_token() {
    let server = MockServer::start().await;
    mount_challenge(&server, "AAAA").await;
    mount_register_success(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "T1", "expires_in": 300})))
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(TestAttestationBackend::new());
    let session = AuthSession::new(
        config_for(&server.uri()),
        Arc::new(FixedKeyStore::new()),
        Arc::new(AttestationProvider::new(backend.clone())),
    )
    .unwrap();

    let token = session.current_token().await.unwrap();
    assert_eq!(token, "T1");
    assert_eq!(backend.attest_call_count(), 1);

    // Within the freshness window, a second call must not hit /token again.
    let token_again = session.current_token().await.unwrap();
    assert_eq!(token_again, "T1");
}

/// Scenario 2: nonce challenge on `/token`.
#[tokio::test]
async fn token_nonce_challenge_triggers_exactly_one_retry() {
    let server = MockServer::start().await;
    mount_challenge(&server, "AAAA").await;
    mount_register_success(&server).await;

    // Mount the eventual-success fallback first; the nonce-challenge mock mounted after it
    // takes precedence (wiremock prefers the most recently mounted mock on a tie) until its
    // `up_to_n_times(1)` budget is exhausted, after which requests fall through to this one.
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "T1", "expires_in": 300})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("DPoP-Nonce", "N1")
                .set_body_json(json!({"error": "invalid_token", "error_description": "nonce required"})),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(TestAttestationBackend::new());
    let session = AuthSession::new(
        config_for(&server.uri()),
        Arc::new(FixedKeyStore::new()),
        Arc::new(AttestationProvider::new(backend)),
    )
    .unwrap();

    let token = session.current_token().await.unwrap();
    assert_eq!(token, "T1");
}

/// Scenario 3: server reports registration required after the provider already thought the
/// key was attested.
#[tokio::test]
async fn registration_required_response_clears_and_restarts_once() {
    let server = MockServer::start().await;
    mount_challenge(&server, "AAAA").await;
    mount_register_success(&server).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "T1", "expires_in": 300})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": "attestation_failed", "error_description": "registration required"})),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(TestAttestationBackend::new());
    let provider = Arc::new(AttestationProvider::new(backend.clone()));
    // Pre-attest the key locally so the first `/token` attempt is made without registering.
    let key_id = provider.ensure_key_id().await.unwrap();
    provider.mark_attested(&key_id).await;

    let session = AuthSession::new(config_for(&server.uri()), Arc::new(FixedKeyStore::new()), provider).unwrap();

    let token = session.current_token().await.unwrap();
    assert_eq!(token, "T1");
    // The restart regenerated a key id and registered it.
    assert_eq!(backend.attest_call_count(), 1);
}

/// Scenario 4: provider reports the key invalid exactly once.
#[tokio::test]
async fn provider_invalid_key_once_recovers_with_a_new_key() {
    let server = MockServer::start().await;
    mount_challenge(&server, "AAAA").await;
    mount_register_success(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "T1", "expires_in": 300})))
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(TestAttestationBackend::new());
    backend.fail_next_assertions_with_invalid_key(1);
    let session = AuthSession::new(
        config_for(&server.uri()),
        Arc::new(FixedKeyStore::new()),
        Arc::new(AttestationProvider::new(backend.clone())),
    )
    .unwrap();

    let token = session.current_token().await.unwrap();
    assert_eq!(token, "T1");
    assert_eq!(backend.generated_key_ids().len(), 2, "expected exactly one regeneration after the invalid-key signal");
}

/// Scenario 5: K concurrent callers on a cold cache coalesce into one `/token` call.
#[tokio::test]
async fn concurrent_callers_coalesce_into_a_single_token_call() {
    let server = MockServer::start().await;
    mount_challenge(&server, "AAAA").await;
    mount_register_success(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(50))
                .set_body_json(json!({"access_token": "T1", "expires_in": 300})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(TestAttestationBackend::new());
    let session = AuthSession::new(
        config_for(&server.uri()),
        Arc::new(FixedKeyStore::new()),
        Arc::new(AttestationProvider::new(backend)),
    )
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let session = session.clone();
        handles.push(tokio::spawn(async move { session.current_token().await }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(handle.await.unwrap().unwrap());
    }
    assert!(tokens.iter().all(|t| t == "T1"));
}

/// Scenario 6: development-token path when attestation is unsupported.
#[tokio::test]
async fn development_token_path_skips_attestation_entirely() {
    let server = MockServer::start().await;
    // No /attest/challenge or /attest/register mocks mounted: any call to them fails the mock
    // server's default 404, which would surface as a decode/server error and fail the test.
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "T1", "expires_in": 300, "mode": "dev"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.development_token = Some("D".into());

    let backend = Arc::new(TestAttestationBackend::unsupported());
    let session = AuthSession::new(
        config,
        Arc::new(FixedKeyStore::new()),
        Arc::new(AttestationProvider::new(backend)),
    )
    .unwrap();

    let token = session.current_token().await.unwrap();
    assert_eq!(token, "T1");
}

/// Dev-token gating: a configured development token is never sent once attestation is
/// supported, and the production path is used instead.
#[tokio::test]
async fn development_token_is_ignored_when_attestation_is_supported() {
    let server = MockServer::start().await;
    mount_challenge(&server, "AAAA").await;
    mount_register_success(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "T1", "expires_in": 300})))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.development_token = Some("D".into());

    let backend = Arc::new(TestAttestationBackend::new());
    let session = AuthSession::new(
        config,
        Arc::new(FixedKeyStore::new()),
        Arc::new(AttestationProvider::new(backend.clone())),
    )
    .unwrap();

    let token = session.current_token().await.unwrap();
    assert_eq!(token, "T1");
    assert_eq!(backend.attest_call_count(), 1, "production attestation path should still have run");
}

/// A non-2xx, non-nonce, non-registration-required failure propagates unchanged and leaves
/// the engine able to retry on a subsequent call.
#[tokio::test]
async fn unclassified_server_error_propagates_as_server_error() {
    let server = MockServer::start().await;
    mount_challenge(&server, "AAAA").await;
    mount_register_success(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(json!({"error": "rate_limited", "error_description": "slow down"})),
        )
        .mount(&server)
        .await;

    let backend = Arc::new(TestAttestationBackend::new());
    let session = AuthSession::new(
        config_for(&server.uri()),
        Arc::new(FixedKeyStore::new()),
        Arc::new(AttestationProvider::new(backend)),
    )
    .unwrap();

    let err = session.current_token().await.unwrap_err();
    match err {
        EngineError::Server { status, server_error, .. } => {
            assert_eq!(status, 429);
            assert_eq!(server_error.unwrap().error, "rate_limited");
        }
        other => panic!("expected Server error, got {other:?}"),
    }
}
