//! Typed wire adapter for the auth gateway's three endpoints.
//!
//! Built on a single shared [`reqwest::Client`] — connection reuse is an httpclient-level
//! concern, not one this crate re-implements. Every call is wrapped in a `tracing` span
//! carrying the path and resulting status only; request/response bodies are never logged,
//! since they carry nonces, assertions, and bearer material.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::error::{EngineError, ServerError};

/// `{"purpose":"token"}`.
#[derive(Serialize)]
struct ChallengeRequest {
    purpose: &'static str,
}

/// `{nonce, exp}` returned by `/attest/challenge`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeResponse {
    pub nonce: String,
    pub exp: i64,
}

/// `{bundle_id}`.
#[derive(Serialize)]
struct AppInfo<'a> {
    bundle_id: &'a str,
}

/// The device's public JWK, as embedded in registration/token request bodies.
#[derive(Serialize)]
struct DeviceKeyJwkWire<'a> {
    kty: &'a str,
    crv: &'a str,
    x: &'a str,
    y: &'a str,
}

impl<'a> From<&'a devauth_dpop::DeviceJwk> for DeviceKeyJwkWire<'a> {
    fn from(jwk: &'a devauth_dpop::DeviceJwk) -> Self {
        Self {
            kty: &jwk.kty,
            crv: &jwk.crv,
            x: &jwk.x,
            y: &jwk.y,
        }
    }
}

/// `attestation` member of a `/attest/register` request body.
#[derive(Serialize)]
struct RegisterAttestation<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    key_id: &'a str,
    team_id: &'a str,
    attestation: &'a str,
}

#[derive(Serialize)]
pub struct RegisterRequest<'a> {
    platform: &'static str,
    app: AppInfo<'a>,
    device_key_jwk: DeviceKeyJwkWire<'a>,
    attestation: RegisterAttestation<'a>,
    nonce: &'a str,
    dpop: &'a str,
}

impl<'a> RegisterRequest<'a> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        bundle_id: &'a str,
        device_key_jwk: &'a devauth_dpop::DeviceJwk,
        key_id: &'a str,
        team_id: &'a str,
        attestation_b64: &'a str,
        nonce: &'a str,
        dpop: &'a str,
    ) -> Self {
        Self {
            platform: "ios",
            app: AppInfo { bundle_id },
            device_key_jwk: device_key_jwk.into(),
            attestation: RegisterAttestation {
                kind: "app_attest",
                key_id,
                team_id,
                attestation: attestation_b64,
            },
            nonce,
            dpop,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub registered: bool,
    pub key_id: String,
}

/// `attestation` member of a `/token` request body, mutually exclusive with `dev_token`.
#[derive(Serialize)]
struct TokenAttestation<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    key_id: &'a str,
    team_id: &'a str,
    assertion: &'a str,
}

#[derive(Serialize)]
pub struct TokenRequest<'a> {
    platform: &'static str,
    app: AppInfo<'a>,
    device_key_jwk: DeviceKeyJwkWire<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attestation: Option<TokenAttestation<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dev_token: Option<&'a str>,
    dpop: &'a str,
}

impl<'a> TokenRequest<'a> {
    #[must_use]
    pub fn attested(
        bundle_id: &'a str,
        device_key_jwk: &'a devauth_dpop::DeviceJwk,
        key_id: &'a str,
        team_id: &'a str,
        assertion_b64: &'a str,
        dpop: &'a str,
    ) -> Self {
        Self {
            platform: "ios",
            app: AppInfo { bundle_id },
            device_key_jwk: device_key_jwk.into(),
            attestation: Some(TokenAttestation {
                kind: "app_attest",
                key_id,
                team_id,
                assertion: assertion_b64,
            }),
            dev_token: None,
            dpop,
        }
    }

    #[must_use]
    pub fn development(
        bundle_id: &'a str,
        device_key_jwk: &'a devauth_dpop::DeviceJwk,
        dev_token: &'a str,
        dpop: &'a str,
    ) -> Self {
        Self {
            platform: "ios",
            app: AppInfo { bundle_id },
            device_key_jwk: device_key_jwk.into(),
            attestation: None,
            dev_token: Some(dev_token),
            dpop,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub mode: Option<String>,
}

/// A decoded non-2xx response: the status, a structured error body (if the body was JSON),
/// and the response headers for nonce-retry inspection.
#[derive(Debug)]
pub struct ApiErrorResponse {
    pub status: u16,
    pub server_error: Option<ServerError>,
    pub headers: HashMap<String, String>,
}

impl ApiErrorResponse {
    /// Case-insensitive header lookup (header names are already lowercased at capture time).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Either a decoded success body or a classified API error.
pub type ApiResult<T> = Result<T, ApiErrorResponse>;

/// Typed client for the auth gateway's three endpoints.
pub struct AuthApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl AuthApiClient {
    /// `base_url` has no trailing slash requirement; paths are joined with one.
    pub fn new(base_url: impl Into<String>) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Build from a caller-supplied client, e.g. one already configured for the host's
    /// proxy/TLS requirements.
    #[must_use]
    pub fn from_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// The absolute URL for `path` under this client's base URL. Exposed so the engine can
    /// build DPoP proofs over the exact target URL before issuing the request.
    #[must_use]
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    #[instrument(skip_all, fields(path = "/attest/challenge", status))]
    pub async fn challenge(&self) -> Result<ApiResult<ChallengeResponse>, EngineError> {
        let response = self
            .http
            .post(self.endpoint("/attest/challenge"))
            .json(&ChallengeRequest { purpose: "token" })
            .send()
            .await?;
        self.decode(response).await
    }

    #[instrument(skip_all, fields(path = "/attest/register", status))]
    pub async fn register(
        &self,
        request: &RegisterRequest<'_>,
        dpop: &str,
    ) -> Result<ApiResult<RegisterResponse>, EngineError> {
        let response = self
            .http
            .post(self.endpoint("/attest/register"))
            .header("DPoP", dpop)
            .json(request)
            .send()
            .await?;
        self.decode(response).await
    }

    #[instrument(skip_all, fields(path = "/token", status))]
    pub async fn token(&self, request: &TokenRequest<'_>, dpop: &str) -> Result<ApiResult<TokenResponse>, EngineError> {
        let response = self
            .http
            .post(self.endpoint("/token"))
            .header("DPoP", dpop)
            .json(request)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(&self, response: reqwest::Response) -> Result<ApiResult<T>, EngineError> {
        let status = response.status();
        tracing::Span::current().record("status", status.as_u16());

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_ascii_lowercase(), value.to_str().unwrap_or_default().to_string()))
            .collect();

        if status.is_success() {
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Err(EngineError::InvalidResponse);
            }
            let body = serde_json::from_slice(&bytes).map_err(|e| EngineError::Decoding(e.to_string()))?;
            return Ok(Ok(body));
        }

        let bytes = response.bytes().await?;
        let server_error = serde_json::from_slice::<ServerError>(&bytes).ok();
        if server_error.is_none() && !bytes.is_empty() {
            warn!("non-2xx response body did not match the server error schema");
        }
        Ok(Err(ApiErrorResponse {
            status: status.as_u16(),
            server_error,
            headers,
        }))
    }
}
