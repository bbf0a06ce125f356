//! Optional helper that issues a proxied request, attaches the engine's authorization
//! headers, and performs a single nonce-driven retry.

use reqwest::Method;

use crate::error::EngineError;
use crate::session::AuthSession;

/// Wraps a [`reqwest::Client`] and an [`AuthSession`] to send authorized requests with one
/// automatic nonce retry on a `401` carrying a `DPoP-Nonce` response header.
pub struct RequestDispatcher {
    http: reqwest::Client,
    session: AuthSession,
}

impl RequestDispatcher {
    #[must_use]
    pub fn new(http: reqwest::Client, session: AuthSession) -> Self {
        Self { http, session }
    }

    /// Send `method url` with `body` (if any) plus `extra_headers`, attaching
    /// `Authorization`/`DPoP` headers from the session. On a `401` carrying a `DPoP-Nonce`
    /// response header, rebuilds headers with that nonce and resends exactly once.
    pub async fn send(
        &self,
        url: &str,
        method: Method,
        body: Option<Vec<u8>>,
        extra_headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, EngineError> {
        let response = self.send_once(url, &method, body.clone(), extra_headers, None).await?;

        if response.status().as_u16() == 401 {
            if let Some(nonce) = response.headers().get("dpop-nonce").and_then(|v| v.to_str().ok()) {
                let nonce = nonce.to_string();
                return self.send_once(url, &method, body, extra_headers, Some(&nonce)).await;
            }
        }

        Ok(response)
    }

    async fn send_once(
        &self,
        url: &str,
        method: &Method,
        body: Option<Vec<u8>>,
        extra_headers: &[(&str, &str)],
        nonce: Option<&str>,
    ) -> Result<reqwest::Response, EngineError> {
        let auth = self.session.headers(url, method.as_str(), nonce).await?;

        let mut builder = self
            .http
            .request(method.clone(), url)
            .header("Authorization", format!("Bearer {}", auth.bearer))
            .header("DPoP", auth.dpop);

        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        Ok(builder.send().await?)
    }
}
