//! OAuth2 client-credentials exchange against the platform token
//! endpoint.
//!
//! The platform issues short-lived bearer tokens from
//! `<base>/oauth/token`. [`TokenClient`] performs the exchange and hands
//! back the token together with its advertised lifetime, so the session
//! layer can schedule renewal ahead of expiry.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::error::Error;

/// HTTP timeout for the exchange itself.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── AccessToken ──────────────────────────────────────────────────────

/// A bearer token issued by the platform token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    /// The bearer value presented on the socket upgrade and stamped into
    /// every outbound envelope.
    pub access_token: SecretString,

    /// Advertised lifetime in seconds. Zero or absent means the platform
    /// never expires the token.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl AccessToken {
    /// Time until this token expires, if it does.
    pub fn ttl(&self) -> Option<Duration> {
        self.expires_in
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

// ── TokenClient ──────────────────────────────────────────────────────

/// Client-credentials exchange for one set of kiosk credentials.
///
/// Cheap to clone; the underlying [`reqwest::Client`] is shared.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
}

impl TokenClient {
    /// Build a client with an HTTP client scoped to the exchange.
    pub fn new(
        token_url: Url,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Authorization {
                message: format!("HTTP client construction failed: {e}"),
            })?;
        Ok(Self::from_reqwest(http, token_url, client_id, client_secret))
    }

    /// Build from an existing [`reqwest::Client`] (custom TLS, proxies,
    /// test servers).
    pub fn from_reqwest(
        http: reqwest::Client,
        token_url: Url,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http,
            token_url,
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// The endpoint this client exchanges credentials against.
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// Exchange client credentials for a bearer token.
    pub async fn authorize(&self) -> Result<AccessToken, Error> {
        tracing::debug!(
            url = %self.token_url,
            client_id = %self.client_id,
            "Requesting access token"
        );

        let body = json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret.expose_secret(),
        });

        let response = self
            .http
            .post(self.token_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Authorization {
                message: format!("token request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Authorization {
                message: format!("token endpoint returned HTTP {status}: {body}"),
            });
        }

        let token: AccessToken =
            response.json().await.map_err(|e| Error::Authorization {
                message: format!("undecodable token response: {e}"),
            })?;

        tracing::debug!(expires_in = ?token.expires_in, "Access token issued");
        Ok(token)
    }
}
