// ── Client configuration ──
//
// Everything a kiosk application supplies before connecting: platform
// base URL, OAuth credentials, and tuning for the socket, reconnect, and
// component-poll loops. The token and WebSocket endpoints are derived
// from the base URL unless overridden explicitly.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;
use uuid::Uuid;

use cuss2_api::socket::SocketConfig;

use crate::error::CoreError;

/// Default interval for the component reconciliation poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Backoff policy for session establishment.
///
/// Attempts never stop; the delay doubles after every consecutive
/// failure and resets once a connection lands.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on the doubled delay. `None` leaves it unbounded.
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (zero-based):
    /// `initial * 2^attempt`, capped at `max_delay` when set.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_delay
            .saturating_mul(2_u32.saturating_pow(attempt));
        match self.max_delay {
            Some(max) => doubled.min(max),
            None => doubled,
        }
    }
}

// ── ClientConfig ─────────────────────────────────────────────────────

/// Connection settings for one kiosk application.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Platform base URL, e.g. `https://kiosk.example.com`.
    pub base_url: Url,

    /// OAuth client id issued to this application.
    pub client_id: String,

    /// OAuth client secret issued to this application.
    pub client_secret: SecretString,

    /// Device id stamped into outbound envelopes. Leave nil to adopt the
    /// id the platform reports in its environment.
    pub device_id: Uuid,

    /// Token endpoint override. Derived from `base_url` when `None`.
    pub token_url: Option<Url>,

    /// WebSocket endpoint override. Derived from `base_url` when `None`.
    pub socket_url: Option<Url>,

    /// Per-connection socket tuning (call timeout, keepalive).
    pub socket: SocketConfig,

    /// Session establishment backoff.
    pub reconnect: ReconnectConfig,

    /// Interval for the component reconciliation poll.
    pub poll_interval: Duration,
}

impl ClientConfig {
    pub fn new(
        base_url: Url,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            base_url,
            client_id: client_id.into(),
            client_secret,
            device_id: Uuid::nil(),
            token_url: None,
            socket_url: None,
            socket: SocketConfig::default(),
            reconnect: ReconnectConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// The token endpoint: the override, or `<base>/oauth/token`.
    pub fn token_endpoint(&self) -> Url {
        match &self.token_url {
            Some(url) => url.clone(),
            None => with_suffix(&self.base_url, "oauth/token"),
        }
    }

    /// The WebSocket endpoint: the override, or
    /// `ws(s)://<base>/platform/subscribe` with the scheme swapped to
    /// match the base URL's security.
    pub fn socket_endpoint(&self) -> Result<Url, CoreError> {
        if let Some(url) = &self.socket_url {
            return Ok(url.clone());
        }
        let mut url = with_suffix(&self.base_url, "platform/subscribe");
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|()| CoreError::InvalidArgument {
                message: format!("cannot derive a WebSocket scheme from {}", self.base_url),
            })?;
        Ok(url)
    }
}

/// Append a path suffix to a base URL, dropping any query/fragment and
/// collapsing trailing slashes first.
fn with_suffix(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    let trimmed = url.path().trim_end_matches('/').to_owned();
    url.set_path(&format!("{trimmed}/{suffix}"));
    url
}
