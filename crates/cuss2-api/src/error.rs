use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::model::{
    ComponentId, ComponentState, Directive, MessageCode, PlatformData, RequestId,
};

/// Top-level error type for the `cuss2-api` crate.
///
/// Covers every failure mode across the wire surfaces: credential
/// exchange, WebSocket transport, request correlation, and envelope
/// encoding. `cuss2-core` maps these into domain diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authorization ───────────────────────────────────────────────
    /// Credential exchange with the token endpoint failed. Network
    /// faults, non-2xx statuses, and undecodable bodies all land here;
    /// there is nothing for a caller to do with them but retry.
    #[error("Authorization failed: {message}")]
    Authorization { message: String },

    // ── Correlation ─────────────────────────────────────────────────
    /// A correlated request got no reply within the call timeout.
    #[error("{directive} request {request_id} timed out after {timeout:?}")]
    Timeout {
        request_id: RequestId,
        directive: Directive,
        timeout: Duration,
    },

    /// The platform answered with a message code from the critical
    /// denylist.
    #[error(transparent)]
    PlatformResponse(#[from] PlatformResponseError),

    // ── Transport ───────────────────────────────────────────────────
    /// WebSocket upgrade failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// The socket went away while a request was in flight, or an
    /// operation was attempted on a torn-down connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Data ────────────────────────────────────────────────────────
    /// An envelope could not be encoded for the wire.
    #[error("Envelope encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if re-running the credential exchange might
    /// resolve this error.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authorization { .. })
    }

    /// Returns `true` if the connection is gone and a reconnect is the
    /// right response.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::WebSocketConnect(_) | Self::ConnectionClosed)
    }

    /// The critical reply behind this error, if that is what it is.
    pub fn platform_response(&self) -> Option<&PlatformResponseError> {
        match self {
            Self::PlatformResponse(e) => Some(e),
            _ => None,
        }
    }
}

// ── Critical platform replies ────────────────────────────────────────

/// A platform reply whose `messageCode` is on the critical denylist.
///
/// Carries the meta fields of the rejecting envelope, so callers can
/// tell which request failed, on which component, and how.
#[derive(Debug, Clone, Error)]
pub struct PlatformResponseError {
    pub request_id: Option<RequestId>,
    pub component_id: Option<ComponentId>,
    pub message_code: MessageCode,
    pub component_state: Option<ComponentState>,
}

impl PlatformResponseError {
    /// Capture the meta block of a rejecting reply.
    pub fn from_reply(reply: &PlatformData) -> Self {
        Self {
            request_id: reply.meta.request_id.clone(),
            component_id: reply.meta.component_id,
            message_code: reply.meta.message_code,
            component_state: reply.meta.component_state,
        }
    }
}

impl fmt::Display for PlatformResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Platform replied {}", self.message_code)?;
        if let Some(id) = self.component_id {
            write!(f, " for component {id}")?;
        }
        if let Some(request_id) = &self.request_id {
            write!(f, " (request {request_id})")?;
        }
        Ok(())
    }
}
