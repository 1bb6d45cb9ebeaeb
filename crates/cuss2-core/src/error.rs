// ── Core error types ──
//
// Domain-facing errors from cuss2-core. Consumers never see raw
// transport failures directly -- the `From<cuss2_api::Error>` impl
// translates wire-layer errors into domain-appropriate variants, and
// critical platform replies surface with their meta intact.

use std::time::Duration;

use thiserror::Error;

use cuss2_api::error::PlatformResponseError;
use cuss2_api::model::{ApplicationState, ComponentId, MessageCode};

use crate::classify::DeviceRole;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Session / lifecycle ──────────────────────────────────────────
    /// The platform reported no usable application state, or `SUSPENDED`,
    /// during initialization.
    #[error("Platform reports abnormal application state: {state:?}")]
    AbnormalState { state: Option<ApplicationState> },

    /// A requested state transition was never confirmed by the platform.
    #[error("Platform did not confirm {state} within {timeout:?}")]
    ConfirmationTimeout {
        state: ApplicationState,
        timeout: Duration,
    },

    /// No live connection to the platform.
    #[error("Not connected to the platform")]
    Disconnected,

    // ── Components ───────────────────────────────────────────────────
    /// The component id is not in the platform's component list.
    #[error("Component {id} not present in the platform component list")]
    ComponentNotFound { id: ComponentId },

    /// A printer descriptor lacks one of its linked halves.
    #[error("Printer {printer} has no linked {missing} component")]
    LinkMissing {
        printer: ComponentId,
        missing: DeviceRole,
    },

    /// A read window elapsed without the device presenting data.
    #[error("No data on component {component} within {timeout:?}")]
    ReadTimeout {
        component: ComponentId,
        timeout: Duration,
    },

    // ── Requests ─────────────────────────────────────────────────────
    /// Caller-supplied input was rejected before reaching the wire.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The platform answered a request with a critical message code.
    #[error(transparent)]
    Platform(#[from] PlatformResponseError),

    // ── Transport (wrapped) ──────────────────────────────────────────
    /// Wire-layer failure that has no domain translation.
    #[error(transparent)]
    Transport(cuss2_api::Error),
}

impl CoreError {
    /// The critical platform code behind this error, if that is what it
    /// is. Used to tolerate benign rejections such as `OUTOFSEQUENCE` on
    /// disable.
    pub fn platform_code(&self) -> Option<MessageCode> {
        match self {
            Self::Platform(e) => Some(e.message_code),
            _ => None,
        }
    }

    /// Whether the connection is gone and the operation should be
    /// retried after the session reconnects.
    pub fn is_disconnected(&self) -> bool {
        match self {
            Self::Disconnected => true,
            Self::Transport(e) => e.is_connection_loss(),
            _ => false,
        }
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<cuss2_api::Error> for CoreError {
    fn from(err: cuss2_api::Error) -> Self {
        match err {
            cuss2_api::Error::PlatformResponse(e) => CoreError::Platform(e),
            cuss2_api::Error::ConnectionClosed => CoreError::Disconnected,
            other => CoreError::Transport(other),
        }
    }
}
