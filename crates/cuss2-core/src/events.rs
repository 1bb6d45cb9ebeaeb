// ── Client events ──
//
// Everything observable about a running client, delivered on one
// broadcast stream. Watch channels carry the state-shaped values
// (application state, component readiness); this stream carries the
// discrete edges.

use serde_json::Value;

use cuss2_api::model::{ApplicationActivation, ApplicationState, ComponentId};

use crate::state::StateChange;

/// Discrete events published by [`PlatformClient`](crate::PlatformClient).
///
/// Delivered on a `tokio::sync::broadcast` channel that survives
/// reconnects; a lagged subscriber loses the oldest events, never the
/// stream itself.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The platform confirmed an application-state transition.
    StateChanged(StateChange),

    /// A component's readiness or status track changed.
    ComponentChanged(ComponentId),

    /// The application entered `ACTIVE` and may drive peripherals.
    Activated(ApplicationActivation),

    /// The application left `ACTIVE`; the new state is attached.
    Deactivated(ApplicationState),

    /// A dispenser's media-present track flipped.
    MediaPresent {
        component: ComponentId,
        present: bool,
    },

    /// The platform reported `SESSIONTIMEOUT` on an inbound envelope.
    SessionTimeout,

    /// Platform-initiated ping (already answered at the socket layer).
    Ping { timestamp: i64 },

    /// Acknowledgement of a fire-and-forget send.
    Ack { code: Value },
}
