// cuss2-core: CUSS2 kiosk client runtime (session lifecycle, application
// state machine, peripheral model) on top of cuss2-api.

pub mod classify;
pub mod client;
pub mod component;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod state;
pub mod stream;

// ── Primary re-exports ───────────────────────────────────────────────
pub use classify::{DeviceClassifier, DeviceRole, StandardClassifier};
pub use client::PlatformClient;
pub use component::{
    Announcement, CardReader, Component, ComponentArena, DataReader, Printer, PrinterLinks,
};
pub use config::{ClientConfig, ReconnectConfig};
pub use error::CoreError;
pub use events::ClientEvent;
pub use session::{
    Connect, Established, PlatformConnector, Session, SessionEvent, SessionState,
};
pub use state::{Activation, StateChange};
pub use stream::StateStream;

// Re-export the wire types applications actually touch, so most of
// them never import cuss2-api directly.
pub use cuss2_api::error::PlatformResponseError;
pub use cuss2_api::model::{
    ApplicationData, ApplicationState, ComponentId, ComponentState, DataRecord, DataType,
    MediaType, MessageCode, PlatformData,
};
pub use cuss2_api::socket::SocketConfig;
