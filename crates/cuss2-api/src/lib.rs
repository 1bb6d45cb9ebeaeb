// cuss2-api: Async wire-level client for the IATA CUSS2 kiosk platform
// (JSON envelopes, OAuth token exchange, correlated WebSocket transport)

pub mod error;
pub mod model;
pub mod socket;
pub mod token;

pub use error::Error;
