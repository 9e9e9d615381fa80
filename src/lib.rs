pub mod bundle;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod peer;
pub mod signaling;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use commands::{PeerHandle, Status};
pub use config::Settings;
pub use error::{ConfigError, PeerError, SignalingError};
pub use events::{AppEvent, EventSink};
pub use peer::{NegotiationMachine, RtcTransportFactory, SessionState};
pub use signaling::{SignalSink, SignalingClient, SignalingStream};
