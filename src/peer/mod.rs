pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod identity;
pub mod machine;
pub mod messages;
pub mod presence;
pub mod session;
pub mod transport;
pub mod types;

pub use connection::RtcTransportFactory;
pub use machine::NegotiationMachine;
pub use session::{PeerSession, SessionState};
pub use types::{ConnectivityCandidate, Message, ServerConfig, SessionDescription, SignalingEnvelope};
