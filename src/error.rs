use thiserror::Error;

/// Failures of the signaling relay connection.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay transport error: {0}")]
    Transport(String),
    #[error("relay connection closed")]
    Closed,
    #[error("envelope encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid signaling token: {0}")]
    Token(String),
}

/// Failures surfaced by the peer connection and message channel.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no data channel")]
    NoChannel,
    #[error("peer not connected")]
    NotConnected,
    #[error("negotiation loop stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid signaling url {url}: {reason}")]
    SignalingUrl { url: String, reason: String },
    #[error("ICE server url cannot be empty")]
    EmptyIceUrl,
    #[error("TURN server {0} requires username and credential")]
    TurnCredentials(String),
    #[error("invalid ICE server list: {0}")]
    IceServers(#[from] serde_json::Error),
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid {name}: {value}")]
    Env { name: &'static str, value: String },
}
