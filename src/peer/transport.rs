//! The narrow capability the negotiation machine drives.
//!
//! `PeerTransport` is one peer connection plus its data channel. The engine
//! behind it reports everything asynchronous (channel open, inbound frames,
//! gathered candidates) as [`TransportEvent`]s tagged with the session epoch
//! they were created for, so the machine can drop events from a transport it
//! has already replaced.

use crate::error::PeerError;
use crate::peer::types::{ConnectivityCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Coarse peer connection state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Transient loss; may recover on its own.
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    LocalCandidate(ConnectivityCandidate),
    Link(LinkState),
    ChannelOpen,
    ChannelClosed,
    ChannelMessage(String),
    /// Grace timer armed on a transient disconnect has fired.
    GraceExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub epoch: u64,
    pub kind: TransportEventKind,
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError>;
    async fn send_text(&self, text: String) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;

    /// Dump transport diagnostics before the link is given up.
    async fn log_stats(&self, _moment: &str) {}
}

/// Builds one transport per session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// `initiator` owns the data channel; the responder waits for it.
    async fn create(
        &self,
        epoch: u64,
        initiator: bool,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}
