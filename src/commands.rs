use crate::error::PeerError;
use crate::peer::session::SessionState;
use crate::peer::types::Message;
use crate::signaling::{SignalSink, SignalingStream};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Snapshot of the negotiation, answered by [`PeerHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: SessionState,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    pub reachable: bool,
    pub signaling: bool,
}

/// Intents the application hands to the negotiation loop.
pub enum Command {
    FindPeer,
    Send {
        body: String,
        reply: oneshot::Sender<Result<Message, PeerError>>,
    },
    Leave,
    Status(oneshot::Sender<Status>),
    AttachSignaling {
        sink: Arc<dyn SignalSink>,
        stream: SignalingStream,
    },
    Shutdown,
}

/// Cloneable handle to a running [`NegotiationMachine`](crate::peer::machine::NegotiationMachine).
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PeerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn submit(&self, command: Command) -> Result<(), PeerError> {
        self.tx.send(command).map_err(|_| PeerError::Stopped)
    }

    /// Start looking for a peer by broadcasting an offer.
    pub fn find_peer(&self) -> Result<(), PeerError> {
        self.submit(Command::FindPeer)
    }

    /// Send a chat message; resolves once the frame is written.
    pub async fn send_text(&self, body: impl Into<String>) -> Result<Message, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Send {
            body: body.into(),
            reply,
        })?;
        rx.await.map_err(|_| PeerError::Stopped)?
    }

    /// Close the current session and tell the peer.
    pub fn leave(&self) -> Result<(), PeerError> {
        self.submit(Command::Leave)
    }

    pub async fn status(&self) -> Result<Status, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Status(reply))?;
        rx.await.map_err(|_| PeerError::Stopped)
    }

    /// Swap in a fresh relay connection, e.g. after the user asked to retry.
    pub fn attach_signaling(
        &self,
        sink: Arc<dyn SignalSink>,
        stream: SignalingStream,
    ) -> Result<(), PeerError> {
        self.submit(Command::AttachSignaling { sink, stream })
    }

    pub fn shutdown(&self) -> Result<(), PeerError> {
        self.submit(Command::Shutdown)
    }
}
