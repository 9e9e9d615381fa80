use crate::error::PeerError;
use crate::peer::transport::PeerTransport;
use crate::peer::types::Message;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Chat over an open data channel.
///
/// Every id this side has seen, sent or received, is remembered for the life
/// of the channel; a frame carrying a known id is dropped.
pub struct MessageChannel {
    local_id: String,
    remote_id: String,
    transport: Arc<dyn PeerTransport>,
    seen: HashSet<String>,
    history: Vec<Message>,
    inbound: mpsc::UnboundedSender<Message>,
}

/// Messages received from the peer. Ends when the channel is dropped.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

impl MessageChannel {
    pub fn open(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
    ) -> (Self, MessageStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            transport,
            seen: HashSet::new(),
            history: Vec::new(),
            inbound: tx,
        };
        (channel, MessageStream { rx })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Local history in the order messages were sent or accepted.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Sends `body` to the peer.
    ///
    /// The message is recorded in history before the frame is written, so it
    /// stays there even if the write fails.
    pub async fn send(&mut self, body: impl Into<String>) -> Result<Message, PeerError> {
        let message = Message::new(&self.local_id, &self.remote_id, body);
        self.seen.insert(message.id.clone());
        self.history.push(message.clone());

        let frame = serde_json::to_string(&message)?;
        self.transport.send_text(frame).await?;
        debug!(id = %message.id, "message sent");
        Ok(message)
    }

    /// Accepts one inbound frame. Returns the message if it was new.
    pub fn receive(&mut self, frame: &str) -> Option<Message> {
        let message = match serde_json::from_str::<Message>(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, len = frame.len(), "dropping malformed message frame");
                return None;
            }
        };

        if !self.seen.insert(message.id.clone()) {
            debug!(id = %message.id, "duplicate message dropped");
            return None;
        }

        self.history.push(message.clone());
        // The app may have stopped reading; history still has it.
        let _ = self.inbound.send(message.clone());
        Some(message)
    }
}
