//! Client side of the signaling relay.
//!
//! The relay forwards JSON envelopes between the peers of a topic. Outbound
//! sends never block; inbound envelopes arrive on a [`SignalingStream`] that
//! yields a single `Err` when the connection dies. Reconnecting is left to
//! the caller.

use crate::error::SignalingError;
use crate::peer::types::SignalingEnvelope;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

pub type SignalItem = Result<SignalingEnvelope, SignalingError>;

/// Outbound half of a signaling connection.
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError>;
}

impl SignalSink for mpsc::UnboundedSender<SignalingEnvelope> {
    fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        mpsc::UnboundedSender::send(self, envelope).map_err(|_| SignalingError::Closed)
    }
}

/// Inbound envelopes in arrival order.
pub struct SignalingStream {
    rx: mpsc::UnboundedReceiver<SignalItem>,
}

impl SignalingStream {
    /// A stream fed by hand, e.g. from pasted tokens or a test.
    pub fn channel() -> (mpsc::UnboundedSender<SignalItem>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<SignalItem> {
        self.rx.recv().await
    }
}

pub fn parse_envelope(text: &str) -> Result<SignalingEnvelope, serde_json::Error> {
    serde_json::from_str(text)
}

/// WebSocket connection to the relay.
#[derive(Clone)]
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<(Self, SignalingStream), SignalingError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        info!(%url, "connected to signaling relay");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let (in_tx, stream) = SignalingStream::channel();

        let writer_errors = in_tx.clone();
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "cannot encode envelope");
                        continue;
                    }
                };
                debug!(event = envelope.event(), "signal out");
                if let Err(err) = ws_sender.send(WsMessage::Text(text)).await {
                    let _ = writer_errors.send(Err(SignalingError::Transport(err.to_string())));
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("dropping non-UTF-8 signaling frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = in_tx.send(Err(SignalingError::Transport(err.to_string())));
                        return;
                    }
                };

                match parse_envelope(&text) {
                    Ok(envelope) => {
                        debug!(event = envelope.event(), "signal in");
                        if in_tx.send(Ok(envelope)).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(error = %err, "dropping malformed envelope"),
                }
            }
            let _ = in_tx.send(Err(SignalingError::Closed));
        });

        Ok((Self { tx: out_tx }, stream))
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.tx.send(envelope).map_err(|_| SignalingError::Closed)
    }
}
