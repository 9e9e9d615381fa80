use crate::peer::messages::MessageStream;
use crate::peer::session::SessionState;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notifications for the application layer.
#[derive(Debug)]
pub enum AppEvent {
    StateChanged(SessionState),
    /// The data channel is open; `messages` yields what the peer sends.
    ChannelReady {
        local_id: String,
        remote_id: String,
        fingerprint: String,
        messages: MessageStream,
    },
    Disconnected {
        remote_id: Option<String>,
    },
    ConnectionProblem,
    ConnectionRecovered,
    NegotiationFailed(String),
    SignalingLost(String),
    SignalingAttached,
}

/// Sending half handed to the machine; a gone receiver is not an error.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: AppEvent) {
        if self.tx.send(event).is_err() {
            debug!("application event receiver dropped");
        }
    }

    pub fn state_changed(&self, state: SessionState) {
        debug!(?state, "session state changed");
        self.emit(AppEvent::StateChanged(state));
    }

    pub fn channel_ready(
        &self,
        local_id: String,
        remote_id: String,
        fingerprint: String,
        messages: MessageStream,
    ) {
        info!(%local_id, %remote_id, %fingerprint, "peer connected");
        self.emit(AppEvent::ChannelReady {
            local_id,
            remote_id,
            fingerprint,
            messages,
        });
    }

    pub fn disconnected(&self, remote_id: Option<String>) {
        info!(?remote_id, "peer disconnected");
        self.emit(AppEvent::Disconnected { remote_id });
    }

    pub fn connection_problem(&self) {
        warn!("connection problem, waiting for recovery");
        self.emit(AppEvent::ConnectionProblem);
    }

    pub fn connection_recovered(&self) {
        info!("connection recovered");
        self.emit(AppEvent::ConnectionRecovered);
    }

    pub fn negotiation_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "negotiation failed");
        self.emit(AppEvent::NegotiationFailed(reason));
    }

    pub fn signaling_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "signaling relay lost");
        self.emit(AppEvent::SignalingLost(reason));
    }

    pub fn signaling_attached(&self) {
        self.emit(AppEvent::SignalingAttached);
    }
}
