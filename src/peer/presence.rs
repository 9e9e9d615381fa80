use tokio::sync::watch;
use tracing::{debug, info};

/// What the application sees about the remote peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub reachable: bool,
    pub remote_id: Option<String>,
}

/// Publishes [`Presence`] changes to any number of watchers.
pub struct PresenceTracker {
    tx: watch::Sender<Presence>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Presence::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Presence> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Presence {
        self.tx.borrow().clone()
    }

    pub fn is_reachable(&self) -> bool {
        self.tx.borrow().reachable
    }

    pub fn transport_opened(&self, remote_id: &str) {
        info!(remote_id, "peer reachable");
        self.tx.send_replace(Presence {
            reachable: true,
            remote_id: Some(remote_id.to_string()),
        });
    }

    pub fn transport_closed(&self) {
        self.tx.send_if_modified(|p| {
            let changed = p.reachable;
            p.reachable = false;
            changed
        });
    }

    /// Handles a leave notice. Returns `true` if it named the current peer.
    pub fn leave(&self, fragment: &str) -> bool {
        let matches = self.tx.borrow().remote_id.as_deref() == Some(fragment);
        if !matches {
            debug!(fragment, "leave for unknown peer ignored");
            return false;
        }
        info!(fragment, "peer left");
        self.transport_closed();
        true
    }

    /// Forget the peer entirely, e.g. when a new session starts.
    pub fn reset(&self) {
        self.tx.send_if_modified(|p| {
            let changed = *p != Presence::default();
            *p = Presence::default();
            changed
        });
    }
}
