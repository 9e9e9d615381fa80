use crate::peer::identity::fragment_id;
use crate::peer::messages::MessageChannel;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{ConnectivityCandidate, SessionDescription};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Disconnected,
    Closed,
}

impl SessionState {
    /// A session in this state blocks a new one from being created.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            SessionState::Idle | SessionState::Disconnected | SessionState::Closed
        )
    }

    pub fn is_negotiated(self) -> bool {
        matches!(self, SessionState::AnswerSent | SessionState::AnswerReceived)
    }
}

/// Negotiation state for the one remote peer.
///
/// Invariants:
/// - `remote_description` is set at most once.
/// - `pending_candidates` is only non-empty while `remote_description` is `None`.
/// - `channel` is `Some` iff `state == Connected`.
pub struct PeerSession {
    epoch: u64,
    state: SessionState,
    local_id: Option<String>,
    remote_id: Option<String>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<ConnectivityCandidate>,
    applied_candidates: HashSet<String>,
    transport: Arc<dyn PeerTransport>,
    transport_established: bool,
    channel: Option<MessageChannel>,
    grace_timer: Option<JoinHandle<()>>,
}

impl PeerSession {
    pub fn new(epoch: u64, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            epoch,
            state: SessionState::Idle,
            local_id: None,
            remote_id: None,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            applied_candidates: HashSet::new(),
            transport,
            transport_established: false,
            channel: None,
            grace_timer: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    pub fn transport_established(&self) -> bool {
        self.transport_established
    }

    pub(crate) fn mark_transport_established(&mut self) {
        self.transport_established = true;
    }

    /// Records the local description and derives `local_id` from it.
    pub(crate) fn set_local_description(&mut self, desc: SessionDescription) {
        self.local_id = fragment_id(&desc.sdp);
        self.local_description = Some(desc);
    }

    /// Records the remote description and derives `remote_id` from it.
    pub(crate) fn set_remote_description(&mut self, desc: SessionDescription) {
        self.remote_id = fragment_id(&desc.sdp);
        self.remote_description = Some(desc);
    }

    pub fn pending_candidates(&self) -> &[ConnectivityCandidate] {
        &self.pending_candidates
    }

    pub(crate) fn queue_candidate(&mut self, candidate: ConnectivityCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub(crate) fn take_pending_candidates(&mut self) -> Vec<ConnectivityCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn is_applied(&self, candidate: &ConnectivityCandidate) -> bool {
        self.applied_candidates.contains(&candidate.candidate)
    }

    /// Remember a candidate line the engine accepted.
    pub(crate) fn record_applied(&mut self, line: String) {
        self.applied_candidates.insert(line);
    }

    pub fn applied_count(&self) -> usize {
        self.applied_candidates.len()
    }

    pub fn channel(&self) -> Option<&MessageChannel> {
        self.channel.as_ref()
    }

    pub(crate) fn channel_mut(&mut self) -> Option<&mut MessageChannel> {
        self.channel.as_mut()
    }

    pub(crate) fn attach_channel(&mut self, channel: MessageChannel) {
        self.channel = Some(channel);
    }

    /// Drops the channel; this ends the inbound message stream.
    pub(crate) fn clear_channel(&mut self) -> Option<MessageChannel> {
        self.channel.take()
    }

    pub(crate) fn arm_grace_timer(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.grace_timer.replace(handle) {
            old.abort();
        }
    }

    /// Returns `true` if a timer was pending.
    pub(crate) fn cancel_grace_timer(&mut self) -> bool {
        match self.grace_timer.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn grace_pending(&self) -> bool {
        self.grace_timer.is_some()
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel_grace_timer();
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("epoch", &self.epoch)
            .field("state", &self.state)
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("transport_established", &self.transport_established)
            .field("channel", &self.channel.is_some())
            .finish()
    }
}
