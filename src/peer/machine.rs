//! Negotiation state machine.
//!
//! One task owns the [`PeerSession`] and processes, strictly one at a time,
//! three inputs: signaling envelopes from the relay, application commands
//! and events from the transport. Every handler runs to completion before
//! the next input is taken, which is what makes the guards below sufficient
//! without any locking.
//!
//! Guards (all ignore-and-log):
//! - an offer or answer is never applied once a remote description is set,
//!   unless the session was torn down or a new peer offers after a disconnect;
//! - an answer is only applied in `OfferSent`;
//! - a candidate is queued until a remote description exists, then checked
//!   by [`admit`] and applied at most once;
//! - events from a transport of an earlier session are dropped by epoch;
//! - envelopes carrying our own fragment (relay echo) are dropped.

use crate::commands::{Command, PeerHandle, Status};
use crate::error::PeerError;
use crate::events::EventSink;
use crate::peer::identity::{extract_fragment, session_fingerprint};
use crate::peer::ice::admit;
use crate::peer::messages::MessageChannel;
use crate::peer::presence::PresenceTracker;
use crate::peer::session::{PeerSession, SessionState};
use crate::peer::transport::{
    LinkState, PeerTransport, TransportEvent, TransportEventKind, TransportFactory,
};
use crate::peer::types::{
    ConnectivityCandidate, Message, SdpKind, SessionDescription, SignalingEnvelope, UserLeave,
};
use crate::signaling::{SignalItem, SignalSink, SignalingStream};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Candidates held while no session exists; older ones are dropped first.
const MAX_EARLY_CANDIDATES: usize = 64;

pub struct NegotiationMachine {
    factory: Arc<dyn TransportFactory>,
    signal: Option<Arc<dyn SignalSink>>,
    inbound: Option<SignalingStream>,
    events: EventSink,
    presence: PresenceTracker,
    grace_period: Duration,
    session: Option<PeerSession>,
    next_epoch: u64,
    early_candidates: VecDeque<ConnectivityCandidate>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl NegotiationMachine {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events: EventSink,
        grace_period: Duration,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            signal: None,
            inbound: None,
            events,
            presence: PresenceTracker::new(),
            grace_period,
            session: None,
            next_epoch: 0,
            early_candidates: VecDeque::new(),
            transport_tx,
            transport_rx,
        }
    }

    pub fn attach_signaling(
        &mut self,
        sink: Arc<dyn SignalSink>,
        stream: Option<SignalingStream>,
    ) {
        self.signal = Some(sink);
        self.inbound = stream;
    }

    /// Run on its own task; the returned handle drives it.
    pub fn spawn(self) -> (PeerHandle, JoinHandle<()>) {
        let (handle, commands) = PeerHandle::channel();
        (handle, tokio::spawn(self.run(commands)))
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, PeerSession::state)
    }

    pub fn session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn early_candidates(&self) -> &VecDeque<ConnectivityCandidate> {
        &self.early_candidates
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state(),
            local_id: self
                .session
                .as_ref()
                .and_then(|s| s.local_id().map(str::to_string)),
            remote_id: self
                .session
                .as_ref()
                .and_then(|s| s.remote_id().map(str::to_string)),
            reachable: self.presence.is_reachable(),
            signaling: self.inbound.is_some(),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                item = next_signal(&mut self.inbound) => self.handle_signal_item(item).await,
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event).await,
            }
        }
        self.teardown().await;
        info!("negotiation loop stopped");
    }

    async fn handle_signal_item(&mut self, item: Option<SignalItem>) {
        match item {
            Some(Ok(envelope)) => self.handle_envelope(envelope).await,
            Some(Err(err)) => {
                self.inbound = None;
                self.events.signaling_lost(err.to_string());
            }
            None => {
                self.inbound = None;
                self.events.signaling_lost("relay stream ended");
            }
        }
    }

    /// Returns `false` when the loop should stop.
    pub async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::FindPeer => self.find_peer().await,
            Command::Send { body, reply } => {
                let result = self.send_message(body).await;
                let _ = reply.send(result);
            }
            Command::Leave => self.teardown().await,
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::AttachSignaling { sink, stream } => {
                self.attach_signaling(sink, Some(stream));
                self.events.signaling_attached();
            }
            Command::Shutdown => return false,
        }
        true
    }

    // ----- local intents -----

    pub async fn find_peer(&mut self) {
        if let Some(session) = &self.session {
            if session.state().is_active() {
                debug!(state = ?session.state(), "find peer ignored, session active");
                return;
            }
        }

        self.retire_session().await;
        self.early_candidates.clear();
        if let Err(err) = self.open_session(true).await {
            self.fail_negotiation(err).await;
            return;
        }
        if let Err(err) = self.send_offer().await {
            self.fail_negotiation(err).await;
        }
    }

    async fn send_offer(&mut self) -> Result<(), PeerError> {
        let transport = self.transport()?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        if let Some(session) = self.session.as_mut() {
            session.set_local_description(offer.clone());
            info!(local_id = ?session.local_id(), "offer created");
        }
        self.transition(SessionState::OfferSent);
        self.signal(SignalingEnvelope::Offer(offer));
        Ok(())
    }

    pub async fn send_message(&mut self, body: String) -> Result<Message, PeerError> {
        let channel = self
            .session
            .as_mut()
            .and_then(PeerSession::channel_mut)
            .ok_or(PeerError::NotConnected)?;
        channel.send(body).await
    }

    /// Explicit teardown: the session moves to `Closed` and the peer is told.
    pub async fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.state() == SessionState::Closed {
            self.session = Some(session);
            return;
        }

        if let Some(local_id) = session.local_id() {
            self.signal(SignalingEnvelope::UserLeave(UserLeave {
                user_frag: local_id.to_string(),
            }));
        }

        let was_connected = session.state() == SessionState::Connected;
        session.cancel_grace_timer();
        session.clear_channel();
        close_transport(&session.transport()).await;
        session.set_state(SessionState::Closed);
        let remote_id = session.remote_id().map(str::to_string);
        self.session = Some(session);

        self.presence.transport_closed();
        self.events.state_changed(SessionState::Closed);
        if was_connected {
            self.events.disconnected(remote_id);
        }
    }

    // ----- signaling -----

    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        debug!(event = envelope.event(), state = ?self.state(), "envelope");
        match envelope {
            SignalingEnvelope::Offer(desc) => self.on_offer(desc).await,
            SignalingEnvelope::Answer(desc) => self.on_answer(desc).await,
            SignalingEnvelope::Candidate(candidate) => self.on_candidate(candidate).await,
            SignalingEnvelope::UserLeave(leave) => self.on_user_leave(&leave.user_frag).await,
        }
    }

    async fn on_offer(&mut self, desc: SessionDescription) {
        if desc.kind != SdpKind::Offer {
            warn!(kind = ?desc.kind, "offer envelope with wrong description type dropped");
            return;
        }
        let remote_fragment = extract_fragment(&desc.sdp).to_string();

        if let Some(session) = &self.session {
            if !remote_fragment.is_empty() && session.local_id() == Some(remote_fragment.as_str()) {
                debug!("own offer echoed by relay");
                return;
            }
            match session.state() {
                SessionState::Closed => {}
                // Only a fresh peer may replace a disconnected session.
                SessionState::Disconnected => {
                    if remote_fragment.is_empty()
                        || session.remote_id() == Some(remote_fragment.as_str())
                    {
                        debug!("stale offer from the previous negotiation ignored");
                        return;
                    }
                }
                state if session.remote_description().is_some() => {
                    debug!(?state, "renegotiation offer ignored");
                    return;
                }
                _ => {}
            }
            match session.state() {
                SessionState::OfferSent => {
                    let local = session.local_id().unwrap_or("");
                    if local <= remote_fragment.as_str() {
                        debug!(local, remote = %remote_fragment, "glare, keeping own offer");
                        return;
                    }
                    info!(local, remote = %remote_fragment, "glare, yielding to remote offer");
                }
                state if state.is_active() => {
                    debug!(?state, "offer ignored, session active");
                    return;
                }
                _ => {}
            }
        }

        // Candidates for this offer may already be waiting.
        let mut carried = std::mem::take(&mut self.early_candidates);
        if let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.state() == SessionState::OfferSent)
        {
            carried.extend(session.take_pending_candidates());
        }
        carried.retain(|c| remote_fragment.is_empty() || c.fragment() == remote_fragment);

        self.retire_session().await;
        if let Err(err) = self.open_session(false).await {
            self.fail_negotiation(err).await;
            return;
        }
        if let Some(session) = self.session.as_mut() {
            for candidate in carried {
                session.queue_candidate(candidate);
            }
        }
        self.transition(SessionState::OfferReceived);

        if let Err(err) = self.answer_offer(desc).await {
            self.fail_negotiation(err).await;
        }
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), PeerError> {
        let transport = self.transport()?;
        transport.set_remote_description(offer.clone()).await?;
        if let Some(session) = self.session.as_mut() {
            session.set_remote_description(offer);
        }

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        if let Some(session) = self.session.as_mut() {
            session.set_local_description(answer.clone());
            info!(local_id = ?session.local_id(), remote_id = ?session.remote_id(), "answer created");
        }
        self.signal(SignalingEnvelope::Answer(answer));
        self.transition(SessionState::AnswerSent);
        self.apply_pending_candidates().await;
        Ok(())
    }

    async fn on_answer(&mut self, desc: SessionDescription) {
        if desc.kind != SdpKind::Answer {
            warn!(kind = ?desc.kind, "answer envelope with wrong description type dropped");
            return;
        }
        let Some(session) = self.session.as_ref() else {
            debug!("answer without outstanding offer ignored");
            return;
        };
        if session.remote_description().is_some() {
            debug!(state = ?session.state(), "duplicate answer ignored");
            return;
        }
        if session.state() != SessionState::OfferSent {
            debug!(state = ?session.state(), "answer without outstanding offer ignored");
            return;
        }

        let transport = session.transport();
        if let Err(err) = transport.set_remote_description(desc.clone()).await {
            self.fail_negotiation(err).await;
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.set_remote_description(desc);
            info!(remote_id = ?session.remote_id(), "answer applied");
        }
        self.transition(SessionState::AnswerReceived);
        self.apply_pending_candidates().await;
    }

    async fn on_candidate(&mut self, candidate: ConnectivityCandidate) {
        if candidate.fragment().is_empty() {
            debug!("candidate without username fragment dropped");
            return;
        }

        let Some(session) = self.session.as_mut().filter(|s| s.state().is_active()) else {
            if self.early_candidates.len() >= MAX_EARLY_CANDIDATES {
                warn!("early candidate queue full, dropping oldest");
                self.early_candidates.pop_front();
            }
            self.early_candidates.push_back(candidate);
            return;
        };

        if session.local_id() == Some(candidate.fragment()) {
            debug!("own candidate echoed by relay");
            return;
        }
        if session.remote_description().is_none() {
            session.queue_candidate(candidate);
            debug!(
                queued = session.pending_candidates().len(),
                "candidate queued until remote description"
            );
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn apply_pending_candidates(&mut self) {
        let pending = match self.session.as_mut() {
            Some(session) => session.take_pending_candidates(),
            None => return,
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "applying queued candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: ConnectivityCandidate) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !admit(&candidate, session) {
            return;
        }
        if session.is_applied(&candidate) {
            debug!("candidate replay ignored");
            return;
        }
        let transport = session.transport();
        let line = candidate.candidate.clone();
        match transport.add_candidate(candidate).await {
            // A rejected candidate stays eligible for a later replay.
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.record_applied(line);
                }
            }
            Err(err) => warn!(error = %err, "failed to apply candidate"),
        }
    }

    async fn on_user_leave(&mut self, fragment: &str) {
        self.presence.leave(fragment);

        let Some(session) = &self.session else {
            return;
        };
        if session.remote_id() != Some(fragment) {
            debug!(fragment, "leave for another peer ignored");
            return;
        }
        match session.state() {
            SessionState::Connected | SessionState::AnswerSent | SessionState::AnswerReceived => {
                self.disconnect().await;
            }
            state => debug!(?state, "leave needs no transition"),
        }
    }

    // ----- transport -----

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(session) = self.session.as_mut() else {
            debug!(kind = ?event.kind, "transport event without session dropped");
            return;
        };
        if session.epoch() != event.epoch {
            debug!(
                epoch = event.epoch,
                current = session.epoch(),
                "stale transport event dropped"
            );
            return;
        }

        match event.kind {
            TransportEventKind::LocalCandidate(mut candidate) => {
                if !session.state().is_active() {
                    return;
                }
                if candidate.fragment().is_empty() {
                    candidate.username_fragment = session.local_id().map(str::to_string);
                }
                self.signal(SignalingEnvelope::Candidate(candidate));
            }
            TransportEventKind::Link(link) => self.on_link(link).await,
            TransportEventKind::ChannelOpen => self.on_channel_open(),
            TransportEventKind::ChannelClosed => {
                if session.state().is_active() {
                    info!("data channel closed");
                    self.disconnect().await;
                }
            }
            TransportEventKind::ChannelMessage(frame) => match session.channel_mut() {
                Some(channel) => {
                    channel.receive(&frame);
                }
                None => debug!("message without open channel dropped"),
            },
            TransportEventKind::GraceExpired => {
                if session.cancel_grace_timer() && session.state() == SessionState::Connected {
                    warn!(
                        grace_secs = self.grace_period.as_secs(),
                        "peer did not recover in time"
                    );
                    self.disconnect().await;
                }
            }
        }
    }

    async fn on_link(&mut self, link: LinkState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match link {
            LinkState::Connecting => {}
            LinkState::Connected => {
                session.mark_transport_established();
                if session.cancel_grace_timer() {
                    self.events.connection_recovered();
                }
            }
            LinkState::Disconnected => {
                if session.state() != SessionState::Connected || session.grace_pending() {
                    return;
                }
                session.transport().log_stats("BEFORE-FAIL").await;
                let epoch = session.epoch();
                let tx = self.transport_tx.clone();
                let grace = self.grace_period;
                session.arm_grace_timer(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = tx.send(TransportEvent {
                        epoch,
                        kind: TransportEventKind::GraceExpired,
                    });
                }));
                self.events.connection_problem();
            }
            LinkState::Failed | LinkState::Closed => {
                if session.state().is_active() {
                    if link == LinkState::Failed {
                        session.transport().log_stats("BEFORE-FAIL").await;
                    }
                    self.disconnect().await;
                }
            }
        }
    }

    fn on_channel_open(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.state().is_negotiated() {
            debug!(state = ?session.state(), "channel open outside negotiation ignored");
            return;
        }

        session.mark_transport_established();
        let local_id = session.local_id().unwrap_or_default().to_string();
        let remote_id = session.remote_id().unwrap_or_default().to_string();
        let (channel, messages) =
            MessageChannel::open(local_id.clone(), remote_id.clone(), session.transport());
        session.attach_channel(channel);
        session.set_state(SessionState::Connected);

        self.presence.transport_opened(&remote_id);
        self.events.state_changed(SessionState::Connected);
        let fingerprint = session_fingerprint(&local_id, &remote_id);
        self.events
            .channel_ready(local_id, remote_id, fingerprint, messages);
    }

    // ----- helpers -----

    /// `Connected`/negotiating → `Disconnected`. The session is kept so
    /// late signaling for it is still recognized and ignored.
    async fn disconnect(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.cancel_grace_timer();
        session.clear_channel();
        session.set_state(SessionState::Disconnected);
        let remote_id = session.remote_id().map(str::to_string);
        let transport = session.transport();

        self.presence.transport_closed();
        self.events.state_changed(SessionState::Disconnected);
        self.events.disconnected(remote_id);
        close_transport(&transport).await;
    }

    async fn open_session(&mut self, initiator: bool) -> Result<(), PeerError> {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let transport = self
            .factory
            .create(epoch, initiator, self.transport_tx.clone())
            .await?;
        self.presence.reset();
        debug!(epoch, initiator, "session opened");
        self.session = Some(PeerSession::new(epoch, transport));
        Ok(())
    }

    /// Drop the current session without notifying anyone.
    async fn retire_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.cancel_grace_timer();
            session.clear_channel();
            if !matches!(
                session.state(),
                SessionState::Closed | SessionState::Disconnected
            ) {
                close_transport(&session.transport()).await;
            }
        }
    }

    async fn fail_negotiation(&mut self, err: PeerError) {
        self.retire_session().await;
        self.events.negotiation_failed(err.to_string());
        self.events.state_changed(SessionState::Idle);
    }

    fn transition(&mut self, state: SessionState) {
        if let Some(session) = self.session.as_mut() {
            session.set_state(state);
            self.events.state_changed(state);
        }
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>, PeerError> {
        self.session
            .as_ref()
            .map(PeerSession::transport)
            .ok_or(PeerError::NotConnected)
    }

    fn signal(&self, envelope: SignalingEnvelope) {
        let event = envelope.event();
        match &self.signal {
            Some(sink) => {
                if let Err(err) = sink.send(envelope) {
                    warn!(event, error = %err, "signal not sent");
                }
            }
            None => warn!(event, "no signaling relay attached, signal not sent"),
        }
    }

    #[cfg(test)]
    pub(crate) async fn next_transport_event(&mut self) -> Option<TransportEvent> {
        self.transport_rx.recv().await
    }
}

async fn next_signal(inbound: &mut Option<SignalingStream>) -> Option<SignalItem> {
    match inbound {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn close_transport(transport: &Arc<dyn PeerTransport>) {
    if let Err(err) = transport.close().await {
        debug!(error = %err, "transport close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalingError;
    use crate::events::AppEvent;
    use crate::test_support::{candidate, sdp_with_fragment, MockFactory, RecordingSink};
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        machine: NegotiationMachine,
        factory: Arc<MockFactory>,
        sink: Arc<RecordingSink>,
        events: UnboundedReceiver<AppEvent>,
    }

    fn harness(fragments: &[&str]) -> Harness {
        let factory = MockFactory::with_fragments(fragments);
        let sink = Arc::new(RecordingSink::default());
        let (events, rx) = EventSink::channel();
        let mut machine =
            NegotiationMachine::new(factory.clone(), events, Duration::from_millis(20));
        machine.attach_signaling(sink.clone(), None);
        Harness {
            machine,
            factory,
            sink,
            events: rx,
        }
    }

    impl Harness {
        fn app_events(&mut self) -> Vec<AppEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }

        fn epoch(&self) -> u64 {
            self.machine.session().unwrap().epoch()
        }

        async fn transport_event(&mut self, kind: TransportEventKind) {
            let epoch = self.epoch();
            self.machine
                .handle_transport_event(TransportEvent { epoch, kind })
                .await;
        }

        /// find peer → answer from `remote` → channel open
        async fn connect_as_offerer(&mut self, remote: &str) {
            self.machine.find_peer().await;
            self.machine
                .handle_envelope(answer(remote))
                .await;
            self.transport_event(TransportEventKind::ChannelOpen).await;
            assert_eq!(self.machine.state(), SessionState::Connected);
        }
    }

    fn offer(fragment: &str) -> SignalingEnvelope {
        SignalingEnvelope::Offer(SessionDescription::offer(sdp_with_fragment(fragment)))
    }

    fn answer(fragment: &str) -> SignalingEnvelope {
        SignalingEnvelope::Answer(SessionDescription::answer(sdp_with_fragment(fragment)))
    }

    fn cand(fragment: &str, n: u8) -> SignalingEnvelope {
        SignalingEnvelope::Candidate(candidate(fragment, n))
    }

    fn leave(fragment: &str) -> SignalingEnvelope {
        SignalingEnvelope::UserLeave(UserLeave {
            user_frag: fragment.into(),
        })
    }

    fn states(events: &[AppEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                AppEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn find_peer_answer_and_open_connects() {
        let mut h = harness(&["loc1"]);
        assert_eq!(h.machine.state(), SessionState::Idle);

        h.machine.find_peer().await;
        assert_eq!(h.machine.state(), SessionState::OfferSent);
        assert_eq!(h.machine.session().unwrap().local_id(), Some("loc1"));
        assert_eq!(h.sink.events(), ["offer"]);
        assert!(h.factory.last_initiator());

        h.machine.handle_envelope(answer("abc")).await;
        assert_eq!(h.machine.state(), SessionState::AnswerReceived);
        assert_eq!(h.machine.session().unwrap().remote_id(), Some("abc"));

        h.transport_event(TransportEventKind::ChannelOpen).await;
        assert_eq!(h.machine.state(), SessionState::Connected);
        assert!(h.machine.session().unwrap().channel().is_some());
        assert!(h.machine.presence().is_reachable());

        let events = h.app_events();
        assert_eq!(
            states(&events),
            [
                SessionState::OfferSent,
                SessionState::AnswerReceived,
                SessionState::Connected
            ]
        );
        let ready = events.iter().find_map(|e| match e {
            AppEvent::ChannelReady {
                local_id,
                remote_id,
                fingerprint,
                ..
            } => Some((local_id.clone(), remote_id.clone(), fingerprint.clone())),
            _ => None,
        });
        let (local_id, remote_id, fingerprint) = ready.unwrap();
        assert_eq!(local_id, "loc1");
        assert_eq!(remote_id, "abc");
        assert_eq!(fingerprint, session_fingerprint("abc", "loc1"));
    }

    #[tokio::test]
    async fn inbound_offer_is_answered() {
        let mut h = harness(&["loc1"]);
        h.machine.handle_envelope(offer("rem")).await;

        assert_eq!(h.machine.state(), SessionState::AnswerSent);
        let session = h.machine.session().unwrap();
        assert_eq!(session.remote_id(), Some("rem"));
        assert_eq!(session.local_id(), Some("loc1"));
        assert_eq!(h.sink.events(), ["answer"]);
        assert!(!h.factory.last_initiator());
        assert_eq!(h.factory.last().remote_descriptions().len(), 1);
        assert_eq!(h.factory.last().local_descriptions()[0].kind, SdpKind::Answer);
        assert_eq!(
            states(&h.app_events()),
            [SessionState::OfferReceived, SessionState::AnswerSent]
        );
    }

    #[tokio::test]
    async fn offer_with_remote_description_set_is_ignored() {
        let mut h = harness(&["loc1", "loc2"]);
        h.machine.handle_envelope(offer("rem")).await;
        h.machine.handle_envelope(offer("other")).await;
        h.machine.handle_envelope(offer("rem")).await;

        assert_eq!(h.machine.state(), SessionState::AnswerSent);
        assert_eq!(h.machine.session().unwrap().remote_id(), Some("rem"));
        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.sink.events(), ["answer"]);
    }

    #[tokio::test]
    async fn offer_while_connected_is_ignored() {
        let mut h = harness(&["loc1", "loc2"]);
        h.connect_as_offerer("abc").await;
        h.machine.handle_envelope(offer("intruder")).await;
        assert_eq!(h.machine.state(), SessionState::Connected);
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn duplicate_answer_is_a_no_op() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(answer("abc")).await;
        h.machine.handle_envelope(answer("abc")).await;
        h.machine.handle_envelope(answer("late")).await;

        assert_eq!(h.machine.state(), SessionState::AnswerReceived);
        assert_eq!(h.machine.session().unwrap().remote_id(), Some("abc"));
        assert_eq!(h.factory.last().remote_descriptions().len(), 1);
    }

    #[tokio::test]
    async fn answer_without_offer_is_ignored() {
        let mut h = harness(&["loc1"]);
        h.machine.handle_envelope(answer("abc")).await;
        assert_eq!(h.machine.state(), SessionState::Idle);
        assert_eq!(h.factory.created(), 0);

        h.machine.handle_envelope(offer("rem")).await;
        h.machine.handle_envelope(answer("abc")).await;
        assert_eq!(h.machine.state(), SessionState::AnswerSent);
        assert_eq!(h.machine.session().unwrap().remote_id(), Some("rem"));
    }

    #[tokio::test]
    async fn description_with_wrong_type_is_dropped() {
        let mut h = harness(&["loc1"]);
        h.machine
            .handle_envelope(SignalingEnvelope::Offer(SessionDescription::answer(
                sdp_with_fragment("rem"),
            )))
            .await;
        assert_eq!(h.machine.state(), SessionState::Idle);
        assert_eq!(h.factory.created(), 0);
    }

    #[tokio::test]
    async fn early_candidates_applied_in_order_after_answer() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        for n in 1..=3 {
            h.machine.handle_envelope(cand("abc", n)).await;
        }
        assert_eq!(h.machine.session().unwrap().pending_candidates().len(), 3);
        assert!(h.factory.last().added_candidates().is_empty());

        h.machine.handle_envelope(answer("abc")).await;
        let applied = h.factory.last().added_candidates();
        assert_eq!(
            applied,
            (1..=3)
                .map(|n| candidate("abc", n).candidate)
                .collect::<Vec<_>>()
        );
        assert!(h.machine.session().unwrap().pending_candidates().is_empty());
    }

    #[tokio::test]
    async fn candidates_before_offer_carry_into_new_session() {
        let mut h = harness(&["loc1"]);
        h.machine.handle_envelope(cand("rem", 1)).await;
        h.machine.handle_envelope(cand("stale", 9)).await;
        h.machine.handle_envelope(cand("rem", 2)).await;
        assert_eq!(h.machine.early_candidates().len(), 3);

        h.machine.handle_envelope(offer("rem")).await;
        assert_eq!(
            h.factory.last().added_candidates(),
            [candidate("rem", 1).candidate, candidate("rem", 2).candidate]
        );
        assert!(h.machine.early_candidates().is_empty());
    }

    #[tokio::test]
    async fn find_peer_discards_early_candidates() {
        let mut h = harness(&["loc1"]);
        h.machine.handle_envelope(cand("rem", 1)).await;
        h.machine.find_peer().await;
        assert!(h.machine.early_candidates().is_empty());
        assert!(h.machine.session().unwrap().pending_candidates().is_empty());
    }

    #[tokio::test]
    async fn candidate_without_fragment_is_dropped() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(cand("", 1)).await;
        assert!(h.machine.session().unwrap().pending_candidates().is_empty());
    }

    #[tokio::test]
    async fn admitted_candidate_replay_is_a_no_op() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(answer("abc")).await;
        h.machine.handle_envelope(cand("abc", 1)).await;
        h.machine.handle_envelope(cand("abc", 1)).await;

        assert_eq!(h.factory.last().added_candidates().len(), 1);
        assert_eq!(h.machine.state(), SessionState::AnswerReceived);
    }

    #[tokio::test]
    async fn foreign_candidate_rejected_once_established() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(answer("abc")).await;
        h.machine.handle_envelope(cand("xyz", 1)).await;
        assert_eq!(h.factory.last().added_candidates().len(), 1);

        h.transport_event(TransportEventKind::ChannelOpen).await;
        h.machine.handle_envelope(cand("xyz", 2)).await;
        h.machine.handle_envelope(cand("abc", 3)).await;
        assert_eq!(
            h.factory.last().added_candidates(),
            [candidate("xyz", 1).candidate, candidate("abc", 3).candidate]
        );
    }

    #[tokio::test]
    async fn relay_echo_of_own_signals_is_ignored() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(offer("loc1")).await;
        h.machine.handle_envelope(cand("loc1", 1)).await;

        assert_eq!(h.machine.state(), SessionState::OfferSent);
        assert_eq!(h.factory.created(), 1);
        assert!(h.machine.session().unwrap().pending_candidates().is_empty());
    }

    #[tokio::test]
    async fn glare_greater_fragment_yields() {
        let mut h = harness(&["bbb", "bbb2"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(cand("aaa", 1)).await;
        h.machine.handle_envelope(offer("aaa")).await;

        assert_eq!(h.machine.state(), SessionState::AnswerSent);
        assert_eq!(h.factory.created(), 2);
        assert!(h.factory.nth(0).is_closed());
        assert_eq!(h.machine.session().unwrap().remote_id(), Some("aaa"));
        assert_eq!(h.factory.last().added_candidates().len(), 1);
        assert_eq!(h.sink.events(), ["offer", "answer"]);
    }

    #[tokio::test]
    async fn glare_smaller_fragment_keeps_offer() {
        let mut h = harness(&["aaa"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(offer("bbb")).await;

        assert_eq!(h.machine.state(), SessionState::OfferSent);
        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.sink.events(), ["offer"]);
    }

    #[tokio::test]
    async fn leave_for_other_peer_changes_nothing() {
        let mut h = harness(&["loc1"]);
        h.connect_as_offerer("abc").await;
        h.machine.handle_envelope(leave("zzz")).await;
        assert_eq!(h.machine.state(), SessionState::Connected);
        assert!(h.machine.presence().is_reachable());

        h.machine.handle_envelope(leave("abc")).await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert!(!h.machine.presence().is_reachable());
        assert!(h.machine.session().unwrap().channel().is_none());
        assert!(h.factory.last().is_closed());
        assert!(h.app_events().iter().any(|e| matches!(
            e,
            AppEvent::Disconnected { remote_id: Some(r) } if r == "abc"
        )));
    }

    #[tokio::test]
    async fn leave_during_negotiation_disconnects() {
        let mut h = harness(&["loc1"]);
        h.machine.handle_envelope(offer("rem")).await;
        h.machine.handle_envelope(leave("rem")).await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn channel_close_disconnects_and_keeps_session() {
        let mut h = harness(&["loc1", "loc2"]);
        h.connect_as_offerer("abc").await;
        h.transport_event(TransportEventKind::ChannelClosed).await;

        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert_eq!(h.machine.session().unwrap().remote_id(), Some("abc"));
        assert!(matches!(
            h.machine.send_message("hi".into()).await,
            Err(PeerError::NotConnected)
        ));

        // stale replay of the old negotiation
        h.machine.handle_envelope(answer("abc")).await;
        h.machine.handle_envelope(offer("abc")).await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert_eq!(h.factory.created(), 1);

        h.machine.find_peer().await;
        assert_eq!(h.machine.state(), SessionState::OfferSent);
        assert_eq!(h.machine.session().unwrap().local_id(), Some("loc2"));
    }

    #[tokio::test]
    async fn disconnected_session_answers_fresh_peer() {
        let mut h = harness(&["loc1", "loc2"]);
        h.connect_as_offerer("abc").await;
        h.transport_event(TransportEventKind::ChannelClosed).await;

        h.machine.handle_envelope(offer("abc")).await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert_eq!(h.factory.created(), 1);

        h.machine.handle_envelope(offer("def")).await;
        assert_eq!(h.machine.state(), SessionState::AnswerSent);
        assert_eq!(h.factory.created(), 2);
        assert!(!h.factory.last_initiator());
        assert_eq!(h.machine.session().unwrap().remote_id(), Some("def"));
        assert_eq!(h.machine.session().unwrap().local_id(), Some("loc2"));
        assert!(matches!(
            h.sink.sent().last(),
            Some(SignalingEnvelope::Answer(_))
        ));
    }

    #[tokio::test]
    async fn both_sides_reconnect_after_channel_loss() {
        // A offered first, B answered; then the channel dropped on both.
        let mut a = harness(&["aaa1", "aaa2"]);
        let mut b = harness(&["bbb1", "bbb2"]);
        a.connect_as_offerer("bbb1").await;
        b.machine.handle_envelope(offer("aaa1")).await;
        b.transport_event(TransportEventKind::ChannelOpen).await;
        assert_eq!(b.machine.state(), SessionState::Connected);

        a.transport_event(TransportEventKind::ChannelClosed).await;
        b.transport_event(TransportEventKind::ChannelClosed).await;

        a.machine.find_peer().await;
        assert_eq!(a.machine.state(), SessionState::OfferSent);
        b.machine.handle_envelope(offer("aaa2")).await;
        assert_eq!(b.machine.state(), SessionState::AnswerSent);
        a.machine.handle_envelope(answer("bbb2")).await;
        assert_eq!(a.machine.state(), SessionState::AnswerReceived);

        a.transport_event(TransportEventKind::ChannelOpen).await;
        b.transport_event(TransportEventKind::ChannelOpen).await;
        assert_eq!(a.machine.state(), SessionState::Connected);
        assert_eq!(b.machine.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn offer_after_teardown_starts_new_session() {
        let mut h = harness(&["loc1", "loc2"]);
        h.connect_as_offerer("abc").await;
        h.machine.teardown().await;

        h.machine.handle_envelope(offer("def")).await;
        assert_eq!(h.machine.state(), SessionState::AnswerSent);
        assert_eq!(h.machine.session().unwrap().remote_id(), Some("def"));
        assert_eq!(h.machine.session().unwrap().local_id(), Some("loc2"));
    }

    #[tokio::test]
    async fn sent_message_echo_is_deduplicated() {
        let mut h = harness(&["A"]);
        h.connect_as_offerer("B").await;

        let sent = h.machine.send_message("hi".into()).await.unwrap();
        assert_eq!(sent.from_id, "A");
        assert_eq!(sent.to_id, "B");
        let frame = h.factory.last().sent_texts().pop().unwrap();
        h.transport_event(TransportEventKind::ChannelMessage(frame))
            .await;

        let m1 = r#"{"id":"m1","fromId":"B","toId":"A","createdAt":"2024-05-01T10:00:00Z","body":"hi"}"#;
        h.transport_event(TransportEventKind::ChannelMessage(m1.into()))
            .await;
        h.transport_event(TransportEventKind::ChannelMessage(m1.into()))
            .await;

        let history = h.machine.session().unwrap().channel().unwrap().history();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|m| m.id == sent.id).count(), 1);
        assert_eq!(history.iter().filter(|m| m.id == "m1").count(), 1);
    }

    #[tokio::test]
    async fn received_messages_reach_the_stream() {
        let mut h = harness(&["A"]);
        h.connect_as_offerer("B").await;
        let mut stream = h
            .app_events()
            .into_iter()
            .find_map(|e| match e {
                AppEvent::ChannelReady { messages, .. } => Some(messages),
                _ => None,
            })
            .unwrap();

        let m1 = r#"{"id":"m1","fromId":"B","toId":"A","createdAt":"2024-05-01T10:00:00Z","body":"hi"}"#;
        h.transport_event(TransportEventKind::ChannelMessage(m1.into()))
            .await;
        assert_eq!(stream.recv().await.unwrap().body, "hi");

        h.transport_event(TransportEventKind::ChannelClosed).await;
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn offer_failure_returns_to_idle() {
        let mut h = harness(&["loc1", "loc2"]);
        h.factory.fail_offer.store(true, Ordering::SeqCst);
        h.machine.find_peer().await;

        assert_eq!(h.machine.state(), SessionState::Idle);
        assert!(h.factory.last().is_closed());
        assert!(h.sink.sent().is_empty());
        let events = h.app_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, AppEvent::NegotiationFailed(_))));
        assert_eq!(states(&events).last(), Some(&SessionState::Idle));

        h.factory.fail_offer.store(false, Ordering::SeqCst);
        h.machine.find_peer().await;
        assert_eq!(h.machine.state(), SessionState::OfferSent);
    }

    #[tokio::test]
    async fn answer_failure_returns_to_idle() {
        let mut h = harness(&["loc1"]);
        h.factory.fail_answer.store(true, Ordering::SeqCst);
        h.machine.handle_envelope(offer("rem")).await;
        assert_eq!(h.machine.state(), SessionState::Idle);
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn transport_creation_failure_returns_to_idle() {
        let mut h = harness(&[]);
        h.factory.fail_create.store(true, Ordering::SeqCst);
        h.machine.find_peer().await;
        assert_eq!(h.machine.state(), SessionState::Idle);
        assert!(h
            .app_events()
            .iter()
            .any(|e| matches!(e, AppEvent::NegotiationFailed(_))));
    }

    #[tokio::test]
    async fn events_from_old_transport_are_dropped() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(answer("abc")).await;
        let stale = h.epoch() + 7;
        h.machine
            .handle_transport_event(TransportEvent {
                epoch: stale,
                kind: TransportEventKind::ChannelOpen,
            })
            .await;
        assert_eq!(h.machine.state(), SessionState::AnswerReceived);
    }

    #[tokio::test]
    async fn channel_open_before_answer_is_ignored() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.transport_event(TransportEventKind::ChannelOpen).await;
        assert_eq!(h.machine.state(), SessionState::OfferSent);
    }

    #[tokio::test]
    async fn local_candidates_are_trickled_with_fragment() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        let mut local = candidate("", 4);
        local.username_fragment = None;
        h.transport_event(TransportEventKind::LocalCandidate(local))
            .await;

        let sent = h.sink.sent();
        let Some(SignalingEnvelope::Candidate(c)) = sent.last() else {
            panic!("expected a candidate envelope, got {sent:?}");
        };
        assert_eq!(c.fragment(), "loc1");
    }

    #[tokio::test]
    async fn teardown_closes_and_announces_leave() {
        let mut h = harness(&["loc1", "loc2"]);
        h.connect_as_offerer("abc").await;
        h.machine.teardown().await;

        assert_eq!(h.machine.state(), SessionState::Closed);
        assert!(h.factory.last().is_closed());
        assert_eq!(
            h.sink.sent().last(),
            Some(&SignalingEnvelope::UserLeave(UserLeave {
                user_frag: "loc1".into()
            }))
        );

        h.machine.find_peer().await;
        assert_eq!(h.machine.state(), SessionState::OfferSent);
        assert_eq!(h.factory.created(), 2);
    }

    #[tokio::test]
    async fn transient_disconnect_recovers_within_grace() {
        let mut h = harness(&["loc1"]);
        h.connect_as_offerer("abc").await;
        h.app_events();

        h.transport_event(TransportEventKind::Link(LinkState::Disconnected))
            .await;
        assert!(h.machine.session().unwrap().grace_pending());
        h.transport_event(TransportEventKind::Link(LinkState::Connected))
            .await;

        assert_eq!(h.machine.state(), SessionState::Connected);
        assert!(!h.machine.session().unwrap().grace_pending());
        let events = h.app_events();
        assert!(matches!(events[0], AppEvent::ConnectionProblem));
        assert!(matches!(events[1], AppEvent::ConnectionRecovered));
    }

    #[tokio::test]
    async fn grace_expiry_disconnects() {
        let mut h = harness(&["loc1"]);
        h.connect_as_offerer("abc").await;
        h.transport_event(TransportEventKind::Link(LinkState::Disconnected))
            .await;

        let expired = tokio::time::timeout(Duration::from_secs(2), h.machine.next_transport_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.kind, TransportEventKind::GraceExpired);
        h.machine.handle_transport_event(expired).await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_link_disconnects_immediately() {
        let mut h = harness(&["loc1"]);
        h.connect_as_offerer("abc").await;
        h.transport_event(TransportEventKind::Link(LinkState::Failed))
            .await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_link_during_negotiation_allows_retry() {
        let mut h = harness(&["loc1", "loc2"]);
        h.machine.handle_envelope(offer("rem")).await;
        assert_eq!(h.machine.state(), SessionState::AnswerSent);

        h.transport_event(TransportEventKind::Link(LinkState::Failed))
            .await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert!(h.factory.last().is_closed());
        assert!(h
            .app_events()
            .iter()
            .any(|e| matches!(e, AppEvent::Disconnected { .. })));

        h.machine.find_peer().await;
        assert_eq!(h.machine.state(), SessionState::OfferSent);
        assert_eq!(h.factory.created(), 2);
    }

    #[tokio::test]
    async fn channel_close_before_open_disconnects() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(answer("abc")).await;
        assert_eq!(h.machine.state(), SessionState::AnswerReceived);

        h.transport_event(TransportEventKind::ChannelClosed).await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn closed_link_after_disconnect_is_a_no_op() {
        let mut h = harness(&["loc1"]);
        h.connect_as_offerer("abc").await;
        h.transport_event(TransportEventKind::ChannelClosed).await;
        h.app_events();

        h.transport_event(TransportEventKind::Link(LinkState::Closed))
            .await;
        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert!(h.app_events().is_empty());
    }

    #[tokio::test]
    async fn rejected_candidate_is_retried_on_replay() {
        let mut h = harness(&["loc1"]);
        h.machine.find_peer().await;
        h.machine.handle_envelope(answer("abc")).await;
        h.factory.last().fail_next_candidates(1);

        h.machine.handle_envelope(cand("abc", 1)).await;
        assert!(h.factory.last().added_candidates().is_empty());
        assert_eq!(h.machine.session().unwrap().applied_count(), 0);

        h.machine.handle_envelope(cand("abc", 1)).await;
        h.machine.handle_envelope(cand("abc", 1)).await;
        assert_eq!(h.factory.last().added_candidates().len(), 1);
        assert_eq!(h.machine.session().unwrap().applied_count(), 1);
    }

    #[tokio::test]
    async fn early_candidate_queue_drops_oldest() {
        let mut h = harness(&["loc1"]);
        for n in 0..=MAX_EARLY_CANDIDATES as u8 {
            h.machine.handle_envelope(cand("rem", n)).await;
        }
        let early = h.machine.early_candidates();
        assert_eq!(early.len(), MAX_EARLY_CANDIDATES);
        assert_eq!(early.front(), Some(&candidate("rem", 1)));
        assert_eq!(
            early.back(),
            Some(&candidate("rem", MAX_EARLY_CANDIDATES as u8))
        );
    }

    #[tokio::test]
    async fn run_loop_processes_signals_and_commands() {
        let factory = MockFactory::with_fragments(&["loc1"]);
        let sink = Arc::new(RecordingSink::default());
        let (events, mut app) = EventSink::channel();
        let (signals, stream) = SignalingStream::channel();
        let mut machine = NegotiationMachine::new(factory.clone(), events, Duration::from_secs(1));
        machine.attach_signaling(sink.clone(), Some(stream));
        let (handle, task) = machine.spawn();

        signals.send(Ok(offer("rem"))).unwrap();
        let status = loop {
            let status = handle.status().await.unwrap();
            if status.state == SessionState::AnswerSent {
                break status;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(status.remote_id.as_deref(), Some("rem"));
        assert!(status.signaling);

        signals.send(Err(SignalingError::Closed)).unwrap();
        loop {
            match app.recv().await.unwrap() {
                AppEvent::SignalingLost(_) => break,
                _ => continue,
            }
        }
        assert!(!handle.status().await.unwrap().signaling);
        assert!(matches!(
            handle.send_text("hi").await,
            Err(PeerError::NotConnected)
        ));

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert_eq!(sink.events(), ["answer", "userLeave"]);
        assert!(handle.find_peer().is_err());
    }

}
