//! Scripted stand-ins for the WebRTC engine and the relay.

use crate::error::{PeerError, SignalingError};
use crate::peer::transport::{PeerTransport, TransportEvents, TransportFactory};
use crate::peer::types::{ConnectivityCandidate, SessionDescription, SignalingEnvelope};
use crate::signaling::SignalSink;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn sdp_with_fragment(fragment: &str) -> String {
    format!(
        "v=0\r\no=- 4611 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
         a=ice-ufrag:{fragment}\r\na=ice-pwd:0123456789abcdef012345\r\n\
         a=setup:actpass\r\na=mid:0\r\n"
    )
}

pub fn candidate(fragment: &str, n: u8) -> ConnectivityCandidate {
    ConnectivityCandidate {
        username_fragment: Some(fragment.to_string()),
        candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

#[derive(Default)]
pub struct MockTransport {
    fragment: String,
    fail_offer: bool,
    fail_answer: bool,
    fail_sends: AtomicBool,
    candidate_failures: AtomicUsize,
    local: Mutex<Vec<SessionDescription>>,
    remote: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<ConnectivityCandidate>>,
    texts: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// The next `n` candidates are rejected by the engine.
    pub fn fail_next_candidates(&self, n: usize) {
        self.candidate_failures.store(n, Ordering::SeqCst);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn rejected(what: &str) -> PeerError {
    PeerError::WebRtc(webrtc::Error::new(format!("{what} rejected")))
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        if self.fail_offer {
            return Err(rejected("offer"));
        }
        Ok(SessionDescription::offer(sdp_with_fragment(&self.fragment)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.fail_answer {
            return Err(rejected("answer"));
        }
        Ok(SessionDescription::answer(sdp_with_fragment(&self.fragment)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.local.lock().unwrap().push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.remote.lock().unwrap().push(desc);
        Ok(())
    }

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError> {
        if self
            .candidate_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(rejected("candidate"));
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), PeerError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(PeerError::NoChannel);
        }
        self.texts.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one `MockTransport` per session, each with the next fragment.
#[derive(Default)]
pub struct MockFactory {
    fragments: Mutex<VecDeque<String>>,
    created: Mutex<Vec<(u64, bool, Arc<MockTransport>)>>,
    pub fail_offer: AtomicBool,
    pub fail_answer: AtomicBool,
    pub fail_create: AtomicBool,
}

impl MockFactory {
    pub fn with_fragments(fragments: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fragments: Mutex::new(fragments.iter().map(|f| f.to_string()).collect()),
            ..Default::default()
        })
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<MockTransport> {
        self.created.lock().unwrap().last().unwrap().2.clone()
    }

    pub fn nth(&self, n: usize) -> Arc<MockTransport> {
        self.created.lock().unwrap()[n].2.clone()
    }

    pub fn last_initiator(&self) -> bool {
        self.created.lock().unwrap().last().unwrap().1
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        epoch: u64,
        initiator: bool,
        _events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(rejected("peer connection"));
        }
        let fragment = self
            .fragments
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("mock{epoch}"));
        let transport = Arc::new(MockTransport {
            fragment,
            fail_offer: self.fail_offer.load(Ordering::SeqCst),
            fail_answer: self.fail_answer.load(Ordering::SeqCst),
            ..Default::default()
        });
        self.created
            .lock()
            .unwrap()
            .push((epoch, initiator, transport.clone()));
        Ok(transport)
    }
}

/// Records every envelope instead of sending it.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SignalingEnvelope>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|e| e.event()).collect()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }
}
