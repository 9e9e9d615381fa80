//! webrtc-rs backed transport.
//!
//! Callbacks registered on the peer connection never touch session state;
//! they only forward [`TransportEvent`]s tagged with the epoch the transport
//! was created for.

use crate::config::Settings;
use crate::error::PeerError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::{attach_dc, forward};
use crate::peer::ice::{analyze_candidates, rtc_ice_servers};
use crate::peer::transport::{
    LinkState, PeerTransport, TransportEventKind, TransportEvents, TransportFactory,
};
use crate::peer::types::{ConnectivityCandidate, SdpKind, ServerConfig, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use webrtc::api::APIBuilder;
use webrtc::data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type SharedChannel = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

pub struct RtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
    channel_label: String,
}

impl RtcTransportFactory {
    pub fn new(settings: &Settings) -> Self {
        Self {
            ice_servers: settings.ice_servers.clone(),
            channel_label: settings.channel_label.clone(),
        }
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: rtc_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// `None` for states the machine does not care about.
pub fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => None,
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        epoch: u64,
        initiator: bool,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(&self.ice_servers)).await?);
        let channel: SharedChannel = Arc::new(Mutex::new(None));
        let gathered = Arc::new(Mutex::new(Vec::<ConnectivityCandidate>::new()));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let gathered = gathered.clone();
            Box::pin(async move {
                let Some(cand) = cand else {
                    debug!(epoch, "candidate gathering completed");
                    analyze_candidates(gathered.lock().await.iter());
                    return;
                };
                dump_candidate("LOCAL", &cand).await;
                if let Ok(init) = cand.to_json() {
                    let candidate = ConnectivityCandidate {
                        username_fragment: init.username_fragment,
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    };
                    gathered.lock().await.push(candidate.clone());
                    forward(&events, epoch, TransportEventKind::LocalCandidate(candidate));
                }
            })
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(epoch, ?state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        let link_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(epoch, ?state, "peer connection state changed");
            if let Some(link) = link_state(state) {
                forward(&link_events, epoch, TransportEventKind::Link(link));
            }
            Box::pin(async {})
        }));

        if initiator {
            let dc = pc
                .create_data_channel(
                    &self.channel_label,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await?;
            attach_dc(&dc, epoch, events);
            *channel.lock().await = Some(dc);
        } else {
            let slot = channel.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                attach_dc(&dc, epoch, events.clone());
                let slot = slot.clone();
                Box::pin(async move {
                    *slot.lock().await = Some(dc);
                })
            }));
        }

        info!(epoch, initiator, "peer connection created");
        Ok(Arc::new(RtcPeerTransport { pc, channel }))
    }
}

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    channel: SharedChannel,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), PeerError> {
        let dc = self.channel.lock().await.clone().ok_or(PeerError::NoChannel)?;
        dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }

    async fn log_stats(&self, moment: &str) {
        dump_selected_pair(&self.pc, moment).await;
    }
}
