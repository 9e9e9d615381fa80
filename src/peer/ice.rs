use crate::peer::identity::extract_fragment;
use crate::peer::session::PeerSession;
use crate::peer::types::{ConnectivityCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Decides whether an inbound candidate may be applied to `session`.
///
/// While the transport is still negotiating every well-formed candidate is
/// admitted. Once it is established, only candidates carrying the fragment of
/// the accepted remote description get through.
pub fn admit(candidate: &ConnectivityCandidate, session: &PeerSession) -> bool {
    let fragment = candidate.fragment();
    if fragment.is_empty() {
        debug!("candidate without username fragment rejected");
        return false;
    }

    if !session.transport_established() {
        return true;
    }

    let expected = session
        .remote_description()
        .map(|desc| extract_fragment(&desc.sdp))
        .unwrap_or("");
    if expected != fragment {
        debug!(expected, fragment, "candidate for another negotiation rejected");
        return false;
    }
    true
}

/// Converts configured servers into the engine's representation.
pub fn rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateMix {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates<'a>(
    candidates: impl IntoIterator<Item = &'a ConnectivityCandidate>,
) -> CandidateMix {
    let mut mix = CandidateMix::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            mix.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            mix.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            mix.relay += 1;
        }
    }

    info!(
        host = mix.host,
        srflx = mix.srflx,
        relay = mix.relay,
        "candidate analysis"
    );
    if mix.relay == 0 {
        warn!("no TURN relay candidates; connection through NAT may fail");
    }
    mix
}

/// Checks that an ICE server answers by gathering candidates through it.
///
/// A STUN server must yield a `srflx` candidate and a TURN server a `relay`
/// candidate before gathering completes or the timeout elapses.
pub async fn probe_ice_server(config: &ServerConfig) -> bool {
    let rtc_config = RTCConfiguration {
        ice_servers: rtc_ice_servers(std::slice::from_ref(config)),
        ..Default::default()
    };
    let wanted = if config.r#type == "turn" {
        "typ relay"
    } else {
        "typ srflx"
    };
    debug!(url = %add_ice_url_scheme(config), wanted, "probing ICE server");

    let api = APIBuilder::new().build();
    let pc = match api.new_peer_connection(rtc_config).await {
        Ok(pc) => pc,
        Err(err) => {
            warn!(error = %err, "probe: cannot create peer connection");
            return false;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
    let candidate_tx = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(line) = candidate.and_then(|c| c.to_json().ok()).map(|init| init.candidate) {
            if line.contains(wanted) {
                let _ = candidate_tx.send(true);
            }
        }
        Box::pin(async {})
    }));
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        if state == RTCIceGathererState::Complete {
            let _ = tx.send(false);
        }
        Box::pin(async {})
    }));

    let gathered = async {
        pc.create_data_channel("probe", None).await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await
    }
    .await;

    let reachable = match gathered {
        Ok(()) => matches!(timeout(PROBE_TIMEOUT, rx.recv()).await, Ok(Some(true))),
        Err(err) => {
            warn!(error = %err, "probe: gathering did not start");
            false
        }
    };

    if let Err(err) = pc.close().await {
        debug!(error = %err, "probe: close failed");
    }
    info!(url = %config.url, reachable, "ICE server probe finished");
    reachable
}
