use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::random_id;

/// Which side of the exchange a description belongs to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Negotiation description as browsers serialize it: `{type, sdp}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate relayed over signaling
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityCandidate {
    #[serde(default)]
    pub username_fragment: Option<String>,
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl ConnectivityCandidate {
    /// The fragment this candidate claims to belong to, empty when absent.
    pub fn fragment(&self) -> &str {
        self.username_fragment.as_deref().unwrap_or("")
    }
}

/// Payload of a `userLeave` notification
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserLeave {
    pub user_frag: String,
}

/// Everything that travels over the signaling relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SignalingEnvelope {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(ConnectivityCandidate),
    UserLeave(UserLeave),
}

impl SignalingEnvelope {
    /// Wire name of the event, used for logging.
    pub fn event(&self) -> &'static str {
        match self {
            SignalingEnvelope::Offer(_) => "offer",
            SignalingEnvelope::Answer(_) => "answer",
            SignalingEnvelope::Candidate(_) => "candidate",
            SignalingEnvelope::UserLeave(_) => "userLeave",
        }
    }
}

/// Chat message exchanged over the data channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

const DISPLAY_FORMAT: &str = "%Y-%m-%d %I:%M%p";

impl Message {
    pub fn new(from_id: &str, to_id: &str, body: impl Into<String>) -> Self {
        Self {
            id: random_id(),
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            created_at: Utc::now(),
            body: body.into(),
        }
    }

    /// `createdAt` in local time, e.g. `2024-05-01 09:15PM`
    pub fn display_time(&self) -> String {
        self.created_at
            .with_timezone(&Local)
            .format(DISPLAY_FORMAT)
            .to_string()
    }
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default)]
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}
