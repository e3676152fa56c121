//! Wire messages exchanged over the signaling WebSocket.
//!
//! Every frame is a JSON envelope `{"event": "<kebab-name>", "data": {...}}`.
//! Negotiation payloads are a sum type keyed by `type`, so a
//! `webrtc-signal` frame reads
//! `{"event":"webrtc-signal","data":{"roomId":..,"fromId":..,"type":"offer","signal":{..},"timestamp":..}}`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProctorError, Result};

/// Milliseconds since the unix epoch, the timestamp unit used on the wire
/// and in persisted markers.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// One negotiation step, keyed by its `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "signal", rename_all = "kebab-case")]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcSignal {
    pub room_id: String,
    pub from_id: String,
    /// Intended recipient. The relay ignores it; receivers drop frames
    /// addressed to someone else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    #[serde(flatten)]
    pub signal: Signal,
    #[serde(default)]
    pub timestamp: u64,
}

impl WebRtcSignal {
    pub fn is_addressed_to(&self, participant_id: &str) -> bool {
        self.to_id.as_deref().map_or(true, |to| to == participant_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        user_id: String,
        #[serde(default)]
        is_admin: bool,
    },

    WebrtcSignal(WebRtcSignal),

    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String, user_id: String },

    #[serde(rename_all = "camelCase")]
    Heartbeat {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        timestamp: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        user_id: String,
        is_admin: bool,
    },

    #[serde(rename_all = "camelCase")]
    CandidateJoined { candidate_id: String, timestamp: u64 },

    #[serde(rename_all = "camelCase")]
    CandidateLeft { candidate_id: String },

    #[serde(rename_all = "camelCase")]
    AdminLeft { admin_id: String },

    #[serde(rename_all = "camelCase")]
    AdminReplaced { room_id: String, replaced_by: String },

    WebrtcSignal(WebRtcSignal),

    RoomError { message: String },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProctorError::InvalidSignalingMessage(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProctorError::InvalidSignalingMessage(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
