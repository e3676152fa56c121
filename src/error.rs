use thiserror::Error;

/// Error types shared by the relay server and the proctoring client core
#[derive(Debug, Error)]
pub enum ProctorError {
    /// Negotiation errors
    #[error("Failed to create peer connection: {0}")]
    PeerConnectionCreation(String),

    #[error("Failed to create offer: {0}")]
    CreateOfferFailed(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("Invalid SDP format: {0}")]
    InvalidSdp(String),

    #[error("Failed to set local description: {0}")]
    SetLocalDescriptionFailed(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescriptionFailed(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidateFailed(String),

    #[error("Peer link cannot roll back a local offer")]
    RollbackUnsupported,

    #[error("Signaling state not valid for this operation: {0}")]
    InvalidSignalingState(String),

    #[error("Reconnection to peer {peer_id} abandoned after {attempts} attempts")]
    ReconnectExhausted { peer_id: String, attempts: u32 },

    /// Capture device errors
    #[error("Capture device {0} is already in use")]
    DeviceBusy(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Room and membership errors
    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Candidate {candidate_id} not found in room {room_id}")]
    CandidateNotInRoom { room_id: String, candidate_id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Signaling errors
    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("Signaling channel closed")]
    ChannelClosed,

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Collaborator errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collaborator rejected request: {0}")]
    Collaborator(String),

    #[error("Session store error: {0}")]
    Store(#[from] std::io::Error),

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    /// Network errors
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ProctorError
pub type Result<T> = std::result::Result<T, ProctorError>;

impl ProctorError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        ProctorError::Internal(msg.into())
    }

    /// Helper to create network errors
    pub fn network(msg: impl Into<String>) -> Self {
        ProctorError::NetworkError(msg.into())
    }

    /// Negotiation hiccups that are recovered locally by rollback or
    /// reconnection and never surfaced to the user.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProctorError::InvalidSdp(_)
                | ProctorError::InvalidSignalingState(_)
                | ProctorError::RollbackUnsupported
                | ProctorError::SetRemoteDescriptionFailed(_)
                | ProctorError::SetLocalDescriptionFailed(_)
                | ProctorError::AddIceCandidateFailed(_)
                | ProctorError::InvalidSignalingMessage(_)
        )
    }

    /// Device and permission problems block the session behind a retry.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            ProctorError::DeviceBusy(_) | ProctorError::DeviceUnavailable(_)
        )
    }
}

impl From<webrtc::Error> for ProctorError {
    fn from(err: webrtc::Error) -> Self {
        ProctorError::WebRtcApi(err.to_string())
    }
}
