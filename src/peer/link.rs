use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationPhase::Stable => "stable",
            NegotiationPhase::HaveLocalOffer => "have-local-offer",
            NegotiationPhase::HaveRemoteOffer => "have-remote-offer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcePhase {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Remote media attached to a link. Opaque to the coordinator; handed up
/// to whoever renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamHandle {
    pub stream_id: String,
    pub track_id: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    IceStateChanged(IcePhase),
    TrackArrived(MediaStreamHandle),
}

/// Event channel handed to one link instance. Every event carries the
/// generation of the link that produced it so callbacks from a closed
/// link can be told apart from the live one.
#[derive(Clone)]
pub struct LinkEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// One peer-to-peer media link. Implementations wrap a real WebRTC peer
/// connection or a scripted fake in tests.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard a pending local offer and return to `stable`.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn open(&self, peer_id: &str, events: LinkEventSender) -> Result<Arc<dyn PeerLink>>;
}
