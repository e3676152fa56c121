use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::coordinator::{PeerCoordinator, PeerStatus, ReconnectPolicy, Role, SignalSink};
use super::link::PeerLinkFactory;
use crate::directory::{MembershipStatus, Room};
use crate::protocol::{ServerMessage, Signal};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct PeerHandle {
    signals: mpsc::UnboundedSender<Signal>,
    status: watch::Receiver<PeerStatus>,
    task: JoinHandle<PeerStatus>,
}

/// Admin side: one answering coordinator per candidate in the room.
pub struct PeerHub {
    admin_id: String,
    factory: Arc<dyn PeerLinkFactory>,
    sink: Arc<dyn SignalSink>,
    policy: ReconnectPolicy,
    peers: Arc<RwLock<HashMap<String, PeerHandle>>>,
}

impl PeerHub {
    pub fn new(
        admin_id: impl Into<String>,
        factory: Arc<dyn PeerLinkFactory>,
        sink: Arc<dyn SignalSink>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            admin_id: admin_id.into(),
            factory,
            sink,
            policy,
            peers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::CandidateJoined { candidate_id, .. } => {
                self.ensure_peer(&candidate_id).await;
            }
            ServerMessage::CandidateLeft { candidate_id } => {
                self.remove_peer(&candidate_id).await;
            }
            ServerMessage::WebrtcSignal(signal) => {
                if signal.from_id == self.admin_id || !signal.is_addressed_to(&self.admin_id) {
                    return;
                }
                let sender = self.ensure_peer(&signal.from_id).await;
                if sender.send(signal.signal).is_err() {
                    tracing::debug!(candidate_id = %signal.from_id, "Coordinator already stopped");
                }
            }
            ServerMessage::AdminReplaced { replaced_by, .. } => {
                tracing::warn!(replaced_by = %replaced_by, "Admin slot taken by another connection, dropping peers");
                self.close_all().await;
            }
            _ => {}
        }
    }

    /// Coordinator for the candidate, spawning one on first contact.
    pub async fn ensure_peer(&self, candidate_id: &str) -> mpsc::UnboundedSender<Signal> {
        {
            let peers = self.peers.read().await;
            if let Some(handle) = peers.get(candidate_id) {
                if !handle.task.is_finished() {
                    return handle.signals.clone();
                }
            }
        }

        let mut peers = self.peers.write().await;
        if let Some(handle) = peers.get(candidate_id) {
            if !handle.task.is_finished() {
                return handle.signals.clone();
            }
        }

        let coordinator = PeerCoordinator::new(
            candidate_id,
            Role::Answerer,
            self.factory.clone(),
            self.sink.clone(),
            self.policy.clone(),
        );
        let status = coordinator.subscribe();
        let (signals, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));

        tracing::info!(candidate_id = %candidate_id, "Peer coordinator created");
        peers.insert(
            candidate_id.to_string(),
            PeerHandle {
                signals: signals.clone(),
                status,
                task,
            },
        );
        signals
    }

    pub async fn remove_peer(&self, candidate_id: &str) -> Option<PeerStatus> {
        let PeerHandle { signals, mut task, .. } = self.peers.write().await.remove(candidate_id)?;
        drop(signals);
        let status = match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                tracing::warn!(candidate_id = %candidate_id, error = %e, "Coordinator task ended abnormally");
                PeerStatus::Closed
            }
            Err(_) => {
                tracing::warn!(candidate_id = %candidate_id, "Coordinator did not stop in time, aborting");
                task.abort();
                PeerStatus::Closed
            }
        };
        tracing::info!(candidate_id = %candidate_id, "Peer coordinator removed");
        Some(status)
    }

    /// Replay offers stored in the room directory for candidates that
    /// started before this admin joined.
    pub async fn resume_from_directory(&self, room: &Room) -> usize {
        let mut resumed = 0;
        for membership in &room.candidates {
            let Some(offer) = membership.webrtc_offer.clone() else {
                continue;
            };
            if membership.status != MembershipStatus::Active {
                continue;
            }
            let sender = self.ensure_peer(&membership.candidate_id).await;
            if sender.send(Signal::Offer(offer)).is_ok() {
                resumed += 1;
            }
        }
        if resumed > 0 {
            tracing::info!(room_id = %room.room_id, resumed, "Resumed stored candidate offers");
        }
        resumed
    }

    pub async fn statuses(&self) -> HashMap<String, PeerStatus> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .map(|(id, handle)| (id.clone(), handle.status.borrow().clone()))
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        for id in ids {
            self.remove_peer(&id).await;
        }
    }
}
