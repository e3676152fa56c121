use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::Message;

use super::room::{AdminTransition, Departure, Member, RoomRegistry};
use crate::directory::RoomDirectory;
use crate::error::{ProctorError, Result};
use crate::protocol::{now_millis, ServerMessage, WebRtcSignal};

/// Outbound half of one signaling socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub sender: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn send(&self, message: &ServerMessage) -> Result<()> {
        deliver(&self.sender, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub admin_id: Option<String>,
    pub candidate_ids: Vec<String>,
}

fn deliver(sender: &mpsc::UnboundedSender<Message>, message: &ServerMessage) -> Result<()> {
    let text = message.to_json()?;
    sender
        .send(Message::text(text))
        .map_err(|_| ProctorError::ChannelClosed)
}

/// Room-scoped fan-out of signaling frames. Never inspects negotiation
/// payloads; receivers decide what a frame means to them.
pub struct RelayServer {
    registry: RoomRegistry,
    directory: Option<Arc<RoomDirectory>>,
    next_connection_id: AtomicU64,
}

impl RelayServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: RoomRegistry::new(),
            directory: None,
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Relay that also reports connections and activity to the room directory.
    pub fn with_directory(directory: Arc<RoomDirectory>) -> Arc<Self> {
        Arc::new(Self {
            registry: RoomRegistry::new(),
            directory: Some(directory),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn connect(&self, sender: mpsc::UnboundedSender<Message>) -> ConnectionHandle {
        ConnectionHandle {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            sender,
        }
    }

    pub async fn join_room(
        &self,
        room_id: &str,
        participant_id: &str,
        is_admin: bool,
        connection: &ConnectionHandle,
    ) -> Result<()> {
        if room_id.trim().is_empty() || participant_id.trim().is_empty() {
            return Err(ProctorError::InvalidRequest(
                "join-room requires roomId and userId".to_string(),
            ));
        }

        let now = now_millis();
        let member = Member {
            participant_id: participant_id.to_string(),
            connection_id: connection.id,
            sender: connection.sender.clone(),
            joined_at: now,
            last_heartbeat: now,
        };

        // A room dropped between lookup and lock is retired; fetch a fresh one.
        loop {
            let room = self.registry.get_or_create(room_id).await;
            let mut room = room.lock().await;
            if room.is_closed() {
                continue;
            }

            if is_admin {
                match room.install_admin(member.clone()) {
                    AdminTransition::Replaced { previous } => {
                        tracing::warn!(
                            room_id = %room_id,
                            previous_admin = %previous.participant_id,
                            admin_id = %participant_id,
                            "Admin slot taken over by new connection"
                        );
                        let notice = ServerMessage::AdminReplaced {
                            room_id: room_id.to_string(),
                            replaced_by: participant_id.to_string(),
                        };
                        if let Err(e) = deliver(&previous.sender, &notice) {
                            tracing::debug!(error = %e, "Evicted admin already disconnected");
                        }
                    }
                    AdminTransition::Installed | AdminTransition::Rejoined => {
                        tracing::info!(room_id = %room_id, admin_id = %participant_id, "Admin joined room");
                    }
                }
            } else {
                if room.upsert_candidate(member.clone()).is_some() {
                    tracing::info!(
                        room_id = %room_id,
                        candidate_id = %participant_id,
                        "Candidate rejoined from a new connection"
                    );
                }

                let notice = ServerMessage::CandidateJoined {
                    candidate_id: participant_id.to_string(),
                    timestamp: now,
                };
                for other in room.others(connection.id) {
                    if let Err(e) = deliver(&other.sender, &notice) {
                        tracing::debug!(
                            participant_id = %other.participant_id,
                            error = %e,
                            "Failed to notify member of candidate join"
                        );
                    }
                }
                tracing::info!(room_id = %room_id, candidate_id = %participant_id, "Candidate joined room");
            }
            break;
        }

        if !is_admin {
            if let Some(directory) = &self.directory {
                directory.mark_connected(room_id, participant_id, now).await;
            }
        }

        connection.send(&ServerMessage::RoomJoined {
            room_id: room_id.to_string(),
            user_id: participant_id.to_string(),
            is_admin,
        })
    }

    /// Forwards the frame verbatim to every other member of its room.
    /// The sending connection must be attached to that room under the
    /// frame's `fromId`. Returns how many members it was handed to.
    pub async fn relay_signal(&self, connection_id: u64, signal: WebRtcSignal) -> Result<usize> {
        let Some(room) = self.registry.get(&signal.room_id).await else {
            tracing::debug!(room_id = %signal.room_id, "Dropping signal for unknown room");
            return Err(ProctorError::RoomNotFound(signal.room_id));
        };

        let room = room.lock().await;
        if !room.is_member(&signal.from_id, connection_id) {
            tracing::warn!(
                room_id = %signal.room_id,
                from_id = %signal.from_id,
                connection_id,
                "Refusing signal from connection outside the room"
            );
            return Err(ProctorError::InvalidRequest(format!(
                "{} is not a member of room {} on this connection",
                signal.from_id, signal.room_id
            )));
        }

        let room_id = signal.room_id.clone();
        let from_id = signal.from_id.clone();
        let kind = signal.signal.kind();
        let message = ServerMessage::WebrtcSignal(signal);
        let mut delivered = 0;
        for member in room.others(connection_id) {
            match deliver(&member.sender, &message) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(
                    participant_id = %member.participant_id,
                    error = %e,
                    "Failed to relay signal"
                ),
            }
        }

        tracing::debug!(room_id = %room_id, from_id = %from_id, kind, delivered, "Relayed signal");
        Ok(delivered)
    }

    pub async fn leave(&self, room_id: &str, participant_id: &str, connection_id: u64) -> Option<Departure> {
        let room = self.registry.get(room_id).await?;

        let departure = {
            let mut room = room.lock().await;
            let departure = room.remove(participant_id, connection_id)?;
            let notice = match &departure {
                Departure::Candidate(id) => ServerMessage::CandidateLeft {
                    candidate_id: id.clone(),
                },
                Departure::Admin(id) => ServerMessage::AdminLeft { admin_id: id.clone() },
            };
            for other in room.others(connection_id) {
                if let Err(e) = deliver(&other.sender, &notice) {
                    tracing::debug!(participant_id = %other.participant_id, error = %e, "Failed to notify member of departure");
                }
            }
            departure
        };

        tracing::info!(room_id = %room_id, participant_id = %participant_id, "Participant left room");

        if let (Departure::Candidate(id), Some(directory)) = (&departure, &self.directory) {
            directory.touch(room_id, id, now_millis()).await;
        }

        self.registry.remove_if_empty(room_id).await;
        Some(departure)
    }

    pub async fn heartbeat(&self, room_id: &str, participant_id: &str, connection_id: u64) {
        let now = now_millis();
        if let Some(room) = self.registry.get(room_id).await {
            if let Some(member) = room.lock().await.member_mut(participant_id, connection_id) {
                member.last_heartbeat = now;
            }
        }

        if let Some(directory) = &self.directory {
            directory.touch(room_id, participant_id, now).await;
        }
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let room = self.registry.get(room_id).await?;
        let room = room.lock().await;
        Some(RoomSnapshot {
            room_id: room.id.clone(),
            admin_id: room.admin_id().map(str::to_string),
            candidate_ids: room.candidate_ids(),
        })
    }

    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SessionDescription, Signal};

    fn connection(server: &RelayServer) -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (server.connect(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerMessage> {
        let mut out = vec![];
        while let Ok(msg) = rx.try_recv() {
            let text = msg.to_str().unwrap().to_string();
            out.push(ServerMessage::parse(&text).unwrap());
        }
        out
    }

    fn offer(room_id: &str, from: &str) -> WebRtcSignal {
        WebRtcSignal {
            room_id: room_id.to_string(),
            from_id: from.to_string(),
            to_id: None,
            signal: Signal::Offer(SessionDescription::offer("v=0")),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn test_candidate_join_notifies_admin() {
        let server = RelayServer::new();
        let (admin, mut admin_rx) = connection(&server);
        let (cand, mut cand_rx) = connection(&server);

        server.join_room("R1", "A1", true, &admin).await.unwrap();
        server.join_room("R1", "C1", false, &cand).await.unwrap();

        let admin_msgs = drain(&mut admin_rx);
        assert!(matches!(admin_msgs[0], ServerMessage::RoomJoined { is_admin: true, .. }));
        assert!(matches!(
            &admin_msgs[1],
            ServerMessage::CandidateJoined { candidate_id, .. } if candidate_id == "C1"
        ));

        let cand_msgs = drain(&mut cand_rx);
        assert_eq!(cand_msgs.len(), 1);
        assert!(matches!(cand_msgs[0], ServerMessage::RoomJoined { is_admin: false, .. }));
    }

    #[tokio::test]
    async fn test_offer_and_answer_exchange() {
        let server = RelayServer::new();
        let (admin, mut admin_rx) = connection(&server);
        let (cand, mut cand_rx) = connection(&server);
        server.join_room("R1", "A1", true, &admin).await.unwrap();
        server.join_room("R1", "C1", false, &cand).await.unwrap();
        drain(&mut admin_rx);
        drain(&mut cand_rx);

        let delivered = server.relay_signal(cand.id, offer("R1", "C1")).await.unwrap();
        assert_eq!(delivered, 1);
        assert!(drain(&mut cand_rx).is_empty());
        let admin_msgs = drain(&mut admin_rx);
        assert!(matches!(
            &admin_msgs[0],
            ServerMessage::WebrtcSignal(sig) if sig.from_id == "C1" && sig.signal.kind() == "offer"
        ));

        let answer = WebRtcSignal {
            signal: Signal::Answer(SessionDescription::answer("v=0")),
            ..offer("R1", "A1")
        };
        server.relay_signal(admin.id, answer).await.unwrap();
        assert!(drain(&mut admin_rx).is_empty());
        assert_eq!(drain(&mut cand_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_signal_fans_out_to_every_other_member() {
        let server = RelayServer::new();
        let (admin, mut admin_rx) = connection(&server);
        let (c1, mut c1_rx) = connection(&server);
        let (c2, mut c2_rx) = connection(&server);
        server.join_room("R1", "A1", true, &admin).await.unwrap();
        server.join_room("R1", "C1", false, &c1).await.unwrap();
        server.join_room("R1", "C2", false, &c2).await.unwrap();
        drain(&mut admin_rx);
        drain(&mut c1_rx);
        drain(&mut c2_rx);

        let delivered = server.relay_signal(admin.id, offer("R1", "A1")).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut c1_rx).len(), 1);
        assert_eq!(drain(&mut c2_rx).len(), 1);
        assert!(drain(&mut admin_rx).is_empty());
    }

    #[tokio::test]
    async fn test_signal_to_unknown_room_is_dropped() {
        let server = RelayServer::new();
        let (cand, _rx) = connection(&server);
        let err = server.relay_signal(cand.id, offer("missing", "C1")).await.unwrap_err();
        assert!(matches!(err, ProctorError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_signal_into_foreign_room_is_refused() {
        let server = RelayServer::new();
        let (admin2, mut admin2_rx) = connection(&server);
        let (intruder, _intruder_rx) = connection(&server);
        let (c1, _c1_rx) = connection(&server);
        server.join_room("R2", "A2", true, &admin2).await.unwrap();
        server.join_room("R1", "C1", false, &c1).await.unwrap();
        server.join_room("R1", "C2", false, &intruder).await.unwrap();
        drain(&mut admin2_rx);

        // Joined R1, writes into R2 under an invented id.
        let err = server.relay_signal(intruder.id, offer("R2", "C9")).await.unwrap_err();
        assert!(matches!(err, ProctorError::InvalidRequest(_)));
        assert!(drain(&mut admin2_rx).is_empty());

        // Right room, but impersonating another member's id.
        let err = server.relay_signal(intruder.id, offer("R1", "C1")).await.unwrap_err();
        assert!(matches!(err, ProctorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_second_admin_replaces_first() {
        let server = RelayServer::new();
        let (first, mut first_rx) = connection(&server);
        let (second, _second_rx) = connection(&server);
        server.join_room("R1", "A1", true, &first).await.unwrap();
        drain(&mut first_rx);

        server.join_room("R1", "A2", true, &second).await.unwrap();
        let msgs = drain(&mut first_rx);
        assert!(matches!(
            &msgs[0],
            ServerMessage::AdminReplaced { replaced_by, .. } if replaced_by == "A2"
        ));

        // The evicted socket disconnecting must not clear the new admin.
        assert!(server.leave("R1", "A1", first.id).await.is_none());
        let snapshot = server.snapshot("R1").await.unwrap();
        assert_eq!(snapshot.admin_id.as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_leave_notifies_and_drops_empty_room() {
        let server = RelayServer::new();
        let (admin, mut admin_rx) = connection(&server);
        let (cand, mut cand_rx) = connection(&server);
        server.join_room("R1", "A1", true, &admin).await.unwrap();
        server.join_room("R1", "C1", false, &cand).await.unwrap();
        drain(&mut admin_rx);
        drain(&mut cand_rx);

        let departure = server.leave("R1", "C1", cand.id).await;
        assert_eq!(departure, Some(Departure::Candidate("C1".to_string())));
        let msgs = drain(&mut admin_rx);
        assert!(matches!(
            &msgs[0],
            ServerMessage::CandidateLeft { candidate_id } if candidate_id == "C1"
        ));

        server.leave("R1", "A1", admin.id).await;
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_marks_directory_membership_connected() {
        use crate::directory::MembershipStatus;

        let directory = RoomDirectory::new();
        let room = directory.create_or_join("assessment-1", "C1", 0).await.unwrap();
        let server = RelayServer::with_directory(directory.clone());
        let (cand, _rx) = connection(&server);

        server.join_room(&room.room_id, "C1", false, &cand).await.unwrap();

        let room = directory.get(&room.room_id).await.unwrap();
        assert_eq!(room.membership("C1").unwrap().status, MembershipStatus::Active);
    }

    #[tokio::test]
    async fn test_join_requires_identifiers() {
        let server = RelayServer::new();
        let (cand, _rx) = connection(&server);
        let err = server.join_room("", "C1", false, &cand).await.unwrap_err();
        assert!(matches!(err, ProctorError::InvalidRequest(_)));
    }
}
