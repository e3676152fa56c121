use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::Message;

use super::server::{ConnectionHandle, RelayServer};
use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Debug, Clone)]
struct Joined {
    room_id: String,
    user_id: String,
}

/// Per-socket dispatcher. Tracks which room the connection joined so a
/// dropped socket is cleaned up like an explicit leave.
pub struct SignalingHandler {
    server: Arc<RelayServer>,
    connection: ConnectionHandle,
    joined: Option<Joined>,
}

impl SignalingHandler {
    pub fn new(server: Arc<RelayServer>, sender: mpsc::UnboundedSender<Message>) -> Self {
        let connection = server.connect(sender);
        Self {
            server,
            connection,
            joined: None,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection.id
    }

    pub async fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom {
                room_id,
                user_id,
                is_admin,
            } => {
                if let Some(previous) = self.joined.take() {
                    if previous.room_id != room_id || previous.user_id != user_id {
                        self.server
                            .leave(&previous.room_id, &previous.user_id, self.connection.id)
                            .await;
                    }
                }

                match self
                    .server
                    .join_room(&room_id, &user_id, is_admin, &self.connection)
                    .await
                {
                    Ok(()) => self.joined = Some(Joined { room_id, user_id }),
                    Err(e) => {
                        tracing::warn!(room_id = %room_id, user_id = %user_id, error = %e, "Join rejected");
                        self.reply_error(e.to_string());
                    }
                }
            }

            ClientMessage::WebrtcSignal(signal) => {
                let Some(joined) = &self.joined else {
                    tracing::debug!(from_id = %signal.from_id, "Signal from connection outside any room");
                    self.reply_error("join a room before signaling".to_string());
                    return;
                };
                if joined.room_id != signal.room_id || joined.user_id != signal.from_id {
                    tracing::warn!(
                        joined_room = %joined.room_id,
                        joined_user = %joined.user_id,
                        room_id = %signal.room_id,
                        from_id = %signal.from_id,
                        "Signal does not match the joined room and user"
                    );
                    self.reply_error("signal roomId and fromId must match the joined room".to_string());
                    return;
                }
                if let Err(e) = self.server.relay_signal(self.connection.id, signal).await {
                    self.reply_error(e.to_string());
                }
            }

            ClientMessage::LeaveRoom { room_id, user_id } => {
                self.server.leave(&room_id, &user_id, self.connection.id).await;
                if self
                    .joined
                    .as_ref()
                    .is_some_and(|j| j.room_id == room_id && j.user_id == user_id)
                {
                    self.joined = None;
                }
            }

            ClientMessage::Heartbeat { room_id, user_id, .. } => {
                let target = match (room_id, user_id, &self.joined) {
                    (Some(room_id), Some(user_id), _) => Some((room_id, user_id)),
                    (_, _, Some(joined)) => Some((joined.room_id.clone(), joined.user_id.clone())),
                    _ => None,
                };
                if let Some((room_id, user_id)) = target {
                    self.server.heartbeat(&room_id, &user_id, self.connection.id).await;
                }
            }
        }
    }

    fn reply_error(&self, message: String) {
        if let Err(e) = self.connection.send(&ServerMessage::RoomError { message }) {
            tracing::debug!(error = %e, "Failed to send room error");
        }
    }

    pub async fn cleanup(&mut self) {
        if let Some(joined) = self.joined.take() {
            tracing::info!(
                room_id = %joined.room_id,
                user_id = %joined.user_id,
                "Cleaning up disconnected signaling connection"
            );
            self.server
                .leave(&joined.room_id, &joined.user_id, self.connection.id)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IceCandidate, SessionDescription, Signal, WebRtcSignal};

    fn handler(server: &Arc<RelayServer>) -> (SignalingHandler, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SignalingHandler::new(server.clone(), tx), rx)
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerMessage> {
        let mut out = vec![];
        while let Ok(msg) = rx.try_recv() {
            out.push(ServerMessage::parse(msg.to_str().unwrap()).unwrap());
        }
        out
    }

    fn join(room_id: &str, user_id: &str, is_admin: bool) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            is_admin,
        }
    }

    #[tokio::test]
    async fn test_disconnect_announces_candidate_left() {
        let server = RelayServer::new();
        let (mut admin, mut admin_rx) = handler(&server);
        let (mut cand, _cand_rx) = handler(&server);

        admin.handle_message(join("R1", "A1", true)).await;
        cand.handle_message(join("R1", "C1", false)).await;
        events(&mut admin_rx);

        cand.cleanup().await;
        let msgs = events(&mut admin_rx);
        assert_eq!(
            msgs,
            vec![ServerMessage::CandidateLeft {
                candidate_id: "C1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_signal_before_join_is_refused() {
        let server = RelayServer::new();
        let (mut cand, mut cand_rx) = handler(&server);

        cand.handle_message(ClientMessage::WebrtcSignal(WebRtcSignal {
            room_id: "R1".to_string(),
            from_id: "C1".to_string(),
            to_id: None,
            signal: Signal::IceCandidate(IceCandidate::new("candidate:1")),
            timestamp: 0,
        }))
        .await;

        assert!(matches!(events(&mut cand_rx)[0], ServerMessage::RoomError { .. }));
    }

    #[tokio::test]
    async fn test_signal_outside_joined_room_is_refused() {
        let server = RelayServer::new();
        let (mut admin, mut admin_rx) = handler(&server);
        let (mut cand, mut cand_rx) = handler(&server);
        admin.handle_message(join("R2", "A2", true)).await;
        cand.handle_message(join("R1", "C1", false)).await;
        events(&mut admin_rx);
        events(&mut cand_rx);

        for (room_id, from_id) in [("R2", "C9"), ("R2", "C1"), ("R1", "C9")] {
            cand.handle_message(ClientMessage::WebrtcSignal(WebRtcSignal {
                room_id: room_id.to_string(),
                from_id: from_id.to_string(),
                to_id: None,
                signal: Signal::Offer(SessionDescription::offer("evil")),
                timestamp: 0,
            }))
            .await;
        }

        assert!(events(&mut admin_rx).is_empty());
        let replies = events(&mut cand_rx);
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|m| matches!(m, ServerMessage::RoomError { .. })));
    }

    #[tokio::test]
    async fn test_explicit_leave_then_cleanup_is_single_departure() {
        let server = RelayServer::new();
        let (mut admin, mut admin_rx) = handler(&server);
        let (mut cand, _cand_rx) = handler(&server);
        admin.handle_message(join("R1", "A1", true)).await;
        cand.handle_message(join("R1", "C1", false)).await;
        events(&mut admin_rx);

        cand.handle_message(ClientMessage::LeaveRoom {
            room_id: "R1".to_string(),
            user_id: "C1".to_string(),
        })
        .await;
        cand.cleanup().await;

        assert_eq!(events(&mut admin_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_joining_another_room_leaves_the_first() {
        let server = RelayServer::new();
        let (mut cand, _rx) = handler(&server);
        cand.handle_message(join("R1", "C1", false)).await;
        cand.handle_message(join("R2", "C1", false)).await;

        assert!(server.snapshot("R1").await.is_none());
        let r2 = server.snapshot("R2").await.unwrap();
        assert_eq!(r2.candidate_ids, vec!["C1".to_string()]);
    }
}
