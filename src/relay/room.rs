use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use warp::ws::Message;

/// A live signaling connection attached to a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub participant_id: String,
    pub connection_id: u64,
    pub sender: mpsc::UnboundedSender<Message>,
    pub joined_at: u64,
    pub last_heartbeat: u64,
}

/// What happened to the admin slot on an admin join.
#[derive(Debug)]
pub enum AdminTransition {
    /// The slot was empty.
    Installed,
    /// Same participant on the same connection joined again.
    Rejoined,
    /// Another connection held the slot and was evicted.
    Replaced { previous: Member },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    Admin(String),
    Candidate(String),
}

/// Membership of one signaling room: an optional single admin slot plus
/// the candidates in join order.
#[derive(Debug)]
pub struct RelayRoom {
    pub id: String,
    admin: Option<Member>,
    candidates: Vec<Member>,
    closed: bool,
}

impl RelayRoom {
    pub fn new(id: String) -> Self {
        Self {
            id,
            admin: None,
            candidates: Vec::new(),
            closed: false,
        }
    }

    pub fn install_admin(&mut self, member: Member) -> AdminTransition {
        match self.admin.replace(member) {
            None => AdminTransition::Installed,
            Some(previous) => {
                let current = self.admin.as_ref().map(|m| (m.participant_id.as_str(), m.connection_id));
                if current == Some((previous.participant_id.as_str(), previous.connection_id)) {
                    AdminTransition::Rejoined
                } else {
                    AdminTransition::Replaced { previous }
                }
            }
        }
    }

    /// Adds or refreshes a candidate. Returns the connection it superseded
    /// when the same candidate joins again from a new socket.
    pub fn upsert_candidate(&mut self, member: Member) -> Option<Member> {
        match self
            .candidates
            .iter_mut()
            .find(|c| c.participant_id == member.participant_id)
        {
            Some(existing) => {
                let previous = std::mem::replace(existing, member);
                (previous.connection_id != existing.connection_id).then_some(previous)
            }
            None => {
                self.candidates.push(member);
                None
            }
        }
    }

    /// Removes the participant only if it is still attached through
    /// `connection_id`; an evicted connection cannot remove its successor.
    pub fn remove(&mut self, participant_id: &str, connection_id: u64) -> Option<Departure> {
        if let Some(admin) = &self.admin {
            if admin.participant_id == participant_id && admin.connection_id == connection_id {
                self.admin = None;
                return Some(Departure::Admin(participant_id.to_string()));
            }
        }

        let index = self
            .candidates
            .iter()
            .position(|c| c.participant_id == participant_id && c.connection_id == connection_id)?;
        self.candidates.remove(index);
        Some(Departure::Candidate(participant_id.to_string()))
    }

    pub fn member_mut(&mut self, participant_id: &str, connection_id: u64) -> Option<&mut Member> {
        self.admin
            .iter_mut()
            .chain(self.candidates.iter_mut())
            .find(|m| m.participant_id == participant_id && m.connection_id == connection_id)
    }

    pub fn is_member(&self, participant_id: &str, connection_id: u64) -> bool {
        self.admin
            .iter()
            .chain(self.candidates.iter())
            .any(|m| m.participant_id == participant_id && m.connection_id == connection_id)
    }

    /// Every attached member except the given connection.
    pub fn others(&self, connection_id: u64) -> impl Iterator<Item = &Member> {
        self.admin
            .iter()
            .chain(self.candidates.iter())
            .filter(move |m| m.connection_id != connection_id)
    }

    pub fn admin_id(&self) -> Option<&str> {
        self.admin.as_ref().map(|m| m.participant_id.as_str())
    }

    pub fn candidate_ids(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.participant_id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.admin.is_none() && self.candidates.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Room-scoped locking: the outer map is only touched to find or drop a
/// room, all membership changes happen under that room's own mutex.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<RelayRoom>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Mutex<RelayRoom>>> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).cloned()
    }

    /// Rooms are materialized by their first join.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Mutex<RelayRoom>> {
        if let Some(room) = self.get(room_id).await {
            return room;
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                tracing::info!(room_id = %room_id, "Signaling room materialized");
                Arc::new(Mutex::new(RelayRoom::new(room_id.to_string())))
            })
            .clone()
    }

    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };

        let mut room = room.lock().await;
        if room.is_empty() {
            room.closed = true;
            rooms.remove(room_id);
            tracing::info!(room_id = %room_id, "Signaling room dropped");
            true
        } else {
            false
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
