//! Room lifecycle bookkeeping: which candidates belong to which proctoring
//! room and where each of them is in the exam.
//!
//! Memberships are never deleted, only status-transitioned. The copy held
//! here is authoritative; clients reconcile against it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{ProctorError, Result};
use crate::protocol::SessionDescription;

/// Rooms expire this long after creation.
pub const ROOM_TTL_MS: u64 = 2 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Pending,
    Active,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    NotStarted,
    InProgress,
    Completed,
    Expired,
    SessionOut,
}

impl From<MembershipStatus> for AttemptStatus {
    fn from(status: MembershipStatus) -> Self {
        match status {
            MembershipStatus::Active => AttemptStatus::InProgress,
            MembershipStatus::Completed => AttemptStatus::Completed,
            MembershipStatus::Error => AttemptStatus::Expired,
            MembershipStatus::Pending => AttemptStatus::NotStarted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMembership {
    pub candidate_id: String,
    pub status: MembershipStatus,
    pub attempt_status: AttemptStatus,
    pub webrtc_offer: Option<SessionDescription>,
    pub joined_at: Option<u64>,
    pub last_active_at: Option<u64>,
    pub actual_start_time: Option<u64>,
}

impl CandidateMembership {
    fn pending(candidate_id: &str) -> Self {
        Self {
            candidate_id: candidate_id.to_string(),
            status: MembershipStatus::Pending,
            attempt_status: AttemptStatus::NotStarted,
            webrtc_offer: None,
            joined_at: None,
            last_active_at: None,
            actual_start_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub assessment_id: String,
    pub status: RoomStatus,
    pub candidates: Vec<CandidateMembership>,
    pub created_at: u64,
    pub expires_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl Room {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn membership(&self, candidate_id: &str) -> Option<&CandidateMembership> {
        self.candidates.iter().find(|c| c.candidate_id == candidate_id)
    }

    fn membership_mut(&mut self, candidate_id: &str) -> Result<&mut CandidateMembership> {
        let room_id = self.room_id.clone();
        self.candidates
            .iter_mut()
            .find(|c| c.candidate_id == candidate_id)
            .ok_or_else(|| ProctorError::CandidateNotInRoom {
                room_id,
                candidate_id: candidate_id.to_string(),
            })
    }
}

/// Partial update applied by admins or by the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePatch {
    pub status: Option<MembershipStatus>,
    pub attempt_status: Option<AttemptStatus>,
    pub actual_start_time: Option<u64>,
    pub webrtc_offer: Option<SessionDescription>,
}

#[derive(Default)]
struct DirectoryInner {
    rooms: HashMap<String, Room>,
    by_assessment: HashMap<String, String>,
}

pub struct RoomDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl RoomDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(RwLock::new(DirectoryInner::default())),
        })
    }

    fn generate_room_id() -> String {
        let mut rng = rand::thread_rng();
        format!("{:06}", rng.gen_range(100000..999999))
    }

    /// Find the assessment's room (creating it if needed) and make sure the
    /// candidate is listed exactly once.
    pub async fn create_or_join(&self, assessment_id: &str, candidate_id: &str, now: u64) -> Result<Room> {
        if assessment_id.trim().is_empty() || candidate_id.trim().is_empty() {
            return Err(ProctorError::InvalidRequest(
                "assessmentId and candidateId are required".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;

        let existing = inner.by_assessment.get(assessment_id).cloned();
        let room_id = match existing {
            Some(id) => id,
            None => {
                let mut room_id = Self::generate_room_id();
                while inner.rooms.contains_key(&room_id) {
                    room_id = Self::generate_room_id();
                }
                inner.rooms.insert(
                    room_id.clone(),
                    Room {
                        room_id: room_id.clone(),
                        assessment_id: assessment_id.to_string(),
                        status: RoomStatus::Scheduled,
                        candidates: Vec::new(),
                        created_at: now,
                        expires_at: now + ROOM_TTL_MS,
                        started_at: None,
                        completed_at: None,
                    },
                );
                inner.by_assessment.insert(assessment_id.to_string(), room_id.clone());
                tracing::info!(room_id = %room_id, assessment_id = %assessment_id, "Room created");
                room_id
            }
        };

        let room = inner
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| ProctorError::RoomNotFound(room_id.clone()))?;

        if room.membership(candidate_id).is_none() {
            room.candidates.push(CandidateMembership::pending(candidate_id));
            tracing::info!(room_id = %room_id, candidate_id = %candidate_id, "Candidate added to room");
        }

        Ok(room.clone())
    }

    pub async fn get(&self, room_id: &str) -> Option<Room> {
        let inner = self.inner.read().await;
        inner.rooms.get(room_id).cloned()
    }

    pub async fn patch_candidate_status(
        &self,
        room_id: &str,
        candidate_id: &str,
        patch: CandidatePatch,
        now: u64,
    ) -> Result<CandidateMembership> {
        let mut inner = self.inner.write().await;
        let room = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| ProctorError::RoomNotFound(room_id.to_string()))?;

        let membership = room.membership_mut(candidate_id)?;
        if let Some(status) = patch.status {
            membership.status = status;
            membership.attempt_status = AttemptStatus::from(status);
            if status == MembershipStatus::Active {
                if membership.joined_at.is_none() {
                    membership.joined_at = Some(now);
                }
                if membership.actual_start_time.is_none() {
                    membership.actual_start_time = Some(now);
                }
            }
        }
        if let Some(attempt_status) = patch.attempt_status {
            membership.attempt_status = attempt_status;
        }
        if let Some(start) = patch.actual_start_time {
            membership.actual_start_time = Some(start);
        }
        if let Some(offer) = patch.webrtc_offer {
            membership.webrtc_offer = Some(offer);
        }
        membership.last_active_at = Some(now);
        let updated = membership.clone();

        if updated.status == MembershipStatus::Active && room.status == RoomStatus::Scheduled {
            room.status = RoomStatus::Active;
            room.started_at = Some(now);
        }
        if room
            .candidates
            .iter()
            .all(|c| c.status == MembershipStatus::Completed)
        {
            room.status = RoomStatus::Completed;
            room.completed_at = Some(now);
            tracing::info!(room_id = %room_id, "All candidates completed, room completed");
        }

        tracing::debug!(
            room_id = %room_id,
            candidate_id = %candidate_id,
            status = ?updated.status,
            "Candidate status updated"
        );
        Ok(updated)
    }

    /// Relay hook: a candidate connected to the signaling room. Rooms the
    /// directory has never heard of are ignored.
    pub async fn mark_connected(&self, room_id: &str, candidate_id: &str, now: u64) {
        let patch = CandidatePatch {
            status: Some(MembershipStatus::Active),
            ..CandidatePatch::default()
        };
        match self.patch_candidate_status(room_id, candidate_id, patch, now).await {
            Ok(_) => {}
            Err(ProctorError::RoomNotFound(_)) | Err(ProctorError::CandidateNotInRoom { .. }) => {
                tracing::debug!(room_id = %room_id, candidate_id = %candidate_id, "No directory entry for relay member");
            }
            Err(e) => {
                tracing::warn!(room_id = %room_id, candidate_id = %candidate_id, error = %e, "Failed to mark candidate active");
            }
        }
    }

    /// Refresh `lastActiveAt` without changing status.
    pub async fn touch(&self, room_id: &str, candidate_id: &str, now: u64) -> bool {
        let mut inner = self.inner.write().await;
        let Some(room) = inner.rooms.get_mut(room_id) else {
            return false;
        };
        match room.membership_mut(candidate_id) {
            Ok(membership) => {
                membership.last_active_at = Some(now);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_or_join_reuses_room_per_assessment() {
        let directory = RoomDirectory::new();
        let first = directory.create_or_join("asmt-1", "cand-1", 1_000).await.unwrap();
        let second = directory.create_or_join("asmt-1", "cand-2", 2_000).await.unwrap();

        assert_eq!(first.room_id, second.room_id);
        assert_eq!(first.room_id.len(), 6);
        assert_eq!(second.candidates.len(), 2);
        assert_eq!(second.status, RoomStatus::Scheduled);
        assert_eq!(second.expires_at, 1_000 + ROOM_TTL_MS);
    }

    #[tokio::test]
    async fn test_candidate_listed_once() {
        let directory = RoomDirectory::new();
        directory.create_or_join("asmt-1", "cand-1", 0).await.unwrap();
        let room = directory.create_or_join("asmt-1", "cand-1", 10).await.unwrap();
        assert_eq!(room.candidates.len(), 1);
        assert_eq!(room.candidates[0].status, MembershipStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejects_blank_ids() {
        let directory = RoomDirectory::new();
        let err = directory.create_or_join("", "cand-1", 0).await.unwrap_err();
        assert!(matches!(err, ProctorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_patch_active_sets_join_time_once() {
        let directory = RoomDirectory::new();
        let room = directory.create_or_join("asmt-1", "cand-1", 0).await.unwrap();

        let active = CandidatePatch {
            status: Some(MembershipStatus::Active),
            ..CandidatePatch::default()
        };
        let m = directory
            .patch_candidate_status(&room.room_id, "cand-1", active.clone(), 100)
            .await
            .unwrap();
        assert_eq!(m.joined_at, Some(100));
        assert_eq!(m.attempt_status, AttemptStatus::InProgress);

        let m = directory
            .patch_candidate_status(&room.room_id, "cand-1", active, 200)
            .await
            .unwrap();
        assert_eq!(m.joined_at, Some(100));
        assert_eq!(m.last_active_at, Some(200));

        let room = directory.get(&room.room_id).await.unwrap();
        assert_eq!(room.status, RoomStatus::Active);
        assert_eq!(room.started_at, Some(100));
    }

    #[tokio::test]
    async fn test_room_completes_when_everyone_completes() {
        let directory = RoomDirectory::new();
        let room = directory.create_or_join("asmt-1", "cand-1", 0).await.unwrap();
        directory.create_or_join("asmt-1", "cand-2", 0).await.unwrap();

        let done = CandidatePatch {
            status: Some(MembershipStatus::Completed),
            ..CandidatePatch::default()
        };
        directory
            .patch_candidate_status(&room.room_id, "cand-1", done.clone(), 10)
            .await
            .unwrap();
        assert_eq!(directory.get(&room.room_id).await.unwrap().status, RoomStatus::Scheduled);

        directory
            .patch_candidate_status(&room.room_id, "cand-2", done, 20)
            .await
            .unwrap();
        let room = directory.get(&room.room_id).await.unwrap();
        assert_eq!(room.status, RoomStatus::Completed);
        assert_eq!(room.completed_at, Some(20));
    }

    #[tokio::test]
    async fn test_explicit_attempt_status_overrides_derived() {
        let directory = RoomDirectory::new();
        let room = directory.create_or_join("asmt-1", "cand-1", 0).await.unwrap();
        let patch = CandidatePatch {
            status: Some(MembershipStatus::Error),
            attempt_status: Some(AttemptStatus::SessionOut),
            ..CandidatePatch::default()
        };
        let m = directory
            .patch_candidate_status(&room.room_id, "cand-1", patch, 5)
            .await
            .unwrap();
        assert_eq!(m.attempt_status, AttemptStatus::SessionOut);
    }

    #[tokio::test]
    async fn test_patch_unknown_room_and_candidate() {
        let directory = RoomDirectory::new();
        let err = directory
            .patch_candidate_status("999999", "cand-1", CandidatePatch::default(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ProctorError::RoomNotFound(_)));

        let room = directory.create_or_join("asmt-1", "cand-1", 0).await.unwrap();
        let err = directory
            .patch_candidate_status(&room.room_id, "ghost", CandidatePatch::default(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ProctorError::CandidateNotInRoom { .. }));
    }

    #[tokio::test]
    async fn test_mark_connected_ignores_unknown_rooms() {
        let directory = RoomDirectory::new();
        directory.mark_connected("R1", "cand-1", 0).await;
        assert!(directory.get("R1").await.is_none());
        assert!(!directory.touch("R1", "cand-1", 0).await);
    }

    #[test]
    fn test_expiry() {
        let room = Room {
            room_id: "123456".to_string(),
            assessment_id: "a".to_string(),
            status: RoomStatus::Scheduled,
            candidates: vec![],
            created_at: 0,
            expires_at: ROOM_TTL_MS,
            started_at: None,
            completed_at: None,
        };
        assert!(!room.is_expired(ROOM_TTL_MS - 1));
        assert!(room.is_expired(ROOM_TTL_MS));
    }
}
