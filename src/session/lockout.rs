use super::reason::TerminationReason;
use super::store::{
    SessionStore, CURRENT_ASSESSMENT_ID, SESSION_KEYS, SESSION_TERMINATION_REASON, SESSION_TIMEOUT,
    SESSION_TIMEOUT_TIMESTAMP, TIME_REMAINING,
};
use crate::error::Result;

pub const DEFAULT_TIME_REMAINING_MINUTES: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockoutStatus {
    Clear,
    Locked { reason: Option<String>, until: u64 },
}

impl LockoutStatus {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockoutStatus::Locked { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredSession {
    /// A lockout marker is in force.
    SessionOut,
    Active {
        assessment_id: Option<String>,
        time_remaining_minutes: u32,
    },
}

pub async fn set_lockout(store: &dyn SessionStore, reason: TerminationReason, until: u64) -> Result<()> {
    store.set(SESSION_TIMEOUT, "true").await?;
    store.set(SESSION_TIMEOUT_TIMESTAMP, &until.to_string()).await?;
    store.set(SESSION_TERMINATION_REASON, reason.as_tag()).await?;
    Ok(())
}

/// Read on every start before anything else. An expired marker is removed
/// so the candidate can enter again.
pub async fn check_lockout(store: &dyn SessionStore, now: u64) -> Result<LockoutStatus> {
    let flagged = store.get(SESSION_TIMEOUT).await?.as_deref() == Some("true");
    let until = store
        .get(SESSION_TIMEOUT_TIMESTAMP)
        .await?
        .and_then(|raw| raw.trim().parse::<u64>().ok());

    match (flagged, until) {
        (true, Some(until)) if now < until => Ok(LockoutStatus::Locked {
            reason: store.get(SESSION_TERMINATION_REASON).await?,
            until,
        }),
        (true, Some(until)) => {
            tracing::info!(expired_at = until, "Lockout expired, clearing markers");
            store.remove(SESSION_TIMEOUT).await?;
            store.remove(SESSION_TIMEOUT_TIMESTAMP).await?;
            store.remove(SESSION_TERMINATION_REASON).await?;
            Ok(LockoutStatus::Clear)
        }
        _ => Ok(LockoutStatus::Clear),
    }
}

pub async fn stored_session(store: &dyn SessionStore, now: u64) -> Result<StoredSession> {
    if check_lockout(store, now).await?.is_locked() {
        return Ok(StoredSession::SessionOut);
    }

    let time_remaining_minutes = store
        .get(TIME_REMAINING)
        .await?
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(DEFAULT_TIME_REMAINING_MINUTES);

    Ok(StoredSession::Active {
        assessment_id: store.get(CURRENT_ASSESSMENT_ID).await?,
        time_remaining_minutes,
    })
}

/// Session keys still present in the store.
pub async fn active_session_keys(store: &dyn SessionStore) -> Result<Vec<&'static str>> {
    let mut present = Vec::new();
    for key in SESSION_KEYS {
        if store.get(key).await?.is_some() {
            present.push(key);
        }
    }
    Ok(present)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::MemorySessionStore;

    #[tokio::test]
    async fn test_lockout_in_force() {
        let store = MemorySessionStore::new();
        set_lockout(&store, TerminationReason::NoFace, 10_000).await.unwrap();

        let status = check_lockout(&store, 9_999).await.unwrap();
        assert_eq!(
            status,
            LockoutStatus::Locked {
                reason: Some("NO_FACE".to_string()),
                until: 10_000,
            }
        );
        assert_eq!(stored_session(&store, 9_999).await.unwrap(), StoredSession::SessionOut);
    }

    #[tokio::test]
    async fn test_expired_lockout_is_cleared() {
        let store = MemorySessionStore::new();
        set_lockout(&store, TerminationReason::TabSwitch, 10_000).await.unwrap();

        assert_eq!(check_lockout(&store, 10_000).await.unwrap(), LockoutStatus::Clear);
        assert_eq!(store.get(SESSION_TIMEOUT).await.unwrap(), None);
        assert_eq!(store.get(SESSION_TIMEOUT_TIMESTAMP).await.unwrap(), None);
        assert_eq!(store.get(SESSION_TERMINATION_REASON).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stored_session_defaults() {
        let store = MemorySessionStore::new();
        store.set(CURRENT_ASSESSMENT_ID, "asmt-1").await.unwrap();

        assert_eq!(
            stored_session(&store, 0).await.unwrap(),
            StoredSession::Active {
                assessment_id: Some("asmt-1".to_string()),
                time_remaining_minutes: 30,
            }
        );

        store.set(TIME_REMAINING, "45").await.unwrap();
        assert!(matches!(
            stored_session(&store, 0).await.unwrap(),
            StoredSession::Active { time_remaining_minutes: 45, .. }
        ));
    }

    #[tokio::test]
    async fn test_unparsable_expiry_is_not_a_lockout() {
        let store = MemorySessionStore::new();
        store.set(SESSION_TIMEOUT, "true").await.unwrap();
        store.set(SESSION_TIMEOUT_TIMESTAMP, "soon").await.unwrap();
        assert_eq!(check_lockout(&store, 0).await.unwrap(), LockoutStatus::Clear);
    }
}
