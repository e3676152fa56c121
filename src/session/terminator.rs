//! The one-way transition from an active exam session to a terminated one.
//!
//! Any integrity trigger may call `terminate`; the first call wins and runs
//! the whole sequence, later or concurrent calls return immediately. Each
//! step after the guard is best-effort: a failed report or a store error is
//! logged and the remaining steps still run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::lockout::set_lockout;
use super::reason::{TerminalView, TerminationReason};
use super::store::SessionStore;
use crate::directory::AttemptStatus;
use crate::error::Result;
use crate::protocol::now_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationRecord {
    pub candidate_id: String,
    pub assessment_id: String,
    pub warning_type: TerminationReason,
    pub message: String,
    pub timestamp: u64,
    pub warning_count: u32,
    pub attempt_status: AttemptStatus,
}

/// Persistence collaborator for termination records.
#[async_trait]
pub trait WarningRecorder: Send + Sync {
    async fn record_warning(&self, record: &TerminationRecord) -> Result<()>;
}

/// Moves the candidate to the terminal screen.
#[async_trait]
pub trait TerminalNavigator: Send + Sync {
    async fn show_terminal(&self, view: TerminalView);
}

/// Callback shared by all integrity triggers.
#[async_trait]
pub trait TerminationHandle: Send + Sync {
    async fn terminate(&self, reason: TerminationReason, message: String, warning_count: u32) -> TerminationOutcome;

    fn is_terminated(&self) -> bool;
}

/// Navigator that publishes the terminal view on a watch channel.
pub struct ChannelNavigator {
    tx: watch::Sender<Option<TerminalView>>,
}

impl ChannelNavigator {
    pub fn new() -> (Self, watch::Receiver<Option<TerminalView>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TerminalNavigator for ChannelNavigator {
    async fn show_terminal(&self, view: TerminalView) {
        self.tx.send_replace(Some(view));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub candidate_id: String,
    pub assessment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    Terminated {
        record: TerminationRecord,
        reported: bool,
        locked_until: u64,
    },
    /// Another trigger got there first.
    AlreadyTerminating,
}

pub struct SessionTerminator {
    identity: SessionIdentity,
    store: Arc<dyn SessionStore>,
    recorder: Arc<dyn WarningRecorder>,
    navigator: Arc<dyn TerminalNavigator>,
    lockout: Duration,
    terminating: AtomicBool,
}

impl SessionTerminator {
    pub fn new(
        identity: SessionIdentity,
        store: Arc<dyn SessionStore>,
        recorder: Arc<dyn WarningRecorder>,
        navigator: Arc<dyn TerminalNavigator>,
        lockout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            store,
            recorder,
            navigator,
            lockout,
            terminating: AtomicBool::new(false),
        })
    }

    async fn run_sequence(&self, reason: TerminationReason, message: String, warning_count: u32) -> TerminationOutcome {
        let now = now_millis();
        let record = TerminationRecord {
            candidate_id: self.identity.candidate_id.clone(),
            assessment_id: self.identity.assessment_id.clone(),
            warning_type: reason,
            message,
            timestamp: now,
            warning_count,
            attempt_status: AttemptStatus::SessionOut,
        };

        tracing::warn!(
            candidate_id = %record.candidate_id,
            assessment_id = %record.assessment_id,
            reason = %reason,
            warning_count,
            "Terminating exam session"
        );

        let reported = match self.recorder.record_warning(&record).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, reason = %reason, "Failed to report termination, ending session anyway");
                false
            }
        };

        if let Err(e) = self.store.clear().await {
            tracing::error!(error = %e, "Failed to clear session store");
        }

        let locked_until = now + self.lockout.as_millis() as u64;
        if let Err(e) = set_lockout(self.store.as_ref(), reason, locked_until).await {
            tracing::error!(error = %e, "Failed to persist lockout marker");
        }

        self.navigator.show_terminal(TerminalView::for_reason(reason)).await;

        TerminationOutcome::Terminated {
            record,
            reported,
            locked_until,
        }
    }
}

#[async_trait]
impl TerminationHandle for SessionTerminator {
    async fn terminate(&self, reason: TerminationReason, message: String, warning_count: u32) -> TerminationOutcome {
        if self
            .terminating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!(reason = %reason, "Session already terminating, ignoring trigger");
            return TerminationOutcome::AlreadyTerminating;
        }

        self.run_sequence(reason, message, warning_count).await
    }

    fn is_terminated(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}
