//! Integrity triggers for a candidate session.
//!
//! Tab switches, the exam countdown and face detection each watch their
//! own input and may ask the session terminator to end the exam. They only
//! share the observable `IntegrityState` and the termination callback.

pub mod countdown;
pub mod face;
pub mod tab_switch;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::session::{TerminationHandle, TerminationOutcome, TerminationReason};

pub use countdown::{severity, Countdown, Severity};
pub use face::{FaceClassification, FaceClassifier, FaceDetectionSampler, FaceWarning};
pub use tab_switch::{TabSwitchTrigger, Visibility};

/// Counters only ever grow within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityState {
    pub tab_switches: u32,
    pub face_warnings: u32,
    pub last_face_warning_ms: Option<u64>,
    pub seconds_remaining: Option<u64>,
    pub severity: Severity,
    pub terminated: Option<TerminationReason>,
}

/// Transient messages for whoever renders the exam screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityNotice {
    TabSwitchWarning {
        count: u32,
        remaining: u32,
        display_for: Duration,
    },
    FaceWarning(FaceWarning),
    SeverityChanged(Severity),
}

#[derive(Clone)]
pub struct IntegrityContext {
    state: Arc<watch::Sender<IntegrityState>>,
    notices: mpsc::UnboundedSender<IntegrityNotice>,
    terminator: Arc<dyn TerminationHandle>,
}

impl IntegrityContext {
    pub fn new(
        terminator: Arc<dyn TerminationHandle>,
    ) -> (Self, watch::Receiver<IntegrityState>, mpsc::UnboundedReceiver<IntegrityNotice>) {
        let (state, state_rx) = watch::channel(IntegrityState::default());
        let (notices, notices_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(state),
                notices,
                terminator,
            },
            state_rx,
            notices_rx,
        )
    }

    pub fn state(&self) -> IntegrityState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IntegrityState> {
        self.state.subscribe()
    }

    pub fn update(&self, apply: impl FnOnce(&mut IntegrityState)) -> IntegrityState {
        self.state.send_modify(apply);
        self.state()
    }

    pub fn notify(&self, notice: IntegrityNotice) {
        // Nobody rendering is fine.
        let _ = self.notices.send(notice);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator.is_terminated()
    }

    pub async fn terminate(&self, reason: TerminationReason, message: String, warning_count: u32) -> TerminationOutcome {
        let outcome = self.terminator.terminate(reason, message, warning_count).await;
        if matches!(outcome, TerminationOutcome::Terminated { .. }) {
            self.update(|state| state.terminated = Some(reason));
        }
        outcome
    }
}
