//! Headless candidate session: everything a candidate's exam client does
//! between opening the exam and landing on the terminal screen.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::api_client::{AssessmentMetadata, RoomLifecycle};
use super::signaling_client::SignalingClient;
use crate::config::Config;
use crate::directory::{AttemptStatus, CandidatePatch, MembershipStatus};
use crate::error::{ProctorError, Result};
use crate::integrity::{
    Countdown, FaceClassifier, FaceDetectionSampler, IntegrityContext, IntegrityNotice, TabSwitchTrigger, Visibility,
};
use crate::peer::{CaptureDevice, DeviceLease, PeerCoordinator, PeerLinkFactory, ReconnectPolicy, Role, SignalSink};
use crate::protocol::{now_millis, ServerMessage, SessionDescription, Signal};
use crate::session::{
    check_lockout, stored_session, LockoutStatus, SessionIdentity, SessionStore, SessionTerminator, StoredSession,
    TerminalNavigator, TerminalView, TerminationReason, WarningRecorder,
};
use crate::session::store::{CANDIDATE_ID, CURRENT_ASSESSMENT_ID, TIME_REMAINING};

/// Remote peer id used by the candidate's coordinator. Candidates never
/// learn the admin's id, so their signals go to the whole room.
const PROCTOR_PEER: &str = "proctor";

const PEER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Starting,
    LockedOut,
    Connecting,
    /// Camera or microphone unavailable; waiting for a retry.
    DeviceBlocked { message: String },
    InProgress { room_id: String },
    Terminated { reason: TerminationReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    LockedOut(TerminalView),
    Terminated(TerminationReason),
}

/// Collaborators a candidate session talks to.
pub struct SessionServices {
    pub store: Arc<dyn SessionStore>,
    pub metadata: Arc<dyn AssessmentMetadata>,
    pub rooms: Arc<dyn RoomLifecycle>,
    pub recorder: Arc<dyn WarningRecorder>,
    pub navigator: Arc<dyn TerminalNavigator>,
    pub links: Arc<dyn PeerLinkFactory>,
    pub device: Arc<CaptureDevice>,
    pub classifier: Arc<dyn FaceClassifier>,
}

/// Inputs the surrounding UI feeds into a running session.
pub struct SessionInputs {
    pub visibility: mpsc::UnboundedReceiver<Visibility>,
    /// Each message is one press of the device retry action.
    pub retry_device: mpsc::UnboundedReceiver<()>,
}

pub struct CandidateSession {
    config: Arc<Config>,
    identity: SessionIdentity,
    services: SessionServices,
    phase: watch::Sender<SessionPhase>,
    notices: Option<mpsc::UnboundedSender<IntegrityNotice>>,
}

/// Candidate-side sink: broadcasts every signal to the room and keeps the
/// latest offer in the room directory so a late proctor can pick it up.
struct RoomBroadcast {
    client: Arc<SignalingClient>,
    offers: mpsc::UnboundedSender<SessionDescription>,
}

#[async_trait]
impl SignalSink for RoomBroadcast {
    async fn send(&self, _to: &str, signal: Signal) -> Result<()> {
        if let Signal::Offer(offer) = &signal {
            let _ = self.offers.send(offer.clone());
        }
        self.client.send_signal(None, signal)
    }
}

impl CandidateSession {
    pub fn new(config: Arc<Config>, identity: SessionIdentity, services: SessionServices) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Starting);
        Self {
            config,
            identity,
            services,
            phase,
            notices: None,
        }
    }

    /// Forward integrity notices (transient warnings) to the caller.
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<IntegrityNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.send_replace(phase);
    }

    pub async fn run(self, inputs: SessionInputs) -> Result<SessionEnd> {
        let SessionInputs {
            visibility,
            mut retry_device,
        } = inputs;
        let store = self.services.store.clone();
        let candidate_id = self.identity.candidate_id.clone();
        let assessment_id = self.identity.assessment_id.clone();

        if let LockoutStatus::Locked { reason, until } = check_lockout(store.as_ref(), now_millis()).await? {
            tracing::info!(candidate_id = %candidate_id, until, "Session locked out");
            let view = TerminalView::for_tag(reason.as_deref());
            self.services.navigator.show_terminal(view.clone()).await;
            self.set_phase(SessionPhase::LockedOut);
            return Ok(SessionEnd::LockedOut(view));
        }

        let minutes = self.duration_minutes(&assessment_id).await?;
        store.set(CURRENT_ASSESSMENT_ID, &assessment_id).await?;
        store.set(CANDIDATE_ID, &candidate_id).await?;
        store.set(TIME_REMAINING, &minutes.to_string()).await?;

        self.set_phase(SessionPhase::Connecting);
        let room = self
            .services
            .rooms
            .create_or_join_room(&assessment_id, &candidate_id)
            .await?
            .room;
        let room_id = room.room_id.clone();

        let (client, inbound) = SignalingClient::connect_with_policy(
            &self.config.api.signaling_url,
            &room_id,
            &candidate_id,
            false,
            self.config.session.heartbeat_interval,
            ReconnectPolicy::from(&self.config.reconnect),
        )
        .await?;
        let client = Arc::new(client);

        let lease = self.acquire_device(&mut retry_device).await?;

        let (offers_tx, offers_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RoomBroadcast {
            client: client.clone(),
            offers: offers_tx,
        });
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let coordinator = PeerCoordinator::new(
            PROCTOR_PEER,
            Role::Offerer,
            self.services.links.clone(),
            sink,
            ReconnectPolicy::from(&self.config.reconnect),
        )
        .with_device(lease)
        .with_restarts(restart_rx);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut peer_task = tokio::spawn(async move {
            let status = coordinator.run(signals_rx).await;
            tracing::info!(?status, "Proctor link finished");
        });
        tasks.push(spawn_inbound_pump(inbound, candidate_id.clone(), signals_tx, restart_tx));
        tasks.push(spawn_offer_store(
            self.services.rooms.clone(),
            room_id.clone(),
            candidate_id.clone(),
            offers_rx,
        ));

        let started = CandidatePatch {
            status: Some(MembershipStatus::Active),
            attempt_status: Some(AttemptStatus::InProgress),
            actual_start_time: Some(now_millis()),
            webrtc_offer: None,
        };
        if let Err(e) = self
            .services
            .rooms
            .patch_candidate_status(&room_id, &candidate_id, &started)
            .await
        {
            tracing::warn!(room_id = %room_id, error = %e, "Failed to mark membership active");
        }

        let terminator = SessionTerminator::new(
            self.identity.clone(),
            store.clone(),
            self.services.recorder.clone(),
            self.services.navigator.clone(),
            self.config.integrity.lockout,
        );
        let (ctx, mut state, notices) = IntegrityContext::new(terminator);
        tasks.push(self.spawn_notice_forwarder(notices));

        let tab_trigger = TabSwitchTrigger::new(ctx.clone(), &self.config.integrity);
        let mut visibility = visibility;
        tasks.push(tokio::spawn(tab_trigger.run(futures::stream::poll_fn(move |cx| {
            visibility.poll_recv(cx)
        }))));

        let countdown = Countdown::new(ctx.clone(), minutes);
        tasks.push(tokio::spawn(async move {
            countdown.run().await;
        }));

        let sampler = FaceDetectionSampler::new(ctx.clone(), &self.config.integrity);
        let classifier = self.services.classifier.clone();
        tasks.push(tokio::spawn(async move {
            sampler.run(classifier).await;
        }));

        self.set_phase(SessionPhase::InProgress {
            room_id: room_id.clone(),
        });
        tracing::info!(room_id = %room_id, candidate_id = %candidate_id, minutes, "Exam session in progress");

        let reason = match state.wait_for(|s| s.terminated.is_some()).await {
            Ok(current) => current.terminated,
            Err(_) => None,
        };
        let reason = reason.ok_or_else(|| ProctorError::internal("integrity state closed before termination"))?;

        // Aborting the inbound pump drops the coordinator's signal source,
        // which closes the link and releases the capture device.
        for task in tasks {
            task.abort();
        }
        if tokio::time::timeout(PEER_SHUTDOWN_GRACE, &mut peer_task).await.is_err() {
            tracing::warn!("Proctor link did not close in time, aborting");
            peer_task.abort();
        }
        client.leave().await;

        self.set_phase(SessionPhase::Terminated { reason });
        Ok(SessionEnd::Terminated(reason))
    }

    /// Duration from the assessment collaborator, falling back to what the
    /// store remembers from an earlier start.
    async fn duration_minutes(&self, assessment_id: &str) -> Result<u32> {
        match self.services.metadata.get_duration(assessment_id).await {
            Ok(minutes) => Ok(minutes),
            Err(e) => {
                let fallback = match stored_session(self.services.store.as_ref(), now_millis()).await? {
                    StoredSession::Active {
                        time_remaining_minutes, ..
                    } => time_remaining_minutes,
                    StoredSession::SessionOut => 0,
                };
                tracing::warn!(assessment_id = %assessment_id, error = %e, fallback, "Duration lookup failed");
                Ok(fallback)
            }
        }
    }

    async fn acquire_device(&self, retry: &mut mpsc::UnboundedReceiver<()>) -> Result<DeviceLease> {
        loop {
            match self.services.device.acquire() {
                Ok(lease) => return Ok(lease),
                Err(e) if e.is_device_error() => {
                    tracing::warn!(device = %self.services.device.name(), error = %e, "Capture device blocked");
                    self.set_phase(SessionPhase::DeviceBlocked {
                        message: e.to_string(),
                    });
                    if retry.recv().await.is_none() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_notice_forwarder(&self, mut notices: mpsc::UnboundedReceiver<IntegrityNotice>) -> JoinHandle<()> {
        let forward = self.notices.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                tracing::debug!(?notice, "Integrity notice");
                if let Some(forward) = &forward {
                    let _ = forward.send(notice);
                }
            }
        })
    }
}

/// Routes proctor signals to the coordinator. Only frames explicitly
/// addressed to this candidate are applied. A rejoin after the signaling
/// socket bounced asks the coordinator to renegotiate from scratch.
fn spawn_inbound_pump(
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    candidate_id: String,
    signals: mpsc::UnboundedSender<Signal>,
    restarts: mpsc::UnboundedSender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            match message {
                ServerMessage::WebrtcSignal(signal) => {
                    if signal.from_id == candidate_id || signal.to_id.as_deref() != Some(candidate_id.as_str()) {
                        continue;
                    }
                    if signals.send(signal.signal).is_err() {
                        break;
                    }
                }
                ServerMessage::RoomJoined { room_id, .. } => {
                    tracing::info!(room_id = %room_id, "Signaling rejoined, restarting proctor link");
                    let _ = restarts.send(());
                }
                ServerMessage::AdminLeft { admin_id } => {
                    tracing::info!(admin_id = %admin_id, "Proctor left the room");
                }
                ServerMessage::RoomError { message } => {
                    tracing::warn!(message = %message, "Relay reported an error");
                }
                _ => {}
            }
        }
        tracing::debug!("Signaling inbound stream ended");
    })
}

fn spawn_offer_store(
    rooms: Arc<dyn RoomLifecycle>,
    room_id: String,
    candidate_id: String,
    mut offers: mpsc::UnboundedReceiver<SessionDescription>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(offer) = offers.recv().await {
            let patch = CandidatePatch {
                webrtc_offer: Some(offer),
                ..CandidatePatch::default()
            };
            if let Err(e) = rooms.patch_candidate_status(&room_id, &candidate_id, &patch).await {
                tracing::warn!(room_id = %room_id, error = %e, "Failed to store offer");
            }
        }
    })
}
