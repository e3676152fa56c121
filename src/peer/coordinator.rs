//! Per-peer negotiation state machine.
//!
//! A coordinator exclusively owns one remote peer's link and drives the
//! offer/answer/ICE exchange over it. All negotiation steps run through
//! `&mut self`, so two negotiations on the same link can never interleave.
//! Link callbacks arrive on a channel tagged with the link generation;
//! anything from a link that was already torn down is dropped.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::device::DeviceLease;
use super::link::{
    IcePhase, LinkEvent, LinkEventSender, MediaStreamHandle, NegotiationPhase, PeerLink, PeerLinkFactory,
};
use crate::config::ReconnectConfig;
use crate::error::{ProctorError, Result};
use crate::protocol::{IceCandidate, SessionDescription, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the initial offer and every reconnection offer.
    Offerer,
    /// Waits for offers.
    Answerer,
}

/// Outbound signaling path to the remote peer.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, to: &str, signal: Signal) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerStatus {
    Idle,
    Negotiating,
    Connected { stream: Option<MediaStreamHandle> },
    Reconnecting { attempt: u32 },
    Failed { attempts: u32 },
    Closed,
}

impl PeerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerStatus::Failed { .. } | PeerStatus::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

#[derive(Debug)]
pub struct PeerConnectionState {
    pub negotiation: NegotiationPhase,
    pub ice: IcePhase,
    pub remote_description_set: bool,
    /// Remote candidates received before the remote description, in
    /// arrival order.
    pub pending_candidates: VecDeque<IceCandidate>,
    pub attempts: u32,
}

impl PeerConnectionState {
    fn new() -> Self {
        Self {
            negotiation: NegotiationPhase::Stable,
            ice: IcePhase::New,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            attempts: 0,
        }
    }

    fn reset_link(&mut self) {
        self.negotiation = NegotiationPhase::Stable;
        self.ice = IcePhase::New;
        self.remote_description_set = false;
        self.pending_candidates.clear();
    }
}

pub struct PeerCoordinator {
    peer_id: String,
    role: Role,
    factory: Arc<dyn PeerLinkFactory>,
    sink: Arc<dyn SignalSink>,
    policy: ReconnectPolicy,
    link: Option<Arc<dyn PeerLink>>,
    generation: u64,
    state: PeerConnectionState,
    stream: Option<MediaStreamHandle>,
    device: Option<DeviceLease>,
    status: watch::Sender<PeerStatus>,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    events_rx: Option<mpsc::UnboundedReceiver<(u64, LinkEvent)>>,
    restarts: Option<mpsc::UnboundedReceiver<()>>,
}

async fn next_restart(restarts: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match restarts {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl PeerCoordinator {
    pub fn new(
        peer_id: impl Into<String>,
        role: Role,
        factory: Arc<dyn PeerLinkFactory>,
        sink: Arc<dyn SignalSink>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(PeerStatus::Idle);
        Self {
            peer_id: peer_id.into(),
            role,
            factory,
            sink,
            policy,
            link: None,
            generation: 0,
            state: PeerConnectionState::new(),
            stream: None,
            device: None,
            status,
            events_tx,
            events_rx: Some(events_rx),
            restarts: None,
        }
    }

    /// Hold the capture device for as long as this coordinator lives.
    pub fn with_device(mut self, lease: DeviceLease) -> Self {
        self.device = Some(lease);
        self
    }

    /// Each message on `restarts` asks `run` to renegotiate from scratch,
    /// e.g. after the signaling socket came back and the remote side lost
    /// its half of the link.
    pub fn with_restarts(mut self, restarts: mpsc::UnboundedReceiver<()>) -> Self {
        self.restarts = Some(restarts);
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> &PeerConnectionState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    fn set_status(&self, status: PeerStatus) {
        self.status.send_replace(status);
    }

    async fn open_link(&mut self) -> Result<Arc<dyn PeerLink>> {
        self.generation += 1;
        self.state.reset_link();
        let events = LinkEventSender::new(self.generation, self.events_tx.clone());
        let link = self.factory.open(&self.peer_id, events).await?;
        self.link = Some(link.clone());
        tracing::debug!(peer_id = %self.peer_id, generation = self.generation, "Peer link opened");
        Ok(link)
    }

    async fn ensure_link(&mut self) -> Result<Arc<dyn PeerLink>> {
        match &self.link {
            Some(link) => Ok(link.clone()),
            None => self.open_link().await,
        }
    }

    async fn teardown_link(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.close().await {
                tracing::debug!(peer_id = %self.peer_id, error = %e, "Error closing peer link");
            }
        }
        self.state.reset_link();
        self.stream = None;
    }

    pub async fn start(&mut self) -> Result<()> {
        self.ensure_link().await?;
        self.set_status(PeerStatus::Negotiating);
        if self.role == Role::Offerer {
            self.send_offer().await?;
        }
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<()> {
        let link = self.ensure_link().await?;
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        self.state.negotiation = NegotiationPhase::HaveLocalOffer;
        self.sink.send(&self.peer_id, Signal::Offer(offer)).await?;
        tracing::info!(peer_id = %self.peer_id, "Sent offer");
        Ok(())
    }

    /// Apply one inbound negotiation step. Malformed payloads are logged
    /// and dropped; a remote description the link refuses restarts the
    /// link through the reconnection path.
    pub async fn handle_signal(&mut self, signal: Signal) -> Result<()> {
        if self.status.borrow().is_terminal() {
            tracing::debug!(peer_id = %self.peer_id, kind = signal.kind(), "Ignoring signal for finished peer");
            return Ok(());
        }

        let result = match signal {
            Signal::Offer(offer) => self.apply_offer(offer).await,
            Signal::Answer(answer) => self.apply_answer(answer).await,
            Signal::IceCandidate(candidate) => {
                self.apply_candidate(candidate).await;
                Ok(())
            }
        };

        match result {
            Err(ProctorError::InvalidSdp(reason)) | Err(ProctorError::InvalidSignalingMessage(reason)) => {
                tracing::warn!(peer_id = %self.peer_id, reason = %reason, "Ignoring malformed signal");
                Ok(())
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(peer_id = %self.peer_id, error = %e, "Negotiation step rejected, reconnecting");
                self.reconnect().await
            }
            other => other,
        }
    }

    /// Return to `stable` after an offer collision. A backend that cannot
    /// roll back in place gets a fresh link instead; queued remote
    /// candidates survive the swap and no reconnect attempt is charged.
    async fn roll_back_local_offer(&mut self, link: Arc<dyn PeerLink>) -> Result<Arc<dyn PeerLink>> {
        tracing::info!(peer_id = %self.peer_id, "Offer collision, rolling back local offer");
        let link = match link.rollback().await {
            Ok(()) => link,
            Err(e) => {
                tracing::debug!(peer_id = %self.peer_id, error = %e, "In-place rollback refused, replacing link");
                let pending = std::mem::take(&mut self.state.pending_candidates);
                self.teardown_link().await;
                let fresh = self.open_link().await?;
                self.state.pending_candidates = pending;
                fresh
            }
        };
        self.state.negotiation = NegotiationPhase::Stable;
        Ok(link)
    }

    async fn apply_offer(&mut self, offer: SessionDescription) -> Result<()> {
        let mut link = self.ensure_link().await?;

        if self.state.negotiation == NegotiationPhase::HaveLocalOffer {
            link = self.roll_back_local_offer(link).await?;
        }

        if *self.status.borrow() == PeerStatus::Idle {
            self.set_status(PeerStatus::Negotiating);
        }

        link.set_remote_description(offer).await?;
        self.state.negotiation = NegotiationPhase::HaveRemoteOffer;
        self.state.remote_description_set = true;
        self.flush_pending_candidates(&link).await;

        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.state.negotiation = NegotiationPhase::Stable;
        self.sink.send(&self.peer_id, Signal::Answer(answer)).await?;
        tracing::info!(peer_id = %self.peer_id, "Sent answer");
        Ok(())
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.state.negotiation != NegotiationPhase::HaveLocalOffer {
            tracing::warn!(
                peer_id = %self.peer_id,
                state = %self.state.negotiation,
                "Ignoring answer received outside have-local-offer"
            );
            return Ok(());
        }
        let Some(link) = self.link.clone() else {
            return Ok(());
        };

        link.set_remote_description(answer).await?;
        self.state.negotiation = NegotiationPhase::Stable;
        self.state.remote_description_set = true;
        tracing::info!(peer_id = %self.peer_id, "Remote answer applied");
        self.flush_pending_candidates(&link).await;
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if candidate.candidate.trim().is_empty() {
            tracing::debug!(peer_id = %self.peer_id, "Ignoring empty ICE candidate");
            return;
        }

        match (self.link.clone(), self.state.remote_description_set) {
            (Some(link), true) => {
                if let Err(e) = link.add_ice_candidate(candidate).await {
                    tracing::warn!(peer_id = %self.peer_id, error = %e, "Failed to add ICE candidate");
                }
            }
            _ => {
                self.state.pending_candidates.push_back(candidate);
                tracing::debug!(
                    peer_id = %self.peer_id,
                    queued = self.state.pending_candidates.len(),
                    "Queued ICE candidate until remote description is set"
                );
            }
        }
    }

    async fn flush_pending_candidates(&mut self, link: &Arc<dyn PeerLink>) {
        if self.state.pending_candidates.is_empty() {
            return;
        }

        let pending: Vec<_> = self.state.pending_candidates.drain(..).collect();
        tracing::info!(peer_id = %self.peer_id, count = pending.len(), "Flushing queued ICE candidates");
        for candidate in pending {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                tracing::warn!(peer_id = %self.peer_id, error = %e, "Failed to add queued ICE candidate");
            }
        }
    }

    pub async fn handle_link_event(&mut self, generation: u64, event: LinkEvent) -> Result<()> {
        if generation != self.generation || self.link.is_none() {
            tracing::trace!(peer_id = %self.peer_id, generation, "Dropping event from retired link");
            return Ok(());
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.sink.send(&self.peer_id, Signal::IceCandidate(candidate)).await
            }
            LinkEvent::IceStateChanged(phase) => {
                self.state.ice = phase;
                match phase {
                    IcePhase::Connected => {
                        if self.state.attempts > 0 {
                            tracing::info!(peer_id = %self.peer_id, attempts = self.state.attempts, "Peer reconnected");
                        }
                        self.state.attempts = 0;
                        self.set_status(PeerStatus::Connected {
                            stream: self.stream.clone(),
                        });
                        Ok(())
                    }
                    IcePhase::Failed => {
                        tracing::warn!(peer_id = %self.peer_id, "ICE failed");
                        self.reconnect().await
                    }
                    IcePhase::Disconnected => {
                        tracing::debug!(peer_id = %self.peer_id, "ICE disconnected, waiting for recovery");
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            LinkEvent::TrackArrived(handle) => {
                self.stream = Some(handle.clone());
                self.set_status(PeerStatus::Connected { stream: Some(handle) });
                Ok(())
            }
        }
    }

    /// Discard the current link and start over after the backoff delay.
    /// Once the attempt budget is spent the peer is marked failed.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.teardown_link().await;
        self.state.attempts += 1;
        let attempt = self.state.attempts;

        if attempt > self.policy.max_attempts {
            let attempts = self.policy.max_attempts;
            tracing::error!(peer_id = %self.peer_id, attempts, "Giving up on peer connection");
            self.device = None;
            self.set_status(PeerStatus::Failed { attempts });
            return Err(ProctorError::ReconnectExhausted {
                peer_id: self.peer_id.clone(),
                attempts,
            });
        }

        let delay = self.policy.delay_for(attempt);
        tracing::warn!(
            peer_id = %self.peer_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnection"
        );
        self.set_status(PeerStatus::Reconnecting { attempt });
        tokio::time::sleep(delay).await;

        self.open_link().await?;
        self.set_status(PeerStatus::Negotiating);
        if self.role == Role::Offerer {
            self.send_offer().await?;
        }
        Ok(())
    }

    /// Replace the link and renegotiate without charging a reconnect
    /// attempt. Used when the remote side dropped its link while ours was
    /// still healthy.
    pub async fn restart(&mut self) -> Result<()> {
        tracing::info!(peer_id = %self.peer_id, "Restarting negotiation on a fresh link");
        self.teardown_link().await;
        self.open_link().await?;
        self.set_status(PeerStatus::Negotiating);
        if self.role == Role::Offerer {
            self.send_offer().await?;
        }
        Ok(())
    }

    /// Keep reconnecting until one attempt gets through or the budget runs out.
    async fn recover(&mut self, cause: ProctorError) -> Result<()> {
        let mut cause = cause;
        loop {
            if matches!(cause, ProctorError::ReconnectExhausted { .. }) {
                return Err(cause);
            }
            tracing::warn!(peer_id = %self.peer_id, error = %cause, "Peer link setup failed");
            match self.reconnect().await {
                Ok(()) => return Ok(()),
                Err(e) => cause = e,
            }
        }
    }

    pub async fn close(&mut self) {
        self.teardown_link().await;
        self.device = None;
        if !self.status.borrow().is_terminal() {
            self.set_status(PeerStatus::Closed);
        }
        tracing::info!(peer_id = %self.peer_id, "Peer coordinator closed");
    }

    /// Drive the coordinator until the signal source closes or the peer
    /// fails for good. Returns the final status.
    pub async fn run(mut self, mut signals: mpsc::UnboundedReceiver<Signal>) -> PeerStatus {
        let Some(mut events) = self.events_rx.take() else {
            tracing::error!(peer_id = %self.peer_id, "Coordinator event stream already taken");
            return self.status();
        };
        let mut restarts = self.restarts.take();

        if let Err(e) = self.start().await {
            if let Err(e) = self.recover(e).await {
                tracing::error!(peer_id = %self.peer_id, error = %e, "Peer connection abandoned");
                self.close().await;
                return self.status();
            }
        }

        loop {
            let result = tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        tracing::debug!(peer_id = %self.peer_id, "Signal source closed");
                        break;
                    }
                },
                Some((generation, event)) = events.recv() => {
                    self.handle_link_event(generation, event).await
                }
                restart = next_restart(&mut restarts) => match restart {
                    Some(()) => self.restart().await,
                    None => {
                        restarts = None;
                        Ok(())
                    }
                },
            };

            match result {
                Ok(()) => {}
                Err(e @ ProctorError::ReconnectExhausted { .. }) => {
                    tracing::error!(peer_id = %self.peer_id, error = %e, "Peer connection abandoned");
                    break;
                }
                Err(ProctorError::ChannelClosed) => {
                    tracing::warn!(peer_id = %self.peer_id, "Signaling channel closed");
                    break;
                }
                Err(e) => {
                    if let Err(e) = self.recover(e).await {
                        tracing::error!(peer_id = %self.peer_id, error = %e, "Peer connection abandoned");
                        break;
                    }
                }
            }
        }

        self.close().await;
        self.status()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Call, MockFactory, RecordingSink};
    use super::*;
    use crate::peer::device::CaptureDevice;
    use crate::protocol::SdpKind;
    use std::sync::atomic::Ordering;

    fn coordinator(role: Role, policy: ReconnectPolicy) -> (PeerCoordinator, Arc<MockFactory>, Arc<RecordingSink>) {
        let factory = Arc::new(MockFactory::default());
        let sink = Arc::new(RecordingSink::default());
        let coordinator = PeerCoordinator::new("peer-1", role, factory.clone(), sink.clone(), policy);
        (coordinator, factory, sink)
    }

    fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        };
        let delays: Vec<_> = (1..=7).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn test_offerer_reaches_stable_after_answer() {
        let (mut peer, factory, sink) = coordinator(Role::Offerer, quick_policy(3));
        peer.start().await.unwrap();
        assert_eq!(peer.state().negotiation, NegotiationPhase::HaveLocalOffer);
        assert_eq!(sink.kinds(), vec!["offer"]);

        peer.handle_signal(Signal::Answer(SessionDescription::answer("v=0"))).await.unwrap();
        assert_eq!(peer.state().negotiation, NegotiationPhase::Stable);

        let generation = factory.last_events().generation();
        peer.handle_link_event(generation, LinkEvent::IceStateChanged(IcePhase::Connected))
            .await
            .unwrap();
        assert_eq!(peer.state().ice, IcePhase::Connected);
        assert_eq!(peer.status(), PeerStatus::Connected { stream: None });
    }

    #[tokio::test]
    async fn test_glare_rolls_back_before_applying_remote_offer() {
        let (mut peer, factory, sink) = coordinator(Role::Offerer, quick_policy(3));
        peer.start().await.unwrap();

        peer.handle_signal(Signal::Offer(SessionDescription::offer("remote"))).await.unwrap();

        let calls = factory.calls();
        let rollback = calls.iter().position(|c| *c == Call::Rollback).unwrap();
        let remote = calls
            .iter()
            .position(|c| *c == Call::SetRemote(SdpKind::Offer))
            .unwrap();
        assert!(rollback < remote);
        assert_eq!(peer.state().negotiation, NegotiationPhase::Stable);
        assert_eq!(sink.kinds(), vec!["offer", "answer"]);
    }

    #[tokio::test]
    async fn test_glare_without_rollback_support_swaps_link() {
        let (mut peer, factory, sink) = coordinator(Role::Offerer, quick_policy(3));
        factory.refuse_rollback.store(true, Ordering::SeqCst);
        peer.start().await.unwrap();
        peer.handle_signal(Signal::IceCandidate(IceCandidate::new("early"))).await.unwrap();

        peer.handle_signal(Signal::Offer(SessionDescription::offer("remote"))).await.unwrap();

        assert_eq!(factory.opened(), 2);
        assert_eq!(peer.state().attempts, 0);
        assert_eq!(peer.state().negotiation, NegotiationPhase::Stable);
        assert_eq!(peer.status(), PeerStatus::Negotiating);
        assert_eq!(sink.kinds(), vec!["offer", "answer"]);

        // The remote offer and the early candidate land on the replacement link.
        let second = factory.last_events().generation();
        let journal = factory.journal.lock().unwrap().clone();
        assert!(journal.contains(&(second, Call::SetRemote(SdpKind::Offer))));
        assert!(journal.contains(&(second, Call::AddCandidate("early".to_string()))));
        assert!(journal.contains(&(second, Call::SetLocal(SdpKind::Answer))));
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (mut peer, factory, _sink) = coordinator(Role::Answerer, quick_policy(3));
        peer.start().await.unwrap();

        for name in ["c1", "c2", "c3"] {
            peer.handle_signal(Signal::IceCandidate(IceCandidate::new(name))).await.unwrap();
        }
        assert_eq!(peer.state().pending_candidates.len(), 3);
        assert!(!factory.calls().iter().any(|c| matches!(c, Call::AddCandidate(_))));

        peer.handle_signal(Signal::Offer(SessionDescription::offer("remote"))).await.unwrap();
        assert!(peer.state().pending_candidates.is_empty());

        let calls = factory.calls();
        let remote = calls
            .iter()
            .position(|c| *c == Call::SetRemote(SdpKind::Offer))
            .unwrap();
        let added: Vec<_> = calls[remote..]
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(name) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(added, vec!["c1", "c2", "c3"]);

        // Later candidates go straight to the link.
        peer.handle_signal(Signal::IceCandidate(IceCandidate::new("c4"))).await.unwrap();
        assert_eq!(factory.calls().last(), Some(&Call::AddCandidate("c4".to_string())));
    }

    #[tokio::test]
    async fn test_empty_candidate_and_stale_answer_are_ignored() {
        let (mut peer, factory, _sink) = coordinator(Role::Answerer, quick_policy(3));
        peer.start().await.unwrap();

        peer.handle_signal(Signal::IceCandidate(IceCandidate::new("  "))).await.unwrap();
        assert!(peer.state().pending_candidates.is_empty());

        peer.handle_signal(Signal::Answer(SessionDescription::answer("late"))).await.unwrap();
        assert_eq!(peer.state().negotiation, NegotiationPhase::Stable);
        assert!(!factory.calls().contains(&Call::SetRemote(SdpKind::Answer)));
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded() {
        let (mut peer, factory, sink) = coordinator(Role::Offerer, quick_policy(3));
        peer.start().await.unwrap();
        let generation = factory.last_events().generation();

        peer.handle_link_event(generation, LinkEvent::LocalCandidate(IceCandidate::new("local-1")))
            .await
            .unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[1].0, "peer-1");
        assert_eq!(sent[1].1, Signal::IceCandidate(IceCandidate::new("local-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ice_failure_renegotiates_with_fresh_link() {
        let (mut peer, factory, sink) = coordinator(Role::Offerer, quick_policy(3));
        peer.start().await.unwrap();
        let first = factory.last_events().generation();

        peer.handle_link_event(first, LinkEvent::IceStateChanged(IcePhase::Failed))
            .await
            .unwrap();

        assert_eq!(factory.opened(), 2);
        assert_eq!(peer.state().attempts, 1);
        assert_eq!(sink.kinds(), vec!["offer", "offer"]);
        assert!(factory.calls().contains(&Call::Close));

        // Callbacks from the retired link no longer count.
        peer.handle_link_event(first, LinkEvent::IceStateChanged(IcePhase::Failed))
            .await
            .unwrap();
        assert_eq!(factory.opened(), 2);

        let second = factory.last_events().generation();
        peer.handle_link_event(second, LinkEvent::IceStateChanged(IcePhase::Connected))
            .await
            .unwrap();
        assert_eq!(peer.state().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_exhaustion_marks_failed() {
        let (mut peer, factory, _sink) = coordinator(Role::Offerer, quick_policy(2));
        let device = CaptureDevice::new("camera");
        peer = peer.with_device(device.acquire().unwrap());
        peer.start().await.unwrap();

        for _ in 0..2 {
            let generation = factory.last_events().generation();
            peer.handle_link_event(generation, LinkEvent::IceStateChanged(IcePhase::Failed))
                .await
                .unwrap();
        }

        let generation = factory.last_events().generation();
        let err = peer
            .handle_link_event(generation, LinkEvent::IceStateChanged(IcePhase::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, ProctorError::ReconnectExhausted { attempts: 2, .. }));
        assert_eq!(peer.status(), PeerStatus::Failed { attempts: 2 });
        assert!(!device.is_leased());
        assert_eq!(factory.opened(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_remote_offer_takes_reconnect_path() {
        let (mut peer, factory, _sink) = coordinator(Role::Answerer, quick_policy(3));
        peer.start().await.unwrap();
        factory.reject_remote.store(true, Ordering::SeqCst);

        peer.handle_signal(Signal::Offer(SessionDescription::offer("remote"))).await.unwrap();
        assert_eq!(factory.opened(), 2);
        assert_eq!(peer.state().attempts, 1);
        assert_eq!(peer.status(), PeerStatus::Negotiating);
    }

    #[tokio::test]
    async fn test_track_arrival_reports_stream() {
        let (mut peer, factory, _sink) = coordinator(Role::Answerer, quick_policy(3));
        let mut status = peer.subscribe();
        peer.start().await.unwrap();

        let handle = MediaStreamHandle {
            stream_id: "stream-1".to_string(),
            track_id: "video-1".to_string(),
            kind: "video".to_string(),
        };
        let generation = factory.last_events().generation();
        peer.handle_link_event(generation, LinkEvent::TrackArrived(handle.clone()))
            .await
            .unwrap();

        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), PeerStatus::Connected { stream: Some(handle) });
    }

    #[tokio::test]
    async fn test_restart_sends_fresh_offer_without_charging_attempt() {
        let (peer, factory, sink) = coordinator(Role::Offerer, quick_policy(3));
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let mut status = peer.subscribe();
        let peer = peer.with_restarts(restart_rx);

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(peer.run(signals_rx));
        status.wait_for(|s| *s == PeerStatus::Negotiating).await.unwrap();

        restart_tx.send(()).unwrap();
        while factory.opened() < 2 {
            tokio::task::yield_now().await;
        }
        signals_tx.send(Signal::Answer(SessionDescription::answer("v=0"))).unwrap();
        drop(signals_tx);

        assert_eq!(task.await.unwrap(), PeerStatus::Closed);
        assert_eq!(sink.kinds(), vec!["offer", "offer"]);
        let second = factory.last_events().generation();
        let journal = factory.journal.lock().unwrap().clone();
        assert!(journal.contains(&(second, Call::SetRemote(SdpKind::Answer))));
    }

    #[tokio::test]
    async fn test_run_releases_device_when_signals_close() {
        let (peer, _factory, sink) = coordinator(Role::Offerer, quick_policy(3));
        let device = CaptureDevice::new("camera");
        let peer = peer.with_device(device.acquire().unwrap());

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(peer.run(rx));
        tx.send(Signal::Answer(SessionDescription::answer("v=0"))).unwrap();
        drop(tx);

        let final_status = task.await.unwrap();
        assert_eq!(final_status, PeerStatus::Closed);
        assert!(!device.is_leased());
        assert_eq!(sink.kinds(), vec!["offer"]);
    }
}
