use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;

use super::link::{IcePhase, LinkEvent, LinkEventSender, MediaStreamHandle, PeerLink, PeerLinkFactory};
use crate::config::WebRtcConfig;
use crate::error::{ProctorError, Result};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// Webcam track. Only NACK and PLI feedback are negotiated; the proctor
/// view needs keyframe recovery, not bandwidth estimation.
fn webcam_codec() -> RTCRtpCodecParameters {
    let feedback = |parameter: &str| RTCPFeedback {
        typ: "nack".to_string(),
        parameter: parameter.to_string(),
    };
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90_000,
            rtcp_feedback: vec![feedback(""), feedback("pli")],
            ..Default::default()
        },
        payload_type: 96,
        ..Default::default()
    }
}

/// Microphone track. Opus always signals two channels in SDP.
fn microphone_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        payload_type: 111,
        ..Default::default()
    }
}

/// One API per factory; every link it opens shares the codec table and
/// the IPv4-only ICE settings.
fn link_api() -> Result<Arc<API>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(webcam_codec(), RTPCodecType::Video)?;
    media_engine.register_codec(microphone_codec(), RTPCodecType::Audio)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    // IPv6 binding fails on most exam machines
    let mut settings = SettingEngine::default();
    settings.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
    settings.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

    Ok(Arc::new(
        APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build(),
    ))
}

fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let stun = config.stun_servers.iter().map(|url| RTCIceServer {
        urls: vec![url.clone()],
        ..Default::default()
    });
    let turn = config.turn_servers.iter().map(|server| RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        credential_type: RTCIceCredentialType::Password,
    });
    stun.chain(turn).collect()
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    converted.map_err(|e| ProctorError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp.clone())),
        other => Err(ProctorError::InvalidSdp(format!("unexpected description type {}", other))),
    }
}

fn ice_phase(state: RTCIceConnectionState) -> Option<IcePhase> {
    match state {
        RTCIceConnectionState::New => Some(IcePhase::New),
        RTCIceConnectionState::Checking => Some(IcePhase::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => Some(IcePhase::Connected),
        RTCIceConnectionState::Disconnected => Some(IcePhase::Disconnected),
        RTCIceConnectionState::Failed => Some(IcePhase::Failed),
        RTCIceConnectionState::Closed => Some(IcePhase::Closed),
        _ => None,
    }
}

/// `PeerLink` backed by a webrtc-rs peer connection.
pub struct WebRtcLink {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| ProctorError::CreateOfferFailed(e.to_string()))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| ProctorError::CreateAnswerFailed(e.to_string()))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| ProctorError::SetLocalDescriptionFailed(e.to_string()))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| {
                let message = e.to_string();
                if matches!(e, webrtc::Error::ErrConnectionClosed) || message.contains("signaling state") {
                    ProctorError::InvalidSignalingState(message)
                } else {
                    ProctorError::SetRemoteDescriptionFailed(message)
                }
            })
    }

    // webrtc-rs only accepts a rollback from have-remote-offer, never from
    // have-local-offer, so the coordinator swaps in a fresh link.
    async fn rollback(&self) -> Result<()> {
        Err(ProctorError::RollbackUnsupported)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| ProctorError::AddIceCandidateFailed(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!(peer_id = %self.peer_id, "Closing peer connection");
        self.peer_connection.close().await?;
        Ok(())
    }
}

pub struct WebRtcLinkFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcLinkFactory {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        Ok(Self {
            api: link_api()?,
            ice_servers: ice_servers(config),
        })
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn open(&self, peer_id: &str, events: LinkEventSender) -> Result<Arc<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| ProctorError::PeerConnectionCreation(e.to_string()))?,
        );

        peer_connection.add_transceiver_from_kind(RTPCodecType::Video, None).await?;
        peer_connection.add_transceiver_from_kind(RTPCodecType::Audio, None).await?;

        let candidate_events = events.clone();
        let candidate_peer = peer_id.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let peer_id = candidate_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(peer_id = %peer_id, error = %e, "Failed to serialize local ICE candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        let state_peer = peer_id.to_string();
        peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::info!(peer_id = %state_peer, state = %state, "ICE connection state changed");
            if let Some(phase) = ice_phase(state) {
                state_events.emit(LinkEvent::IceStateChanged(phase));
            }
            Box::pin(async {})
        }));

        let track_events = events;
        let track_peer = peer_id.to_string();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let handle = MediaStreamHandle {
                stream_id: track.stream_id(),
                track_id: track.id(),
                kind: track.kind().to_string(),
            };
            tracing::info!(
                peer_id = %track_peer,
                track_id = %handle.track_id,
                kind = %handle.kind,
                "Remote track arrived"
            );
            track_events.emit(LinkEvent::TrackArrived(handle));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcLink {
            peer_id: peer_id.to_string(),
            peer_connection,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[test]
    fn test_ice_servers_include_turn_credentials() {
        let config = WebRtcConfig {
            stun_servers: vec!["stun:stun.example.org:3478".to_string()],
            turn_servers: vec![TurnServer {
                urls: vec!["turn:turn.example.org:3478".to_string()],
                username: "webrtc".to_string(),
                credential: "secret".to_string(),
            }],
        };

        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(servers[1].username, "webrtc");
    }

    #[test]
    fn test_codecs_cover_webcam_and_microphone() {
        let video = webcam_codec();
        assert_eq!(video.capability.mime_type, MIME_TYPE_VP8);
        assert!(video.capability.rtcp_feedback.iter().any(|f| f.parameter == "pli"));
        let audio = microphone_codec();
        assert_eq!(audio.capability.mime_type, MIME_TYPE_OPUS);
        assert_eq!(audio.capability.channels, 2);
        assert!(link_api().is_ok());
    }

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(ice_phase(RTCIceConnectionState::Completed), Some(IcePhase::Connected));
        assert_eq!(ice_phase(RTCIceConnectionState::Failed), Some(IcePhase::Failed));
        assert_eq!(ice_phase(RTCIceConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_two_links_negotiate_locally() {
        use tokio::sync::mpsc;

        let factory = WebRtcLinkFactory::new(&WebRtcConfig {
            stun_servers: vec![],
            turn_servers: vec![],
        })
        .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let offerer = factory.open("admin", LinkEventSender::new(1, tx.clone())).await.unwrap();
        let answerer = factory.open("candidate", LinkEventSender::new(1, tx)).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();

        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_glare_on_real_link_answers_remote_offer() {
        use crate::peer::coordinator::testing::RecordingSink;
        use crate::peer::{NegotiationPhase, PeerCoordinator, PeerStatus, ReconnectPolicy, Role};
        use crate::protocol::Signal;
        use tokio::sync::mpsc;

        let factory = Arc::new(
            WebRtcLinkFactory::new(&WebRtcConfig {
                stun_servers: vec![],
                turn_servers: vec![],
            })
            .unwrap(),
        );
        let sink = Arc::new(RecordingSink::default());
        let mut candidate = PeerCoordinator::new(
            "proctor",
            Role::Offerer,
            factory.clone(),
            sink.clone(),
            ReconnectPolicy::default(),
        );
        candidate.start().await.unwrap();
        assert_eq!(candidate.state().negotiation, NegotiationPhase::HaveLocalOffer);

        // The proctor offers at the same time.
        let (tx, _rx) = mpsc::unbounded_channel();
        let proctor = factory.open("candidate", LinkEventSender::new(1, tx)).await.unwrap();
        let remote_offer = proctor.create_offer().await.unwrap();
        proctor.set_local_description(remote_offer.clone()).await.unwrap();

        candidate.handle_signal(Signal::Offer(remote_offer)).await.unwrap();
        assert_eq!(candidate.state().negotiation, NegotiationPhase::Stable);
        assert!(candidate.state().remote_description_set);
        assert_eq!(candidate.state().attempts, 0);
        assert_eq!(candidate.status(), PeerStatus::Negotiating);
        assert_eq!(sink.kinds(), vec!["offer", "answer"]);

        let answer = match sink.sent.lock().unwrap().last().map(|(_, s)| s.clone()) {
            Some(Signal::Answer(answer)) => answer,
            other => panic!("expected answer, got {:?}", other),
        };
        proctor.set_remote_description(answer).await.unwrap();

        candidate.close().await;
        proctor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_is_reported_unsupported() {
        use tokio::sync::mpsc;

        let factory = WebRtcLinkFactory::new(&WebRtcConfig {
            stun_servers: vec![],
            turn_servers: vec![],
        })
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.open("peer", LinkEventSender::new(1, tx)).await.unwrap();
        let offer = link.create_offer().await.unwrap();
        link.set_local_description(offer).await.unwrap();

        assert!(matches!(link.rollback().await, Err(ProctorError::RollbackUnsupported)));
        link.close().await.unwrap();
    }
}
