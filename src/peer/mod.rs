pub mod coordinator;
pub mod device;
pub mod hub;
pub mod link;
pub mod webrtc_link;

pub use coordinator::{PeerConnectionState, PeerCoordinator, PeerStatus, ReconnectPolicy, Role, SignalSink};
pub use device::{CaptureDevice, DeviceLease};
pub use hub::PeerHub;
pub use link::{IcePhase, LinkEvent, LinkEventSender, MediaStreamHandle, NegotiationPhase, PeerLink, PeerLinkFactory};
pub use webrtc_link::WebRtcLinkFactory;
