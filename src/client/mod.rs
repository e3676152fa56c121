//! Candidate-side client: collaborator HTTP calls, the signaling socket and
//! the orchestration of a whole exam session.

pub mod api_client;
pub mod exam_session;
pub mod signaling_client;

pub use api_client::{ApiClient, AssessmentMetadata, RoomLifecycle};
pub use exam_session::{CandidateSession, SessionEnd, SessionInputs, SessionPhase, SessionServices};
pub use signaling_client::SignalingClient;
