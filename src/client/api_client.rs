//! HTTP client for the collaborators the proctoring core depends on:
//! warning persistence, assessment metadata and the room directory.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::api::routes::{CreateRoomRequest, RoomView};
use crate::config::ApiConfig;
use crate::directory::{CandidateMembership, CandidatePatch};
use crate::error::{ProctorError, Result};
use crate::session::{TerminationRecord, WarningRecorder};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait AssessmentMetadata: Send + Sync {
    async fn get_duration(&self, assessment_id: &str) -> Result<u32>;

    async fn get_instructions(&self, assessment_id: &str) -> Result<String>;
}

/// Thin room CRUD exposed by the relay's HTTP routes.
#[async_trait]
pub trait RoomLifecycle: Send + Sync {
    async fn create_or_join_room(&self, assessment_id: &str, candidate_id: &str) -> Result<RoomView>;

    async fn patch_candidate_status(
        &self,
        room_id: &str,
        candidate_id: &str,
        patch: &CandidatePatch,
    ) -> Result<CandidateMembership>;
}

#[derive(Deserialize)]
struct DurationBody {
    duration: u32,
}

#[derive(Deserialize)]
struct InstructionsBody {
    #[serde(default)]
    instructions: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        Self::new(config.base_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProctorError::Collaborator(format!("{}: {}", status, body)));
        }
        Ok(response.json::<T>().await?)
    }

    pub async fn get_room(&self, room_id: &str) -> Result<RoomView> {
        let response = self.http.get(self.url(&format!("rooms/{}", room_id))).send().await?;
        Self::read(response).await
    }
}

#[async_trait]
impl RoomLifecycle for ApiClient {
    async fn create_or_join_room(&self, assessment_id: &str, candidate_id: &str) -> Result<RoomView> {
        let request = CreateRoomRequest {
            assessment_id: assessment_id.to_string(),
            candidate_id: candidate_id.to_string(),
        };
        let response = self.http.post(self.url("rooms")).json(&request).send().await?;
        Self::read(response).await
    }

    async fn patch_candidate_status(
        &self,
        room_id: &str,
        candidate_id: &str,
        patch: &CandidatePatch,
    ) -> Result<CandidateMembership> {
        let url = self.url(&format!("rooms/{}/candidates/{}", room_id, candidate_id));
        let response = self.http.patch(url).json(patch).send().await?;
        Self::read(response).await
    }
}

#[async_trait]
impl WarningRecorder for ApiClient {
    async fn record_warning(&self, record: &TerminationRecord) -> Result<()> {
        let response = self
            .http
            .post(self.url("candidates/proctor-warnings"))
            .json(record)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProctorError::Collaborator(format!("warning rejected with {}", status)));
        }
        tracing::debug!(candidate_id = %record.candidate_id, "Termination recorded");
        Ok(())
    }
}

#[async_trait]
impl AssessmentMetadata for ApiClient {
    async fn get_duration(&self, assessment_id: &str) -> Result<u32> {
        let url = self.url(&format!("assessment/{}/duration", assessment_id));
        let body: DurationBody = Self::read(self.http.get(url).send().await?).await?;
        Ok(body.duration)
    }

    async fn get_instructions(&self, assessment_id: &str) -> Result<String> {
        let url = self.url(&format!("assessment/{}/instructions", assessment_id));
        let body: InstructionsBody = Self::read(self.http.get(url).send().await?).await?;
        Ok(body.instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::room_routes;
    use crate::directory::{AttemptStatus, MembershipStatus, RoomDirectory};
    use crate::session::TerminationReason;
    use std::sync::{Arc, Mutex};
    use warp::Filter;

    fn spawn<F>(filter: F) -> String
    where
        F: Filter<Error = warp::Rejection> + Clone + Send + Sync + 'static,
        F::Extract: warp::Reply,
    {
        let (addr, server) = warp::serve(filter).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{}/api/v1", addr)
    }

    #[tokio::test]
    async fn test_record_warning_posts_record() {
        let received = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        let sink = received.clone();
        let filter = warp::path!("api" / "v1" / "candidates" / "proctor-warnings")
            .and(warp::post())
            .and(warp::body::json())
            .map(move |body: serde_json::Value| {
                sink.lock().unwrap().push(body);
                warp::reply::json(&serde_json::json!({ "ok": true }))
            });
        let client = ApiClient::new(spawn(filter)).unwrap();

        let record = TerminationRecord {
            candidate_id: "cand-1".to_string(),
            assessment_id: "asmt-1".to_string(),
            warning_type: TerminationReason::NoFace,
            message: "No face detected in the frame".to_string(),
            timestamp: 1_700_000_000_000,
            warning_count: 5,
            attempt_status: AttemptStatus::SessionOut,
        };
        client.record_warning(&record).await.unwrap();

        let bodies = received.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["warningType"], "NO_FACE");
        assert_eq!(bodies[0]["attemptStatus"], "SESSION_OUT");
        assert_eq!(bodies[0]["warningCount"], 5);
    }

    #[tokio::test]
    async fn test_rejected_warning_is_a_collaborator_error() {
        let filter = warp::path!("api" / "v1" / "candidates" / "proctor-warnings").map(|| {
            warp::reply::with_status("down", warp::http::StatusCode::SERVICE_UNAVAILABLE)
        });
        let client = ApiClient::new(spawn(filter)).unwrap();

        let record = TerminationRecord {
            candidate_id: "cand-1".to_string(),
            assessment_id: "asmt-1".to_string(),
            warning_type: TerminationReason::TabSwitch,
            message: "tab".to_string(),
            timestamp: 0,
            warning_count: 3,
            attempt_status: AttemptStatus::SessionOut,
        };
        let err = client.record_warning(&record).await.unwrap_err();
        assert!(matches!(err, ProctorError::Collaborator(_)));
    }

    #[tokio::test]
    async fn test_assessment_metadata() {
        let duration = warp::path!("api" / "v1" / "assessment" / String / "duration")
            .map(|_id: String| warp::reply::json(&serde_json::json!({ "duration": 45 })));
        let instructions = warp::path!("api" / "v1" / "assessment" / String / "instructions")
            .map(|_id: String| warp::reply::json(&serde_json::json!({ "instructions": "Keep your camera on" })));
        let client = ApiClient::new(spawn(duration.or(instructions))).unwrap();

        assert_eq!(client.get_duration("asmt-1").await.unwrap(), 45);
        assert_eq!(client.get_instructions("asmt-1").await.unwrap(), "Keep your camera on");
    }

    #[tokio::test]
    async fn test_room_lifecycle_against_directory_routes() {
        let directory = RoomDirectory::new();
        let client = ApiClient::new(spawn(room_routes(directory.clone()))).unwrap();

        let view = client.create_or_join_room("asmt-1", "cand-1").await.unwrap();
        assert!(!view.expired);
        let room_id = view.room.room_id.clone();

        let patch = CandidatePatch {
            status: Some(MembershipStatus::Active),
            ..CandidatePatch::default()
        };
        let membership = client.patch_candidate_status(&room_id, "cand-1", &patch).await.unwrap();
        assert_eq!(membership.attempt_status, AttemptStatus::InProgress);

        let fetched = client.get_room(&room_id).await.unwrap();
        assert_eq!(fetched.room.candidates.len(), 1);

        let missing = client.get_room("nope").await.unwrap_err();
        assert!(matches!(missing, ProctorError::Collaborator(_)));
    }
}
