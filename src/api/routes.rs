use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

use super::websocket;
use crate::config::Config;
use crate::directory::{CandidatePatch, Room, RoomDirectory};
use crate::error::ProctorError;
use crate::protocol::now_millis;
use crate::relay::RelayServer;

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub assessment_id: String,
    pub candidate_id: String,
}

/// Room as reported over HTTP, with expiry evaluated at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    #[serde(flatten)]
    pub room: Room,
    pub expired: bool,
}

impl RoomView {
    fn at(room: Room, now: u64) -> Self {
        let expired = room.is_expired(now);
        Self { room, expired }
    }
}

/// Everything the relay binary serves.
pub fn routes(
    config: Arc<Config>,
    server: Arc<RelayServer>,
    directory: Arc<RoomDirectory>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    signaling_route(server)
        .or(health_check())
        .or(config_endpoint(config))
        .or(room_routes(directory))
}

pub fn signaling_route(
    server: Arc<RelayServer>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path("signaling")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_shared(server))
        .map(|ws: warp::ws::Ws, server: Arc<RelayServer>| {
            ws.on_upgrade(move |websocket| websocket::handle_signaling_websocket(websocket, server))
        })
}

pub fn health_check() -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "Proctor Relay",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

/// Public client configuration. TURN credentials are handed out here the
/// same way browsers receive them today.
pub fn config_endpoint(
    config: Arc<Config>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path("config")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || {
            let turn: Vec<_> = config
                .webrtc
                .turn_servers
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "urls": t.urls,
                        "username": t.username,
                        "credential": t.credential,
                    })
                })
                .collect();

            warp::reply::json(&serde_json::json!({
                "signalingUrl": config.api.signaling_url,
                "apiBaseUrl": config.api.base_url,
                "stunServers": config.webrtc.stun_servers,
                "turnServers": turn,
                "tabSwitchLimit": config.integrity.tab_switch_limit,
                "faceWarningThreshold": config.integrity.face_warning_threshold,
            }))
        })
}

pub fn room_routes(
    directory: Arc<RoomDirectory>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let create = warp::path!("api" / "v1" / "rooms")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_shared(directory.clone()))
        .and_then(create_room);

    let get = warp::path!("api" / "v1" / "rooms" / String)
        .and(warp::get())
        .and(with_shared(directory.clone()))
        .and_then(get_room);

    let patch = warp::path!("api" / "v1" / "rooms" / String / "candidates" / String)
        .and(warp::patch())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_shared(directory))
        .and_then(patch_candidate);

    create.or(get).or(patch)
}

async fn create_room(
    request: CreateRoomRequest,
    directory: Arc<RoomDirectory>,
) -> Result<Response, Infallible> {
    let now = now_millis();
    match directory
        .create_or_join(&request.assessment_id, &request.candidate_id, now)
        .await
    {
        Ok(room) => Ok(json_response(&RoomView::at(room, now), StatusCode::OK)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn get_room(room_id: String, directory: Arc<RoomDirectory>) -> Result<Response, Infallible> {
    match directory.get(&room_id).await {
        Some(room) => Ok(json_response(&RoomView::at(room, now_millis()), StatusCode::OK)),
        None => Ok(error_response(&ProctorError::RoomNotFound(room_id))),
    }
}

async fn patch_candidate(
    room_id: String,
    candidate_id: String,
    patch: CandidatePatch,
    directory: Arc<RoomDirectory>,
) -> Result<Response, Infallible> {
    match directory
        .patch_candidate_status(&room_id, &candidate_id, patch, now_millis())
        .await
    {
        Ok(membership) => Ok(json_response(&membership, StatusCode::OK)),
        Err(e) => Ok(error_response(&e)),
    }
}

fn json_response<T: Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn error_response(err: &ProctorError) -> Response {
    let status = match err {
        ProctorError::RoomNotFound(_) | ProctorError::CandidateNotInRoom { .. } => StatusCode::NOT_FOUND,
        ProctorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "Room directory request failed");
    }
    json_response(&serde_json::json!({ "error": err.to_string() }), status)
}

fn with_shared<T: Send + Sync + 'static>(
    shared: Arc<T>,
) -> impl Filter<Extract = (Arc<T>,), Error = Infallible> + Clone {
    warp::any().map(move || shared.clone())
}
