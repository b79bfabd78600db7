//! Hook routes the bridge framework calls.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{bot_header, parse_credentials, BridgeAdapter, BridgeError, RemoteRoom};
use crate::http::{error_response, require_bearer, M_BAD_JSON, M_FORBIDDEN, M_NOT_FOUND, M_UNKNOWN};
use crate::login::LoginData;
use crate::session::SessionError;
use crate::PuppetId;

/// Shared state of the hook router.
pub struct HookState {
    /// Puppet registry.
    pub adapter: Arc<BridgeAdapter>,
    /// Bearer token the framework presents.
    pub token: String,
}

/// Build the hook router.
pub fn router(state: Arc<HookState>) -> Router {
    Router::new()
        .route("/puppets/:puppet_id", post(new_puppet).delete(delete_puppet))
        .route("/puppets/:puppet_id/users/:user_id", get(create_user))
        .route("/rooms/message", post(room_message))
        .route("/rooms/image", post(room_image))
        .route("/rooms/file", post(room_file))
        .route("/credentials", post(credentials))
        .route("/bot-header", get(header))
        .with_state(state)
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::UnknownPuppet(_) => StatusCode::NOT_FOUND,
            Self::Session(SessionError::NotConnected) => StatusCode::CONFLICT,
            Self::Session(SessionError::Image(_)) => StatusCode::BAD_REQUEST,
            Self::Session(_) | Self::Host(_) => StatusCode::BAD_GATEWAY,
        };
        let errcode = if status == StatusCode::NOT_FOUND {
            M_NOT_FOUND
        } else {
            M_UNKNOWN
        };
        error_response(status, errcode, self.to_string())
    }
}

#[derive(Deserialize)]
struct MessageBody {
    room: RemoteRoom,
    event_id: String,
    body: String,
}

#[derive(Deserialize)]
struct ImageBody {
    room: RemoteRoom,
    event_id: String,
    url: String,
}

#[derive(Deserialize)]
struct FileBody {
    room: RemoteRoom,
    event_id: String,
    name: String,
    url: String,
}

#[derive(Deserialize)]
struct CredentialsBody {
    text: String,
}

fn bad_json(e: &JsonRejection) -> Response {
    error_response(StatusCode::BAD_REQUEST, M_BAD_JSON, e.body_text())
}

async fn new_puppet(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    Path(puppet_id): Path<PuppetId>,
    body: Result<Json<LoginData>, JsonRejection>,
) -> Response {
    if let Err(resp) = require_bearer(&headers, &state.token) {
        return resp;
    }
    let Json(data) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(&e),
    };
    match state.adapter.new_puppet(puppet_id, data).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(puppet_id, error = %e, "puppet start failed");
            error_response(StatusCode::FORBIDDEN, M_FORBIDDEN, e.to_string())
        }
    }
}

async fn delete_puppet(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    Path(puppet_id): Path<PuppetId>,
) -> Response {
    if let Err(resp) = require_bearer(&headers, &state.token) {
        return resp;
    }
    state.adapter.delete_puppet(puppet_id);
    StatusCode::NO_CONTENT.into_response()
}

async fn create_user(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    Path((puppet_id, user_id)): Path<(PuppetId, String)>,
) -> Response {
    if let Err(resp) = require_bearer(&headers, &state.token) {
        return resp;
    }
    match state.adapter.create_user(puppet_id, &user_id) {
        Some(user) => Json(user).into_response(),
        None => error_response(StatusCode::NOT_FOUND, M_NOT_FOUND, "Unknown user"),
    }
}

async fn room_message(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    body: Result<Json<MessageBody>, JsonRejection>,
) -> Response {
    if let Err(resp) = require_bearer(&headers, &state.token) {
        return resp;
    }
    let Json(msg) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(&e),
    };
    match state
        .adapter
        .handle_bridge_message(&msg.room, &msg.event_id, &msg.body)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn room_image(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    body: Result<Json<ImageBody>, JsonRejection>,
) -> Response {
    if let Err(resp) = require_bearer(&headers, &state.token) {
        return resp;
    }
    let Json(img) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(&e),
    };
    match state
        .adapter
        .handle_bridge_image(&img.room, &img.event_id, &img.url)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn room_file(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    body: Result<Json<FileBody>, JsonRejection>,
) -> Response {
    if let Err(resp) = require_bearer(&headers, &state.token) {
        return resp;
    }
    let Json(file) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(&e),
    };
    match state
        .adapter
        .handle_bridge_file(&file.room, &file.event_id, &file.name, &file.url)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn credentials(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Response {
    if let Err(resp) = require_bearer(&headers, &state.token) {
        return resp;
    }
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(&e),
    };
    match parse_credentials(&req.text) {
        Ok(data) => Json(json!({ "success": true, "data": data })).into_response(),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })).into_response(),
    }
}

async fn header() -> Json<serde_json::Value> {
    Json(json!({ "header": bot_header() }))
}
