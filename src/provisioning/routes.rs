//! Provisioning HTTP endpoints.
//!
//! Mounted under the configured provisioning prefix. Every request carries
//! the shared secret as a bearer token and names the Matrix user in the
//! `user_id` query parameter.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::{LoginStep, Provisioner, StepOutcome};
use crate::http::{error_response, require_bearer, M_BAD_JSON};

/// Shared state of the provisioning router.
pub struct ProvisioningState {
    /// Login state machine.
    pub provisioner: Arc<Provisioner>,
    /// Bearer secret callers must present.
    pub shared_secret: String,
}

/// Build the provisioning router.
pub fn router(state: Arc<ProvisioningState>) -> Router {
    Router::new()
        .route("/login/cookie", post(login_cookie))
        .route("/login/password", post(login_password))
        .route("/login/checkpoint", post(login_checkpoint))
        .route("/login/2fa", post(login_two_factor))
        .with_state(state)
}

#[derive(Deserialize)]
struct Caller {
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct CookieBody {
    session_id: String,
}

#[derive(Deserialize)]
struct PasswordBody {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct CodeBody {
    code: String,
}

async fn login_cookie(
    State(state): State<Arc<ProvisioningState>>,
    headers: HeaderMap,
    Query(caller): Query<Caller>,
    body: Result<Json<CookieBody>, JsonRejection>,
) -> Response {
    let (user_id, Json(body)) = match authorize(&state, &headers, caller, body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    submit(&state, &user_id, LoginStep::Cookie {
        session_id: body.session_id,
    })
    .await
}

async fn login_password(
    State(state): State<Arc<ProvisioningState>>,
    headers: HeaderMap,
    Query(caller): Query<Caller>,
    body: Result<Json<PasswordBody>, JsonRejection>,
) -> Response {
    let (user_id, Json(body)) = match authorize(&state, &headers, caller, body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    submit(&state, &user_id, LoginStep::Password {
        username: body.username,
        password: body.password,
    })
    .await
}

async fn login_checkpoint(
    State(state): State<Arc<ProvisioningState>>,
    headers: HeaderMap,
    Query(caller): Query<Caller>,
    body: Result<Json<CodeBody>, JsonRejection>,
) -> Response {
    let (user_id, Json(body)) = match authorize(&state, &headers, caller, body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    submit(&state, &user_id, LoginStep::Checkpoint { code: body.code }).await
}

async fn login_two_factor(
    State(state): State<Arc<ProvisioningState>>,
    headers: HeaderMap,
    Query(caller): Query<Caller>,
    body: Result<Json<CodeBody>, JsonRejection>,
) -> Response {
    let (user_id, Json(body)) = match authorize(&state, &headers, caller, body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    submit(&state, &user_id, LoginStep::TwoFactor { code: body.code }).await
}

/// Check the secret, the caller id and the body, in that order.
fn authorize<T>(
    state: &ProvisioningState,
    headers: &HeaderMap,
    caller: Caller,
    body: Result<Json<T>, JsonRejection>,
) -> Result<(String, Json<T>), Response> {
    require_bearer(headers, &state.shared_secret)?;
    let user_id = caller
        .user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, M_BAD_JSON, "Missing user_id")
        })?;
    let body = body.map_err(|e| error_response(StatusCode::BAD_REQUEST, M_BAD_JSON, e.body_text()))?;
    Ok((user_id, body))
}

async fn submit(state: &ProvisioningState, user_id: &str, step: LoginStep) -> Response {
    match state.provisioner.submit(user_id, step).await {
        Ok(StepOutcome::Completed { puppet_id }) => {
            (StatusCode::CREATED, Json(json!({ "puppet_id": puppet_id }))).into_response()
        }
        Ok(StepOutcome::Pending(next)) => {
            (StatusCode::ACCEPTED, Json(json!({ "next_step": next.path() }))).into_response()
        }
        Err(e) => e.into_response(),
    }
}
