//! Shared pieces of the HTTP surfaces: Matrix-style error bodies and bearer
//! token checks.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Request body was not valid JSON or lacked required fields.
pub const M_BAD_JSON: &str = "M_BAD_JSON";
/// Missing or wrong access token.
pub const M_UNKNOWN_TOKEN: &str = "M_UNKNOWN_TOKEN";
/// Request understood but refused.
pub const M_FORBIDDEN: &str = "M_FORBIDDEN";
/// Unclassified failure.
pub const M_UNKNOWN: &str = "M_UNKNOWN";
/// Referenced entity does not exist.
pub const M_NOT_FOUND: &str = "M_NOT_FOUND";

/// Error payload in the Matrix client-server shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code, e.g. `M_FORBIDDEN`.
    pub errcode: String,
    /// Human-readable message.
    pub error: String,
}

/// Build a JSON error response.
pub fn error_response(status: StatusCode, errcode: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            errcode: errcode.to_owned(),
            error: message.into(),
        }),
    )
        .into_response()
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Check the bearer token against `expected`.
///
/// # Errors
///
/// Returns a ready 401 response with `M_UNKNOWN_TOKEN`.
pub fn require_bearer(headers: &HeaderMap, expected: &str) -> Result<(), Response> {
    match bearer_token(headers) {
        Some(token) if !expected.is_empty() && constant_time_eq(token, expected) => Ok(()),
        _ => Err(error_response(
            StatusCode::UNAUTHORIZED,
            M_UNKNOWN_TOKEN,
            "Invalid or missing access token",
        )),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}
