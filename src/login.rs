//! Account credentials and the durable session token.
//!
//! The platform keeps the login in a `sessionid` cookie that stays valid for
//! months. Provisioning extracts it after an interactive login; sessions
//! inject it back so they can skip the password flow entirely.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::platform::{Cookie, CookieJar, PlatformClient};
use crate::session::SessionError;

/// Name of the durable session cookie.
pub const SESSION_COOKIE: &str = "sessionid";

/// Domain the session cookie is scoped to.
pub const COOKIE_DOMAIN: &str = "instagram.com";

/// Lifetime given to an injected session cookie (one year).
const COOKIE_MAX_AGE_SECS: u64 = 31_536_000;

/// Credential material stored by the bridge framework for each puppet.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoginData {
    /// A previously extracted durable session token.
    SessionToken {
        /// Value of the `sessionid` cookie.
        #[serde(rename = "sessionid")]
        session_id: String,
    },
    /// Interactive username/password login.
    Password {
        /// Account handle.
        username: String,
        /// Account password.
        password: String,
    },
}

impl LoginData {
    /// Whether the credential fields are filled in.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::SessionToken { session_id } => !session_id.trim().is_empty(),
            Self::Password { username, password } => !username.is_empty() && !password.is_empty(),
        }
    }
}

impl std::fmt::Debug for LoginData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionToken { .. } => f
                .debug_struct("SessionToken")
                .field("session_id", &"__REDACTED__")
                .finish(),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"__REDACTED__")
                .finish(),
        }
    }
}

/// Read the durable session token out of the client's cookie jar.
///
/// # Errors
///
/// Returns [`SessionError::InvalidSessionToken`] when the jar holds no
/// non-empty `sessionid` cookie, or [`SessionError::Remote`] when the jar
/// cannot be read.
pub async fn extract_durable_token(client: &dyn PlatformClient) -> Result<String, SessionError> {
    let jar = client.serialize_cookie_jar().await?;
    jar.cookies
        .into_iter()
        .find(|c| c.key == SESSION_COOKIE)
        .map(|c| c.value)
        .filter(|v| !v.is_empty())
        .ok_or(SessionError::InvalidSessionToken)
}

/// Install a durable session token as the client's only cookie.
///
/// # Errors
///
/// Returns [`SessionError::Remote`] when the client rejects the jar.
pub async fn inject_durable_token(
    client: &dyn PlatformClient,
    token: &str,
) -> Result<(), SessionError> {
    client
        .deserialize_cookie_jar(&session_cookie_jar(token))
        .await?;
    Ok(())
}

/// Build a jar holding just the session cookie.
pub fn session_cookie_jar(token: &str) -> CookieJar {
    CookieJar {
        store_type: "MemoryCookieStore".to_owned(),
        reject_public_suffixes: true,
        cookies: vec![Cookie {
            key: SESSION_COOKIE.to_owned(),
            value: token.to_owned(),
            domain: Some(COOKIE_DOMAIN.to_owned()),
            path: Some("/".to_owned()),
            secure: true,
            http_only: true,
            host_only: false,
            max_age: Some(COOKIE_MAX_AGE_SECS),
            creation: Some(Utc::now()),
        }],
    }
}
