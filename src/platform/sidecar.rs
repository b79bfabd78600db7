//! HTTP client for the platform sidecar.
//!
//! The sidecar is a small Node.js service wrapping the Instagram private-API
//! library. Each [`SidecarClient`] owns one client slot on the sidecar,
//! addressed by a random id under `/clients/{id}/...`, so device state and
//! cookies stay separate per account and per login attempt.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    decode_inbox, CookieJar, InboxThread, PlatformClient, PlatformConnector, PlatformError,
    PlatformUser, TwoFactorLogin,
};

/// Default port the sidecar listens on.
pub const DEFAULT_SIDECAR_PORT: u16 = 3002;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Response envelope from the sidecar HTTP API.
#[derive(Deserialize)]
struct SidecarResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    /// Machine-readable failure class, see [`classify_failure`].
    kind: Option<String>,
}

#[derive(Deserialize)]
struct BroadcastResult {
    item_id: Option<String>,
}

/// Creates [`SidecarClient`]s that share one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct SidecarConnector {
    http: reqwest::Client,
    base_url: String,
}

impl SidecarConnector {
    /// Create a connector for the sidecar at `base_url`.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Returns the base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl PlatformConnector for SidecarConnector {
    fn new_client(&self) -> Arc<dyn PlatformClient> {
        Arc::new(SidecarClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            client_id: Uuid::new_v4(),
        })
    }
}

/// One platform client slot on the sidecar.
pub struct SidecarClient {
    http: reqwest::Client,
    base_url: String,
    client_id: Uuid,
}

impl SidecarClient {
    /// Sidecar-side identifier of this client.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/clients/{}/{path}", self.base_url, self.client_id)
    }

    /// Issue a request and unwrap the response envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>, PlatformError> {
        let mut request = self.http.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await?;
        let status = resp.status();
        let envelope: SidecarResponse<T> = resp.json().await?;

        if envelope.success && status.is_success() {
            return Ok(envelope.data);
        }

        let message = envelope
            .error
            .unwrap_or_else(|| format!("sidecar returned {status}"));
        debug!(path, %status, kind = ?envelope.kind, "sidecar call failed");
        Err(classify_failure(envelope.kind.as_deref(), message))
    }

    async fn call_unit(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), PlatformError> {
        self.call::<serde_json::Value>(method, path, body)
            .await
            .map(|_| ())
    }

    async fn call_user(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<PlatformUser, PlatformError> {
        self.call(method, path, body)
            .await?
            .ok_or_else(|| PlatformError::Api(format!("{path}: response carried no user")))
    }

    async fn broadcast(
        &self,
        thread_id: &str,
        kind: &str,
        body: serde_json::Value,
    ) -> Result<Option<String>, PlatformError> {
        let path = format!("threads/{thread_id}/{kind}");
        let result: Option<BroadcastResult> = self.call(Method::POST, &path, Some(body)).await?;
        Ok(result.and_then(|r| r.item_id))
    }
}

/// Map the sidecar's failure `kind` onto [`PlatformError`].
fn classify_failure(kind: Option<&str>, message: String) -> PlatformError {
    match kind {
        Some("checkpoint_required") => PlatformError::CheckpointRequired,
        Some("two_factor_required") => PlatformError::TwoFactorRequired {
            two_factor_identifier: None,
        },
        Some(k) if k.starts_with("two_factor_required:") => PlatformError::TwoFactorRequired {
            two_factor_identifier: k
                .split_once(':')
                .map(|(_, id)| id.to_owned())
                .filter(|id| !id.is_empty()),
        },
        Some("login_required") => PlatformError::LoginRequired,
        Some("bad_credentials") => PlatformError::BadCredentials(message),
        _ => PlatformError::Api(message),
    }
}

#[async_trait::async_trait]
impl PlatformClient for SidecarClient {
    async fn generate_device(&self, seed: &str) -> Result<(), PlatformError> {
        self.call_unit(
            Method::POST,
            "device",
            Some(serde_json::json!({ "seed": seed })),
        )
        .await
    }

    async fn pre_login_flow(&self) -> Result<(), PlatformError> {
        self.call_unit(Method::POST, "pre-login", None).await
    }

    async fn login(&self, username: &str, password: &str) -> Result<PlatformUser, PlatformError> {
        self.call_user(
            Method::POST,
            "login",
            Some(serde_json::json!({ "username": username, "password": password })),
        )
        .await
    }

    async fn current_user(&self) -> Result<PlatformUser, PlatformError> {
        self.call_user(Method::GET, "current-user", None).await
    }

    async fn challenge_auto(&self, reset: bool) -> Result<(), PlatformError> {
        self.call_unit(
            Method::POST,
            "challenge/auto",
            Some(serde_json::json!({ "reset": reset })),
        )
        .await
    }

    async fn send_security_code(&self, code: &str) -> Result<(), PlatformError> {
        self.call_unit(
            Method::POST,
            "challenge/code",
            Some(serde_json::json!({ "code": code })),
        )
        .await
    }

    async fn two_factor_login(
        &self,
        request: &TwoFactorLogin,
    ) -> Result<PlatformUser, PlatformError> {
        let body = serde_json::to_value(request)
            .map_err(|e| PlatformError::Api(format!("failed to encode two-factor request: {e}")))?;
        self.call_user(Method::POST, "two-factor", Some(body)).await
    }

    async fn inbox(&self) -> Result<Vec<InboxThread>, PlatformError> {
        let raw = self
            .call::<Vec<serde_json::Value>>(Method::GET, "inbox", None)
            .await?
            .unwrap_or_default();
        Ok(decode_inbox(raw))
    }

    async fn broadcast_text(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<Option<String>, PlatformError> {
        self.broadcast(thread_id, "text", serde_json::json!({ "text": text }))
            .await
    }

    async fn broadcast_photo(
        &self,
        thread_id: &str,
        jpeg: &[u8],
    ) -> Result<Option<String>, PlatformError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);
        self.broadcast(thread_id, "photo", serde_json::json!({ "file": encoded }))
            .await
    }

    async fn broadcast_link(
        &self,
        thread_id: &str,
        text: &str,
        urls: &[String],
    ) -> Result<Option<String>, PlatformError> {
        self.broadcast(
            thread_id,
            "link",
            serde_json::json!({ "text": text, "urls": urls }),
        )
        .await
    }

    async fn serialize_cookie_jar(&self) -> Result<CookieJar, PlatformError> {
        self.call(Method::GET, "cookies", None)
            .await?
            .ok_or_else(|| PlatformError::Api("cookie jar missing from response".to_owned()))
    }

    async fn deserialize_cookie_jar(&self, jar: &CookieJar) -> Result<(), PlatformError> {
        let body = serde_json::to_value(jar)
            .map_err(|e| PlatformError::Api(format!("failed to encode cookie jar: {e}")))?;
        self.call_unit(Method::PUT, "cookies", Some(body)).await
    }
}
