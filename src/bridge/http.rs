//! [`BridgeHost`] over HTTP callbacks to the bridge framework.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{BridgeHost, RemoteUserInfo, SendParams};
use crate::login::LoginData;
use crate::provisioning::PuppetRegistrar;
use crate::PuppetId;

/// Request timeout for framework callbacks.
const CALLBACK_TIMEOUT_SECS: u64 = 30;

/// Posts bridge events to the framework's callback API.
#[derive(Debug, Clone)]
pub struct HttpBridgeHost {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct Registered {
    puppet_id: PuppetId,
}

#[derive(Serialize)]
struct Registration<'a> {
    user_id: &'a str,
    data: &'a LoginData,
}

impl HttpBridgeHost {
    /// Create a host calling back to `base_url` with bearer `token`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CALLBACK_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }

    /// Callback base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> anyhow::Result<reqwest::Response> {
        debug!(path, "bridge callback");
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("bridge callback {path} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("bridge callback {path} returned {status}: {text}");
        }
        Ok(resp)
    }
}

#[async_trait]
impl BridgeHost for HttpBridgeHost {
    async fn send_message(&self, params: &SendParams, body: &str) -> anyhow::Result<()> {
        self.post("messages", json!({ "params": params, "body": body }))
            .await
            .map(drop)
    }

    async fn send_file(&self, params: &SendParams, url: &str) -> anyhow::Result<()> {
        self.post("files", json!({ "params": params, "url": url }))
            .await
            .map(drop)
    }

    async fn update_user(&self, user: &RemoteUserInfo) -> anyhow::Result<()> {
        self.post("users", serde_json::to_value(user)?)
            .await
            .map(drop)
    }

    async fn send_status(&self, puppet_id: PuppetId, text: &str) -> anyhow::Result<()> {
        self.post("status", json!({ "puppet_id": puppet_id, "text": text }))
            .await
            .map(drop)
    }

    async fn store_event(
        &self,
        puppet_id: PuppetId,
        bridge_event_id: &str,
        remote_event_id: &str,
    ) -> anyhow::Result<()> {
        self.post(
            "events",
            json!({
                "puppet_id": puppet_id,
                "bridge_event_id": bridge_event_id,
                "remote_event_id": remote_event_id,
            }),
        )
        .await
        .map(drop)
    }

    async fn download_media(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to download {url}"))?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PuppetRegistrar for HttpBridgeHost {
    async fn register_puppet(&self, user_id: &str, data: LoginData) -> anyhow::Result<PuppetId> {
        let body = serde_json::to_value(Registration {
            user_id,
            data: &data,
        })?;
        let registered: Registered = self
            .post("puppets", body)
            .await?
            .json()
            .await
            .context("puppet registration response was not valid JSON")?;
        Ok(registered.puppet_id)
    }
}
