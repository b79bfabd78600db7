//! Configuration loading and validation.
//!
//! Loads `./config.toml` (or `$IGPUPPET_CONFIG_PATH`). Environment variables
//! override file values; file values override defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::bridge::DEFAULT_EVENT_BUFFER;
use crate::platform::sidecar::DEFAULT_SIDECAR_PORT;

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "IGPUPPET_CONFIG_PATH";

// ── Top-level config ────────────────────────────────────────────

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Account-linking endpoints.
    pub provisioning: ProvisioningConfig,
    /// Platform sidecar.
    pub platform: PlatformConfig,
    /// Bridge framework callbacks and hooks.
    pub bridge: BridgeSection,
    /// Log output.
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// `path` wins over `$IGPUPPET_CONFIG_PATH`. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path_with(env),
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(env);
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV)
            .filter(|p| !p.is_empty())
            .map_or_else(|| PathBuf::from("config.toml"), PathBuf::from)
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests need not touch the process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("IGPUPPET_BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        if let Some(v) = env("IGPUPPET_PORT") {
            match v.parse() {
                Ok(n) => self.server.port = n,
                Err(_) => tracing::warn!(
                    var = "IGPUPPET_PORT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("IGPUPPET_PROVISIONING_SECRET") {
            self.provisioning.shared_secret = v;
        }
        if let Some(v) = env("IGPUPPET_SIDECAR_URL") {
            self.platform.sidecar_url = v;
        }
        if let Some(v) = env("IGPUPPET_BRIDGE_URL") {
            self.bridge.callback_url = v;
        }
        if let Some(v) = env("IGPUPPET_BRIDGE_TOKEN") {
            self.bridge.token = v;
        }
        if let Some(v) = env("IGPUPPET_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or mistyped fields.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        url::Url::parse(&self.platform.sidecar_url)
            .with_context(|| format!("platform.sidecar_url is not a URL: {}", self.platform.sidecar_url))?;
        if self.platform.request_timeout_seconds == 0 {
            anyhow::bail!("platform.request_timeout_seconds must be positive");
        }
        if self.bridge.callback_url.is_empty() {
            anyhow::bail!("bridge.callback_url is required");
        }
        url::Url::parse(&self.bridge.callback_url)
            .with_context(|| format!("bridge.callback_url is not a URL: {}", self.bridge.callback_url))?;
        if self.bridge.token.is_empty() {
            anyhow::bail!("bridge.token is required");
        }
        if !self.bridge.hooks_prefix.starts_with('/') {
            anyhow::bail!("bridge.hooks_prefix must start with '/'");
        }
        if self.bridge.event_buffer == 0 {
            anyhow::bail!("bridge.event_buffer must be positive");
        }
        if self.provisioning.enabled {
            if !self.provisioning.prefix.starts_with('/') {
                anyhow::bail!("provisioning.prefix must start with '/'");
            }
            if self.provisioning.shared_secret.is_empty() {
                anyhow::bail!("provisioning.shared_secret is required when provisioning is enabled");
            }
        }
        Ok(())
    }

    /// Socket address the HTTP server binds.
    ///
    /// # Errors
    ///
    /// Returns an error if `server.bind_address` is not an IP address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .server
            .bind_address
            .parse()
            .with_context(|| format!("server.bind_address is not an IP: {}", self.server.bind_address))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }
}

// ── Sections ────────────────────────────────────────────────────

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_address: String,
    /// Port to bind.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8432,
        }
    }
}

/// Account-linking endpoint settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Serve the provisioning endpoints.
    pub enabled: bool,
    /// Route prefix.
    pub prefix: String,
    /// Bearer secret callers must present.
    pub shared_secret: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "/_matrix/provision/v1".to_string(),
            shared_secret: String::new(),
        }
    }
}

impl std::fmt::Debug for ProvisioningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningConfig")
            .field("enabled", &self.enabled)
            .field("prefix", &self.prefix)
            .field("shared_secret", &"__REDACTED__")
            .finish()
    }
}

/// Platform sidecar settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Base URL of the sidecar.
    pub sidecar_url: String,
    /// Per-request timeout.
    pub request_timeout_seconds: u64,
}

impl PlatformConfig {
    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            sidecar_url: format!("http://127.0.0.1:{DEFAULT_SIDECAR_PORT}"),
            request_timeout_seconds: 30,
        }
    }
}

/// Bridge framework settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    /// Base URL of the framework's callback API.
    pub callback_url: String,
    /// Prefix of the hook routes this process serves.
    pub hooks_prefix: String,
    /// Bearer token shared with the framework, both directions.
    pub token: String,
    /// Per-session event channel capacity.
    pub event_buffer: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            callback_url: String::new(),
            hooks_prefix: "/_bridge/v1".to_string(),
            token: String::new(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl std::fmt::Debug for BridgeSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSection")
            .field("callback_url", &self.callback_url)
            .field("hooks_prefix", &self.hooks_prefix)
            .field("token", &"__REDACTED__")
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs; console only when unset.
    pub logs_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            logs_dir: None,
        }
    }
}
