//! Glue between the Matrix bridge framework and per-account sessions.
//!
//! The framework owns rooms, ghost users and the event-id store; it reaches
//! this crate through the hook routes in [`routes`] and is called back
//! through [`BridgeHost`]. [`BridgeAdapter`] keeps one [`SessionClient`] per
//! puppet and a forwarder task that relays that session's events.

pub mod http;
pub mod routes;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::login::LoginData;
use crate::platform::PlatformConnector;
use crate::session::{MessageOrigin, RemoteUser, SessionClient, SessionError, SessionEvent};
use crate::PuppetId;

/// Text shown at the top of the framework's bot messages.
pub const BOT_HEADER: &str = "Instagram Puppet Bridge";

/// Default capacity of each session's event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// A remote conversation as addressed by the framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRoom {
    /// Owning puppet.
    pub puppet_id: PuppetId,
    /// Remote thread id.
    pub room_id: String,
}

/// Addressing of an inbound message for the framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendParams {
    /// Target room.
    pub room: RemoteRoom,
    /// One-to-one conversation.
    pub is_direct: bool,
    /// Optional room name.
    pub room_name: Option<String>,
    /// Remote sender id.
    pub user_id: String,
    /// Remote message id, stored for deduplication.
    pub event_id: Option<String>,
}

impl SendParams {
    /// Address an item of `puppet_id`'s session.
    pub fn from_origin(puppet_id: PuppetId, origin: &MessageOrigin) -> Self {
        Self {
            room: RemoteRoom {
                puppet_id,
                room_id: origin.thread_id.clone(),
            },
            is_direct: origin.is_private,
            room_name: origin.thread_title.clone(),
            user_id: origin.user_id.clone(),
            event_id: Some(origin.event_id.clone()).filter(|id| !id.is_empty()),
        }
    }
}

/// Ghost-user profile handed to the framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUserInfo {
    /// Owning puppet.
    pub puppet_id: PuppetId,
    /// Remote user id.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Avatar URL.
    pub avatar_url: Option<String>,
}

impl RemoteUserInfo {
    /// Profile of `user` as seen by `puppet_id`.
    pub fn new(puppet_id: PuppetId, user: &RemoteUser) -> Self {
        Self {
            puppet_id,
            user_id: user.user_id.clone(),
            name: user.name.clone(),
            avatar_url: user.avatar_url.clone(),
        }
    }
}

/// Callbacks into the bridge framework.
#[async_trait]
pub trait BridgeHost: Send + Sync {
    /// Post a text message into the room described by `params`.
    async fn send_message(&self, params: &SendParams, body: &str) -> anyhow::Result<()>;

    /// Post a file by URL; the framework detects its type.
    async fn send_file(&self, params: &SendParams, url: &str) -> anyhow::Result<()>;

    /// Update a ghost user's profile.
    async fn update_user(&self, user: &RemoteUserInfo) -> anyhow::Result<()>;

    /// Send a status notice to the puppet's owner.
    async fn send_status(&self, puppet_id: PuppetId, text: &str) -> anyhow::Result<()>;

    /// Record that `bridge_event_id` was delivered as `remote_event_id`.
    async fn store_event(
        &self,
        puppet_id: PuppetId,
        bridge_event_id: &str,
        remote_event_id: &str,
    ) -> anyhow::Result<()>;

    /// Fetch media referenced by a Matrix event.
    async fn download_media(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// Errors from outbound deliveries.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No puppet with this id is running.
    #[error("unknown puppet {0}")]
    UnknownPuppet(PuppetId),

    /// The session refused or failed the send.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A framework callback failed.
    #[error("bridge host error: {0}")]
    Host(#[from] anyhow::Error),
}

/// Failure to read credentials typed by a user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialParseError {
    /// Fewer than two words were given.
    #[error("Please specify both username and password")]
    MissingField,
}

/// Parse `"<username> <password>"` or `"sessionid <token>"`.
///
/// # Errors
///
/// Returns [`CredentialParseError::MissingField`] when fewer than two words
/// are given.
pub fn parse_credentials(text: &str) -> Result<LoginData, CredentialParseError> {
    let mut words = text.split_whitespace();
    let (Some(first), Some(second)) = (words.next(), words.next()) else {
        return Err(CredentialParseError::MissingField);
    };
    if first.eq_ignore_ascii_case("sessionid") {
        Ok(LoginData::SessionToken {
            session_id: second.to_owned(),
        })
    } else {
        Ok(LoginData::Password {
            username: first.to_owned(),
            password: second.to_owned(),
        })
    }
}

/// Header text for the framework's bot messages.
pub fn bot_header() -> &'static str {
    BOT_HEADER
}

struct Puppet {
    client: SessionClient,
    data: LoginData,
    generation: u64,
    forwarder: JoinHandle<()>,
}

type PuppetMap = Arc<RwLock<HashMap<PuppetId, Puppet>>>;

/// Registry of running puppets.
pub struct BridgeAdapter {
    host: Arc<dyn BridgeHost>,
    connector: Arc<dyn PlatformConnector>,
    puppets: PuppetMap,
    generations: AtomicU64,
    event_buffer: usize,
}

impl BridgeAdapter {
    /// Create an adapter with no puppets.
    pub fn new(
        host: Arc<dyn BridgeHost>,
        connector: Arc<dyn PlatformConnector>,
        event_buffer: usize,
    ) -> Self {
        Self {
            host,
            connector,
            puppets: Arc::new(RwLock::new(HashMap::new())),
            generations: AtomicU64::new(0),
            event_buffer: event_buffer.max(1),
        }
    }

    /// Ids of running puppets, sorted.
    pub fn puppet_ids(&self) -> Vec<PuppetId> {
        let mut ids: Vec<PuppetId> = self
            .puppets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Login data a puppet was started with.
    pub fn puppet_data(&self, puppet_id: PuppetId) -> Option<LoginData> {
        self.puppets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&puppet_id)
            .map(|p| p.data.clone())
    }

    /// Session of a running puppet.
    pub fn session(&self, puppet_id: PuppetId) -> Option<SessionClient> {
        self.puppets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&puppet_id)
            .map(|p| p.client.clone())
    }

    /// Start (or restart) a puppet and connect its session.
    ///
    /// # Errors
    ///
    /// Returns the session's connect failure; the puppet is removed and its
    /// owner is notified.
    pub async fn new_puppet(&self, puppet_id: PuppetId, data: LoginData) -> Result<(), SessionError> {
        info!(puppet_id, "adding puppet");
        self.delete_puppet(puppet_id);

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let client = SessionClient::new(self.connector.new_client(), data.clone(), tx);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let forwarder = tokio::spawn(forward_events(
            Arc::clone(&self.host),
            Arc::clone(&self.puppets),
            puppet_id,
            generation,
            rx,
        ));

        self.puppets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                puppet_id,
                Puppet {
                    client: client.clone(),
                    data,
                    generation,
                    forwarder,
                },
            );

        if let Err(e) = client.connect().await {
            warn!(puppet_id, error = %e, "puppet failed to connect");
            remove_generation(&self.puppets, puppet_id, generation);
            let notice = format!("Failed to connect to Instagram: {e}");
            if let Err(host_err) = self.host.send_status(puppet_id, &notice).await {
                warn!(puppet_id, error = %host_err, "failed to post status");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop and forget a puppet. No-op when absent.
    pub fn delete_puppet(&self, puppet_id: PuppetId) {
        let removed = self
            .puppets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&puppet_id);
        if let Some(puppet) = removed {
            info!(puppet_id, "removing puppet");
            puppet.client.disconnect();
        }
    }

    /// Relay a Matrix text message.
    ///
    /// # Errors
    ///
    /// See [`BridgeError`].
    pub async fn handle_bridge_message(
        &self,
        room: &RemoteRoom,
        bridge_event_id: &str,
        body: &str,
    ) -> Result<(), BridgeError> {
        let client = self.client_for(room.puppet_id)?;
        debug!(puppet_id = room.puppet_id, room = %room.room_id, "relaying message");
        let remote_id = client.send_message(&room.room_id, body).await?;
        self.record(room, bridge_event_id, remote_id).await
    }

    /// Relay a Matrix image.
    ///
    /// # Errors
    ///
    /// See [`BridgeError`].
    pub async fn handle_bridge_image(
        &self,
        room: &RemoteRoom,
        bridge_event_id: &str,
        url: &str,
    ) -> Result<(), BridgeError> {
        let client = self.client_for(room.puppet_id)?;
        let bytes = self.host.download_media(url).await?;
        debug!(puppet_id = room.puppet_id, room = %room.room_id, size = bytes.len(), "relaying image");
        let remote_id = client.send_photo(&room.room_id, &bytes).await?;
        self.record(room, bridge_event_id, remote_id).await
    }

    /// Relay a non-image Matrix file as a titled link.
    ///
    /// # Errors
    ///
    /// See [`BridgeError`].
    pub async fn handle_bridge_file(
        &self,
        room: &RemoteRoom,
        bridge_event_id: &str,
        name: &str,
        url: &str,
    ) -> Result<(), BridgeError> {
        let client = self.client_for(room.puppet_id)?;
        let remote_id = client.send_link(&room.room_id, name, url).await?;
        self.record(room, bridge_event_id, remote_id).await
    }

    /// Profile of a user the puppet's session has seen.
    pub fn create_user(&self, puppet_id: PuppetId, user_id: &str) -> Option<RemoteUserInfo> {
        let client = self.session(puppet_id)?;
        client
            .get_user(user_id)
            .map(|user| RemoteUserInfo::new(puppet_id, &user))
    }

    /// Disconnect every puppet.
    pub fn shutdown(&self) {
        let drained: Vec<(PuppetId, Puppet)> = self
            .puppets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (puppet_id, puppet) in drained {
            debug!(puppet_id, "shutting down puppet");
            puppet.client.disconnect();
            puppet.forwarder.abort();
        }
    }

    fn client_for(&self, puppet_id: PuppetId) -> Result<SessionClient, BridgeError> {
        self.session(puppet_id)
            .ok_or(BridgeError::UnknownPuppet(puppet_id))
    }

    async fn record(
        &self,
        room: &RemoteRoom,
        bridge_event_id: &str,
        remote_id: Option<String>,
    ) -> Result<(), BridgeError> {
        if let Some(remote_id) = remote_id {
            self.host
                .store_event(room.puppet_id, bridge_event_id, &remote_id)
                .await?;
        }
        Ok(())
    }
}

/// Remove `puppet_id` only if it is still the instance started as `generation`.
fn remove_generation(puppets: &PuppetMap, puppet_id: PuppetId, generation: u64) -> Option<SessionClient> {
    let mut map = puppets.write().unwrap_or_else(PoisonError::into_inner);
    if map.get(&puppet_id).map(|p| p.generation) == Some(generation) {
        map.remove(&puppet_id).map(|p| p.client)
    } else {
        None
    }
}

/// Relay one session's events until its channel closes.
async fn forward_events(
    host: Arc<dyn BridgeHost>,
    puppets: PuppetMap,
    puppet_id: PuppetId,
    generation: u64,
    mut rx: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = rx.recv().await {
        debug!(puppet_id, kind = event.kind(), "forwarding event");
        let logout = matches!(event, SessionEvent::Logout);
        if let Err(e) = forward_one(host.as_ref(), puppet_id, event).await {
            warn!(puppet_id, error = %e, "failed to forward event");
        }
        if logout {
            if let Some(client) = remove_generation(&puppets, puppet_id, generation) {
                client.disconnect();
            }
            break;
        }
    }
    debug!(puppet_id, "event forwarder stopped");
}

async fn forward_one(host: &dyn BridgeHost, puppet_id: PuppetId, event: SessionEvent) -> anyhow::Result<()> {
    match event {
        SessionEvent::Message { origin, text } => {
            host.send_message(&SendParams::from_origin(puppet_id, &origin), &text)
                .await
        }
        SessionEvent::File { origin, url } => {
            host.send_file(&SendParams::from_origin(puppet_id, &origin), &url)
                .await
        }
        SessionEvent::ReelShare {
            origin,
            text,
            media_url,
        }
        | SessionEvent::MediaShare {
            origin,
            text,
            media_url,
        } => {
            let params = SendParams::from_origin(puppet_id, &origin);
            if !text.is_empty() {
                host.send_message(&params, &text).await?;
            }
            if let Some(url) = media_url {
                host.send_file(&params, &url).await?;
            }
            Ok(())
        }
        SessionEvent::UserUpdate(user) => {
            host.update_user(&RemoteUserInfo::new(puppet_id, &user))
                .await
        }
        SessionEvent::Auth(user) => {
            let who = if user.name.is_empty() {
                user.user_id.as_str()
            } else {
                user.name.as_str()
            };
            host.send_status(puppet_id, &format!("Logged in as {who}"))
                .await
        }
        SessionEvent::Logout => {
            host.send_status(
                puppet_id,
                "Instagram logged this session out. Please link your account again.",
            )
            .await
        }
    }
}
