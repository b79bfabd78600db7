//! Instagram platform seam: the private-API client every session drives.
//!
//! The bridge never speaks the platform wire protocol itself. Login,
//! challenge handling, inbox reads, broadcasts and the cookie jar all go
//! through [`PlatformClient`], one instance per account session or login
//! attempt. [`sidecar::SidecarClient`] implements it over HTTP against a
//! sidecar process wrapping the platform library.

pub mod sidecar;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

/// Errors reported by the platform client.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// HTTP transport to the platform (or its sidecar) failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The platform wants a checkpoint ("it was me") confirmation.
    #[error("checkpoint challenge required")]
    CheckpointRequired,

    /// The account has two-factor authentication enabled.
    #[error("two-factor authentication required")]
    TwoFactorRequired {
        /// Identifier that must accompany the verification code, if provided.
        two_factor_identifier: Option<String>,
    },

    /// The session cookie is no longer accepted.
    #[error("login required")]
    LoginRequired,

    /// Username or password were rejected.
    #[error("bad credentials: {0}")]
    BadCredentials(String),

    /// Any other platform-side failure.
    #[error("platform API error: {0}")]
    Api(String),
}

impl PlatformError {
    /// Whether the sidecar could not be reached at all (refused or timed out).
    ///
    /// Undecodable responses are not transport failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_connect() || e.is_timeout())
    }
}

// ── Wire types ──────────────────────────────────────────────────

/// A platform user as returned by login calls and inbox participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformUser {
    /// Numeric user id (the platform sends numbers; stored as text).
    #[serde(deserialize_with = "string_or_number")]
    pub pk: String,
    /// Login handle.
    #[serde(default)]
    pub username: String,
    /// Display name.
    #[serde(default)]
    pub full_name: String,
    /// Current avatar URL. Rotates even when the picture does not change.
    #[serde(default)]
    pub profile_pic_url: Option<String>,
    /// Stable avatar version marker.
    #[serde(default)]
    pub profile_pic_id: Option<String>,
}

/// One conversation from the direct inbox, items newest-first.
#[derive(Debug, Clone, Deserialize)]
pub struct InboxThread {
    /// Stable thread id.
    pub thread_id: String,
    /// Conversation title (group name or peer name).
    #[serde(default)]
    pub thread_title: Option<String>,
    /// `"private"` for one-to-one threads, `"group"` otherwise.
    #[serde(default)]
    pub thread_type: String,
    /// Participants, excluding the logged-in account.
    #[serde(default, deserialize_with = "lenient_users")]
    pub users: Vec<PlatformUser>,
    /// Most recent items, newest first.
    #[serde(default, deserialize_with = "lenient_items")]
    pub items: Vec<ThreadItem>,
}

impl InboxThread {
    /// Whether this is a one-to-one conversation.
    pub fn is_private(&self) -> bool {
        self.thread_type == "private"
    }
}

/// Decode an inbox page thread by thread, dropping threads that do not parse.
pub fn decode_inbox(raw: Vec<serde_json::Value>) -> Vec<InboxThread> {
    raw.into_iter()
        .filter_map(|value| match InboxThread::deserialize(value) {
            Ok(thread) => Some(thread),
            Err(e) => {
                warn!(error = %e, "skipping malformed inbox thread");
                None
            }
        })
        .collect()
}

/// A single message in a thread.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadItem {
    /// Platform item id.
    pub item_id: String,
    /// Sender user id.
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    /// Microsecond timestamp as a decimal string.
    #[serde(deserialize_with = "string_or_number")]
    pub timestamp: String,
    /// Type-specific payload, tagged by `item_type`.
    #[serde(flatten)]
    pub content: ItemContent,
}

impl ThreadItem {
    /// Decode one item. A payload that does not parse degrades to
    /// [`ItemContent::Unknown`] so the item still moves the thread cursor;
    /// items without a usable id or timestamp are dropped.
    fn decode_lenient(value: &serde_json::Value) -> Option<Self> {
        #[derive(Deserialize)]
        struct Header {
            item_id: String,
            #[serde(deserialize_with = "string_or_number")]
            user_id: String,
            #[serde(deserialize_with = "string_or_number")]
            timestamp: String,
        }

        let payload_err = match Self::deserialize(value) {
            Ok(item) => return Some(item),
            Err(e) => e,
        };
        match Header::deserialize(value) {
            Ok(header) => {
                debug!(item_id = %header.item_id, error = %payload_err, "unreadable item payload");
                Some(Self {
                    item_id: header.item_id,
                    user_id: header.user_id,
                    timestamp: header.timestamp,
                    content: ItemContent::Unknown,
                })
            }
            Err(e) => {
                warn!(error = %e, "skipping thread item without id or timestamp");
                None
            }
        }
    }
}

/// Payload of a thread item, one variant per supported `item_type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "item_type", rename_all = "snake_case")]
pub enum ItemContent {
    /// Plain text.
    Text {
        /// Message body.
        #[serde(default, deserialize_with = "null_as_default")]
        text: String,
    },
    /// The heart reaction sent as a message.
    Like {
        /// Reaction glyph.
        #[serde(default, deserialize_with = "null_as_default")]
        like: String,
    },
    /// Photo or video.
    Media {
        /// Media versions.
        #[serde(default, deserialize_with = "null_as_default")]
        media: MediaPayload,
    },
    /// Voice note.
    VoiceMedia {
        /// Audio wrapper.
        #[serde(default, deserialize_with = "null_as_default")]
        voice_media: VoiceMediaPayload,
    },
    /// GIF sticker.
    AnimatedMedia {
        /// Animated image renditions.
        #[serde(default, deserialize_with = "null_as_default")]
        animated_media: AnimatedMediaPayload,
    },
    /// Reply to, or share of, a story/reel.
    ReelShare {
        /// Share payload.
        #[serde(default, deserialize_with = "null_as_default")]
        reel_share: ReelSharePayload,
    },
    /// A feed post shared into the conversation.
    MediaShare {
        /// Shared post.
        #[serde(default, deserialize_with = "null_as_default")]
        media_share: MediaPayload,
    },
    /// Any item type the bridge does not relay.
    #[serde(other)]
    Unknown,
}

/// Photo/video payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaPayload {
    /// Image renditions.
    #[serde(default)]
    pub image_versions2: Option<ImageVersions>,
    /// Video renditions; empty for photos.
    #[serde(default, deserialize_with = "null_as_default")]
    pub video_versions: Vec<MediaCandidate>,
    /// Post shortcode used in permalinks.
    #[serde(default)]
    pub code: Option<String>,
    /// Post caption.
    #[serde(default)]
    pub caption: Option<Caption>,
}

impl MediaPayload {
    /// Best downloadable URL: the first video rendition, else the first image.
    pub fn best_url(&self) -> Option<&str> {
        self.video_versions
            .first()
            .or_else(|| {
                self.image_versions2
                    .as_ref()
                    .and_then(|v| v.candidates.first())
            })
            .map(|c| c.url.as_str())
            .filter(|url| !url.is_empty())
    }
}

/// Image rendition list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageVersions {
    /// Candidates, largest first.
    #[serde(default, deserialize_with = "null_as_default")]
    pub candidates: Vec<MediaCandidate>,
}

/// A single rendition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaCandidate {
    /// Download URL.
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
}

/// Post caption.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Caption {
    /// Caption text.
    #[serde(default, deserialize_with = "null_as_default")]
    pub text: String,
}

/// Voice note wrapper (`voice_media.media.audio.audio_src`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceMediaPayload {
    /// Inner media object.
    #[serde(default, deserialize_with = "null_as_default")]
    pub media: VoiceMedia,
}

impl VoiceMediaPayload {
    /// Download URL of the audio file, if present.
    pub fn audio_url(&self) -> Option<&str> {
        self.media
            .audio
            .as_ref()
            .and_then(|a| a.audio_src.as_deref())
            .filter(|url| !url.is_empty())
    }
}

/// Inner voice media object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceMedia {
    /// Audio descriptor.
    #[serde(default)]
    pub audio: Option<VoiceAudio>,
}

/// Voice audio descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceAudio {
    /// Download URL of the audio file.
    #[serde(default)]
    pub audio_src: Option<String>,
}

/// GIF sticker payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnimatedMediaPayload {
    /// Renditions.
    #[serde(default, deserialize_with = "null_as_default")]
    pub images: AnimatedImages,
}

impl AnimatedMediaPayload {
    /// URL of the fixed-height rendition, if present.
    pub fn url(&self) -> Option<&str> {
        self.images
            .fixed_height
            .as_ref()
            .map(|c| c.url.as_str())
            .filter(|url| !url.is_empty())
    }
}

/// GIF sticker renditions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnimatedImages {
    /// Fixed-height rendition, the one relayed.
    #[serde(default)]
    pub fixed_height: Option<MediaCandidate>,
}

/// Story/reel share payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReelSharePayload {
    /// Text sent alongside the share (the reply body).
    #[serde(default)]
    pub text: Option<String>,
    /// The story or reel media.
    #[serde(default)]
    pub media: Option<MediaPayload>,
}

/// Verification method for two-factor login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoFactorMethod {
    /// Code delivered by SMS.
    Sms,
    /// Code from an authenticator app.
    Totp,
}

impl TwoFactorMethod {
    /// Wire value expected by the platform.
    pub fn code(self) -> &'static str {
        match self {
            Self::Sms => "1",
            Self::Totp => "0",
        }
    }
}

impl Serialize for TwoFactorMethod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// Two-factor login submission.
#[derive(Debug, Clone, Serialize)]
pub struct TwoFactorLogin {
    /// Account handle.
    pub username: String,
    /// Code entered by the user.
    pub verification_code: String,
    /// Identifier returned with the two-factor demand.
    pub two_factor_identifier: String,
    /// Which delivery method the code came from.
    pub verification_method: TwoFactorMethod,
}

/// A cookie in the platform client's serialized jar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie name.
    pub key: String,
    /// Cookie value.
    pub value: String,
    /// Domain scope.
    #[serde(default)]
    pub domain: Option<String>,
    /// Path scope.
    #[serde(default)]
    pub path: Option<String>,
    /// Only sent over TLS.
    #[serde(default)]
    pub secure: bool,
    /// Hidden from scripts.
    #[serde(default)]
    pub http_only: bool,
    /// Bound to the exact host rather than subdomains.
    #[serde(default)]
    pub host_only: bool,
    /// Lifetime in seconds.
    #[serde(default)]
    pub max_age: Option<u64>,
    /// Creation time.
    #[serde(default)]
    pub creation: Option<DateTime<Utc>>,
}

/// Serialized cookie jar, as exchanged with the platform client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieJar {
    /// Store implementation name.
    #[serde(default)]
    pub store_type: String,
    /// Whether cookies on public suffixes are rejected.
    #[serde(default)]
    pub reject_public_suffixes: bool,
    /// Stored cookies.
    #[serde(default)]
    pub cookies: Vec<Cookie>,
}

// ── Client seam ─────────────────────────────────────────────────

/// Operations the bridge needs from the platform library.
///
/// Implementations are stateful: device fingerprint, cookies and pending
/// challenges live inside the client between calls.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Derive a simulated device fingerprint from a seed (the username).
    async fn generate_device(&self, seed: &str) -> Result<(), PlatformError>;

    /// Replay the requests an official app makes before login.
    async fn pre_login_flow(&self) -> Result<(), PlatformError>;

    /// Password login.
    async fn login(&self, username: &str, password: &str) -> Result<PlatformUser, PlatformError>;

    /// Fetch the logged-in account.
    async fn current_user(&self) -> Result<PlatformUser, PlatformError>;

    /// Let the platform pick a challenge delivery and start it.
    async fn challenge_auto(&self, reset: bool) -> Result<(), PlatformError>;

    /// Answer a pending checkpoint challenge.
    async fn send_security_code(&self, code: &str) -> Result<(), PlatformError>;

    /// Complete a two-factor login.
    async fn two_factor_login(
        &self,
        request: &TwoFactorLogin,
    ) -> Result<PlatformUser, PlatformError>;

    /// First page of the direct inbox.
    async fn inbox(&self) -> Result<Vec<InboxThread>, PlatformError>;

    /// Send text. Returns the created item id when the platform reports one.
    async fn broadcast_text(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<Option<String>, PlatformError>;

    /// Send a JPEG photo.
    async fn broadcast_photo(
        &self,
        thread_id: &str,
        jpeg: &[u8],
    ) -> Result<Option<String>, PlatformError>;

    /// Send text with link previews for `urls`.
    async fn broadcast_link(
        &self,
        thread_id: &str,
        text: &str,
        urls: &[String],
    ) -> Result<Option<String>, PlatformError>;

    /// Export the cookie jar.
    async fn serialize_cookie_jar(&self) -> Result<CookieJar, PlatformError>;

    /// Replace the cookie jar.
    async fn deserialize_cookie_jar(&self, jar: &CookieJar) -> Result<(), PlatformError>;
}

/// Factory for fresh, unauthenticated platform clients.
pub trait PlatformConnector: Send + Sync {
    /// Create a new client with an empty cookie jar.
    fn new_client(&self) -> Arc<dyn PlatformClient>;
}

/// Accept ids sent either as JSON strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Text(s) => s,
        Repr::Signed(n) => n.to_string(),
        Repr::Unsigned(n) => n.to_string(),
    })
}

/// Treat an explicit JSON `null` like an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_users<'de, D>(deserializer: D) -> Result<Vec<PlatformUser>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<serde_json::Value> = null_as_default(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|value| match PlatformUser::deserialize(value) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "skipping malformed thread participant");
                None
            }
        })
        .collect())
}

fn lenient_items<'de, D>(deserializer: D) -> Result<Vec<ThreadItem>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<serde_json::Value> = null_as_default(deserializer)?;
    Ok(raw.iter().filter_map(ThreadItem::decode_lenient).collect())
}
