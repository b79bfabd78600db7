//! Normalized events emitted by a session, plus the user record they carry.

use serde::Serialize;

use crate::platform::PlatformUser;

/// A remote participant as tracked by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteUser {
    /// Platform user id.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Current avatar URL.
    pub avatar_url: Option<String>,
    /// Avatar version marker; changes only when the picture changes.
    pub avatar_id: Option<String>,
}

impl RemoteUser {
    /// Whether the visible identity differs. The avatar URL is ignored
    /// because the platform rotates it without the picture changing.
    pub fn differs_from(&self, other: &RemoteUser) -> bool {
        self.name != other.name || self.avatar_id != other.avatar_id
    }
}

impl From<&PlatformUser> for RemoteUser {
    fn from(user: &PlatformUser) -> Self {
        Self {
            user_id: user.pk.clone(),
            name: user.full_name.clone(),
            avatar_url: user.profile_pic_url.clone(),
            avatar_id: user.profile_pic_id.clone(),
        }
    }
}

/// Where an inbound item came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOrigin {
    /// Platform item id.
    pub event_id: String,
    /// Thread the item was posted in.
    pub thread_id: String,
    /// Thread title, if any.
    pub thread_title: Option<String>,
    /// Sender id.
    pub user_id: String,
    /// One-to-one thread.
    pub is_private: bool,
}

/// Everything a session reports to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session authenticated as this account.
    Auth(RemoteUser),
    /// Text message or like reaction.
    Message {
        /// Item origin.
        origin: MessageOrigin,
        /// Message body.
        text: String,
    },
    /// Photo, video, voice note or GIF.
    File {
        /// Item origin.
        origin: MessageOrigin,
        /// Download URL.
        url: String,
    },
    /// Story/reel share or reply.
    ReelShare {
        /// Item origin.
        origin: MessageOrigin,
        /// Text accompanying the share.
        text: String,
        /// Shared media, when resolvable.
        media_url: Option<String>,
    },
    /// Feed post share.
    MediaShare {
        /// Item origin.
        origin: MessageOrigin,
        /// Caption and permalink summary.
        text: String,
        /// Post media, when resolvable.
        media_url: Option<String>,
    },
    /// A participant changed name or avatar.
    UserUpdate(RemoteUser),
    /// The platform no longer accepts this session; it has stopped polling.
    Logout,
}

impl SessionEvent {
    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Message { .. } => "message",
            Self::File { .. } => "file",
            Self::ReelShare { .. } => "reel_share",
            Self::MediaShare { .. } => "media_share",
            Self::UserUpdate(_) => "userupdate",
            Self::Logout => "logout",
        }
    }

    /// Origin of item-derived events.
    pub fn origin(&self) -> Option<&MessageOrigin> {
        match self {
            Self::Message { origin, .. }
            | Self::File { origin, .. }
            | Self::ReelShare { origin, .. }
            | Self::MediaShare { origin, .. } => Some(origin),
            Self::Auth(_) | Self::UserUpdate(_) | Self::Logout => None,
        }
    }
}
