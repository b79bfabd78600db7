//! Per-account session: authentication, the inbox poll loop and outbound sends.
//!
//! A [`SessionClient`] owns one [`PlatformClient`]. After [`SessionClient::connect`]
//! it polls the direct inbox on a background task, diffs each page with an
//! [`InboxTracker`] and pushes [`SessionEvent`]s into the channel supplied at
//! construction. The poll cadence follows [`PollBackoff`].

pub mod backoff;
pub mod events;
pub mod media;
pub mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use backoff::PollBackoff;
pub use events::{MessageOrigin, RemoteUser, SessionEvent};
pub use tracker::{normalize_timestamp, EchoSet, InboxTracker};

use crate::login::{inject_durable_token, LoginData};
use crate::platform::{PlatformClient, PlatformError};

/// Errors surfaced by a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Credentials were missing or rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The platform wants a checkpoint confirmation before continuing.
    #[error("checkpoint challenge required")]
    ChallengeRequired,

    /// The account needs a two-factor code.
    #[error("two-factor authentication required")]
    TwoFactorRequired {
        /// Identifier to submit alongside the code.
        two_factor_identifier: Option<String>,
    },

    /// The stored session is no longer accepted by the platform.
    #[error("session expired")]
    SessionExpired,

    /// Any other platform failure.
    #[error(transparent)]
    Remote(PlatformError),

    /// The cookie jar did not contain a usable session token.
    #[error("invalid session token")]
    InvalidSessionToken,

    /// Operation requires a connected session.
    #[error("session is not connected")]
    NotConnected,

    /// An outbound image could not be converted.
    #[error("image conversion failed: {0}")]
    Image(#[from] image::ImageError),
}

impl From<PlatformError> for SessionError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::CheckpointRequired => Self::ChallengeRequired,
            PlatformError::TwoFactorRequired {
                two_factor_identifier,
            } => Self::TwoFactorRequired {
                two_factor_identifier,
            },
            PlatformError::LoginRequired => Self::SessionExpired,
            PlatformError::BadCredentials(msg) => Self::Authentication(msg),
            other => Self::Remote(other),
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not authenticated, or stopped.
    Disconnected,
    /// Authentication in progress.
    Connecting,
    /// Authenticated and polling.
    Connected,
}

/// Handle to one account session. Cheap to clone.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
}

struct Inner {
    platform: Arc<dyn PlatformClient>,
    credentials: LoginData,
    events: mpsc::Sender<SessionEvent>,
    tracker: Mutex<InboxTracker>,
    echoes: EchoSet,
    account: Mutex<Option<RemoteUser>>,
    state: Mutex<ConnectionState>,
    disconnecting: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("credentials", &self.inner.credentials)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionClient {
    /// Create a disconnected session.
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        credentials: LoginData,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                credentials,
                events,
                tracker: Mutex::new(InboxTracker::new()),
                echoes: EchoSet::default(),
                account: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                disconnecting: AtomicBool::new(false),
                poll_task: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The authenticated account, once connected.
    pub fn account(&self) -> Option<RemoteUser> {
        self.inner
            .account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Authenticate and start polling.
    ///
    /// Emits [`SessionEvent::Auth`] before the first poll.
    ///
    /// # Errors
    ///
    /// Returns the mapped platform failure; the session stays disconnected.
    pub async fn connect(&self) -> Result<RemoteUser, SessionError> {
        self.stop_polling();
        self.inner.set_state(ConnectionState::Connecting);
        self.inner.disconnecting.store(false, Ordering::SeqCst);

        let me = match self.authenticate().await {
            Ok(me) => me,
            Err(e) => {
                warn!(error = %e, "session authentication failed");
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if self.inner.disconnecting.load(Ordering::SeqCst) {
            self.inner.set_state(ConnectionState::Disconnected);
            return Err(SessionError::NotConnected);
        }

        {
            let mut tracker = self
                .inner
                .tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *tracker = InboxTracker::new();
            tracker.remember_user(me.clone());
        }
        *self
            .inner
            .account
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(me.clone());

        info!(user_id = %me.user_id, "session authenticated");
        if self.inner.events.send(SessionEvent::Auth(me.clone())).await.is_err() {
            debug!("event receiver dropped before auth event");
        }

        self.inner.set_state(ConnectionState::Connected);
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.inner)));
        *self
            .inner
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(me)
    }

    async fn authenticate(&self) -> Result<RemoteUser, SessionError> {
        let platform = self.inner.platform.as_ref();
        if !self.inner.credentials.is_complete() {
            return Err(SessionError::Authentication(
                "incomplete credentials".to_owned(),
            ));
        }

        let user = match &self.inner.credentials {
            LoginData::SessionToken { session_id } => {
                inject_durable_token(platform, session_id).await?;
                platform.current_user().await?
            }
            LoginData::Password { username, password } => {
                platform.generate_device(username).await?;
                platform.pre_login_flow().await?;
                platform.login(username, password).await?
            }
        };
        Ok(RemoteUser::from(&user))
    }

    /// Stop polling. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.inner.disconnecting.store(true, Ordering::SeqCst);
        self.stop_polling();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    fn stop_polling(&self) {
        let handle = self
            .inner
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            debug!("stopping inbox poll task");
            handle.abort();
        }
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] before a successful connect,
    /// or the mapped platform failure.
    pub async fn send_message(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<Option<String>, SessionError> {
        self.ensure_connected()?;
        let id = self.inner.platform.broadcast_text(thread_id, text).await?;
        Ok(self.remember_sent(id))
    }

    /// Send a photo, converting it to JPEG first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Image`] for undecodable input, otherwise as
    /// [`send_message`](Self::send_message).
    pub async fn send_photo(
        &self,
        thread_id: &str,
        bytes: &[u8],
    ) -> Result<Option<String>, SessionError> {
        self.ensure_connected()?;
        let jpeg = media::normalize_photo(bytes)?;
        let id = self.inner.platform.broadcast_photo(thread_id, &jpeg).await?;
        Ok(self.remember_sent(id))
    }

    /// Send a titled link (used for non-image files).
    ///
    /// # Errors
    ///
    /// As [`send_message`](Self::send_message).
    pub async fn send_link(
        &self,
        thread_id: &str,
        title: &str,
        url: &str,
    ) -> Result<Option<String>, SessionError> {
        self.ensure_connected()?;
        let text = format!("{title}: {url}");
        let id = self
            .inner
            .platform
            .broadcast_link(thread_id, &text, &[url.to_owned()])
            .await?;
        Ok(self.remember_sent(id))
    }

    /// A participant seen in the inbox, or the session's own account.
    pub fn get_user(&self, user_id: &str) -> Option<RemoteUser> {
        self.inner
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .user(user_id)
            .cloned()
    }

    /// Run one poll cycle and return how many item events it produced.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] when not connected, or the
    /// mapped failure of the inbox request.
    pub async fn poll_once(&self) -> Result<usize, SessionError> {
        self.ensure_connected()?;
        self.inner.poll_once().await
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    fn remember_sent(&self, id: Option<String>) -> Option<String> {
        if let Some(id) = &id {
            self.inner.echoes.record(id.clone());
        }
        id
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn poll_once(&self) -> Result<usize, SessionError> {
        let threads = self.platform.inbox().await?;
        let report = self
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(&threads, &self.echoes);

        for event in report.events {
            if self.events.send(event).await.is_err() {
                return Err(SessionError::NotConnected);
            }
        }
        Ok(report.new_items)
    }
}

/// Poll until disconnected, expired or the event receiver goes away.
async fn poll_loop(inner: Arc<Inner>) {
    let mut backoff = PollBackoff::new();
    loop {
        if inner.disconnecting.load(Ordering::SeqCst) {
            break;
        }
        match inner.poll_once().await {
            Ok(new_items) => backoff.record(new_items),
            Err(SessionError::SessionExpired) => {
                warn!("session expired, stopping poll loop");
                inner.set_state(ConnectionState::Disconnected);
                if inner.events.send(SessionEvent::Logout).await.is_err() {
                    debug!("event receiver dropped before logout event");
                }
                // Detach rather than abort: this task is the one running.
                drop(
                    inner
                        .poll_task
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take(),
                );
                break;
            }
            Err(SessionError::NotConnected) => {
                debug!("event receiver closed, stopping poll loop");
                break;
            }
            Err(e) => {
                warn!(error = %e, "inbox poll failed");
                backoff.record(0);
            }
        }
        tokio::time::sleep(backoff.delay()).await;
    }
}
