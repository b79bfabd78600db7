//! Multi-step account linking.
//!
//! A Matrix user links an account by posting a session cookie or a
//! username/password pair. Password logins may stop at a checkpoint or a
//! two-factor prompt; the pending attempt (its platform client plus a
//! [`LoginState`]) is parked in the [`LoginRegistry`] until the next step
//! arrives. A finished login is turned into a durable session token and
//! registered as a new puppet.

pub mod routes;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use crate::http::{error_response, M_FORBIDDEN, M_UNKNOWN};
use crate::login::{extract_durable_token, inject_durable_token, LoginData};
use crate::platform::{
    PlatformClient, PlatformConnector, PlatformError, TwoFactorLogin, TwoFactorMethod,
};
use crate::PuppetId;

/// Errors returned to the provisioning caller. All render as 403.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    /// The platform refused the username/password.
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// A two-factor prompt arrived without the identifier needed to answer it.
    #[error("Unable to login, no 2fa identifier found")]
    NoTwoFactorIdentifier,

    /// A follow-up step arrived with no matching pending attempt.
    #[error("Login not started")]
    LoginNotStarted,

    /// The finished login left no usable session cookie.
    #[error("Invalid session id")]
    InvalidSession,

    /// The platform rejected a step; carries its message.
    #[error("{0}")]
    StepRejected(String),

    /// The bridge framework could not store the new puppet.
    #[error("failed to register puppet: {0}")]
    Registration(String),
}

impl ProvisioningError {
    /// Matrix error code for this failure.
    pub fn errcode(&self) -> &'static str {
        match self {
            Self::NoTwoFactorIdentifier | Self::Registration(_) => M_UNKNOWN,
            Self::InvalidCredentials
            | Self::LoginNotStarted
            | Self::InvalidSession
            | Self::StepRejected(_) => M_FORBIDDEN,
        }
    }
}

impl IntoResponse for ProvisioningError {
    fn into_response(self) -> Response {
        error_response(StatusCode::FORBIDDEN, self.errcode(), self.to_string())
    }
}

/// One request in the linking flow.
#[derive(Clone, PartialEq, Eq)]
pub enum LoginStep {
    /// Link with an existing session cookie.
    Cookie {
        /// Value of the `sessionid` cookie.
        session_id: String,
    },
    /// Start a password login.
    Password {
        /// Account handle.
        username: String,
        /// Account password.
        password: String,
    },
    /// Answer a checkpoint challenge.
    Checkpoint {
        /// Code delivered by the platform.
        code: String,
    },
    /// Answer a two-factor prompt.
    TwoFactor {
        /// SMS or authenticator code.
        code: String,
    },
}

impl std::fmt::Debug for LoginStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cookie { .. } => f.write_str("Cookie"),
            Self::Password { username, .. } => {
                f.debug_struct("Password").field("username", username).finish_non_exhaustive()
            }
            Self::Checkpoint { .. } => f.write_str("Checkpoint"),
            Self::TwoFactor { .. } => f.write_str("TwoFactor"),
        }
    }
}

/// Follow-up the caller must post next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Post the checkpoint code.
    Checkpoint,
    /// Post the two-factor code.
    TwoFactor,
}

impl NextStep {
    /// Route of the follow-up endpoint, relative to the provisioning prefix.
    pub fn path(self) -> &'static str {
        match self {
            Self::Checkpoint => "/login/checkpoint",
            Self::TwoFactor => "/login/2fa",
        }
    }
}

/// Result of a successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The account is linked.
    Completed {
        /// Id the framework assigned to the new puppet.
        puppet_id: PuppetId,
    },
    /// Another step is required.
    Pending(NextStep),
}

/// Where a pending login attempt stands.
#[derive(Clone, PartialEq, Eq)]
pub enum LoginState {
    /// Nothing submitted yet.
    AwaitingPassword,
    /// Waiting for the checkpoint code.
    AwaitingChallengeCode,
    /// Waiting for the two-factor code.
    AwaitingTwoFactorCode {
        /// Account handle the code belongs to.
        username: String,
        /// Identifier returned with the prompt.
        two_factor_identifier: String,
    },
    /// Logged in and the durable token extracted, but registration failed.
    Authenticated {
        /// Durable session token.
        token: String,
    },
}

impl std::fmt::Debug for LoginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingPassword => f.write_str("AwaitingPassword"),
            Self::AwaitingChallengeCode => f.write_str("AwaitingChallengeCode"),
            Self::AwaitingTwoFactorCode { username, .. } => f
                .debug_struct("AwaitingTwoFactorCode")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Authenticated { .. } => f.write_str("Authenticated"),
        }
    }
}

/// A pending login: the platform client holding its cookies and challenge
/// context, and the step it waits for.
struct LoginAttempt {
    client: Arc<dyn PlatformClient>,
    state: LoginState,
}

/// Pending attempts keyed by the provisioning caller's user id.
#[derive(Default)]
pub struct LoginRegistry {
    attempts: Mutex<HashMap<String, LoginAttempt>>,
}

impl LoginRegistry {
    /// State of the caller's pending attempt.
    pub fn state(&self, user_id: &str) -> Option<LoginState> {
        self.lock().get(user_id).map(|a| a.state.clone())
    }

    /// Number of pending attempts.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no attempts are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, user_id: &str) -> Option<LoginAttempt> {
        self.lock().remove(user_id)
    }

    fn store(&self, user_id: &str, attempt: LoginAttempt) {
        debug!(user_id, state = ?attempt.state, "parking login attempt");
        self.lock().insert(user_id.to_owned(), attempt);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LoginAttempt>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The bridge framework's puppet store.
#[async_trait]
pub trait PuppetRegistrar: Send + Sync {
    /// Create a puppet owned by `user_id` and return its id.
    async fn register_puppet(&self, user_id: &str, data: LoginData) -> anyhow::Result<PuppetId>;
}

/// Drives [`LoginStep`]s through the platform and registers finished logins.
pub struct Provisioner {
    connector: Arc<dyn PlatformConnector>,
    registrar: Arc<dyn PuppetRegistrar>,
    attempts: LoginRegistry,
}

impl Provisioner {
    /// Create a provisioner with no pending attempts.
    pub fn new(connector: Arc<dyn PlatformConnector>, registrar: Arc<dyn PuppetRegistrar>) -> Self {
        Self {
            connector,
            registrar,
            attempts: LoginRegistry::default(),
        }
    }

    /// Pending attempts.
    pub fn attempts(&self) -> &LoginRegistry {
        &self.attempts
    }

    /// Apply one step for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProvisioningError`] describing why the step was refused.
    pub async fn submit(
        &self,
        user_id: &str,
        step: LoginStep,
    ) -> Result<StepOutcome, ProvisioningError> {
        debug!(user_id, ?step, "provisioning step");
        match step {
            LoginStep::Cookie { session_id } => self.login_with_cookie(user_id, &session_id).await,
            LoginStep::Password { username, password } => {
                self.login_with_password(user_id, &username, &password).await
            }
            LoginStep::Checkpoint { code } => self.answer_checkpoint(user_id, &code).await,
            LoginStep::TwoFactor { code } => self.answer_two_factor(user_id, &code).await,
        }
    }

    async fn login_with_cookie(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<StepOutcome, ProvisioningError> {
        // A new link request supersedes anything pending.
        drop(self.attempts.take(user_id));
        let client = self.connector.new_client();
        inject_durable_token(client.as_ref(), session_id)
            .await
            .map_err(|e| ProvisioningError::StepRejected(e.to_string()))?;
        self.finish(user_id, client).await
    }

    async fn login_with_password(
        &self,
        user_id: &str,
        username: &str,
        password: &str,
    ) -> Result<StepOutcome, ProvisioningError> {
        drop(self.attempts.take(user_id));
        let client = self.connector.new_client();

        client
            .generate_device(username)
            .await
            .map_err(|e| ProvisioningError::StepRejected(e.to_string()))?;
        client
            .pre_login_flow()
            .await
            .map_err(|e| ProvisioningError::StepRejected(e.to_string()))?;

        let login = async {
            client.login(username, password).await?;
            client.current_user().await
        };

        match login.await {
            Ok(_) => self.finish(user_id, client).await,
            Err(PlatformError::CheckpointRequired) => {
                info!(user_id, "checkpoint required, requesting challenge");
                client
                    .challenge_auto(true)
                    .await
                    .map_err(|e| ProvisioningError::StepRejected(e.to_string()))?;
                self.attempts.store(
                    user_id,
                    LoginAttempt {
                        client,
                        state: LoginState::AwaitingChallengeCode,
                    },
                );
                Ok(StepOutcome::Pending(NextStep::Checkpoint))
            }
            Err(PlatformError::TwoFactorRequired {
                two_factor_identifier,
            }) => {
                let Some(two_factor_identifier) =
                    two_factor_identifier.filter(|id| !id.is_empty())
                else {
                    warn!(user_id, "two-factor prompt without identifier");
                    return Err(ProvisioningError::NoTwoFactorIdentifier);
                };
                info!(user_id, "two-factor code required");
                self.attempts.store(
                    user_id,
                    LoginAttempt {
                        client,
                        state: LoginState::AwaitingTwoFactorCode {
                            username: username.to_owned(),
                            two_factor_identifier,
                        },
                    },
                );
                Ok(StepOutcome::Pending(NextStep::TwoFactor))
            }
            Err(e) => {
                warn!(user_id, error = %e, "password login failed");
                Err(ProvisioningError::InvalidCredentials)
            }
        }
    }

    async fn answer_checkpoint(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<StepOutcome, ProvisioningError> {
        let attempt = match self.attempts.take(user_id) {
            Some(a) if a.state == LoginState::AwaitingChallengeCode => a,
            Some(LoginAttempt {
                client,
                state: LoginState::Authenticated { token },
            }) => return self.register(user_id, client, token).await,
            Some(other) => {
                self.attempts.store(user_id, other);
                return Err(ProvisioningError::LoginNotStarted);
            }
            None => return Err(ProvisioningError::LoginNotStarted),
        };

        if let Err(e) = attempt.client.send_security_code(code).await {
            warn!(user_id, error = %e, "checkpoint code rejected");
            self.attempts.store(user_id, attempt);
            return Err(ProvisioningError::StepRejected(e.to_string()));
        }
        self.finish(user_id, attempt.client).await
    }

    async fn answer_two_factor(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<StepOutcome, ProvisioningError> {
        let attempt = match self.attempts.take(user_id) {
            Some(a) if matches!(a.state, LoginState::AwaitingTwoFactorCode { .. }) => a,
            Some(LoginAttempt {
                client,
                state: LoginState::Authenticated { token },
            }) => return self.register(user_id, client, token).await,
            Some(other) => {
                self.attempts.store(user_id, other);
                return Err(ProvisioningError::LoginNotStarted);
            }
            None => return Err(ProvisioningError::LoginNotStarted),
        };
        let LoginState::AwaitingTwoFactorCode {
            username,
            two_factor_identifier,
        } = attempt.state.clone()
        else {
            return Err(ProvisioningError::LoginNotStarted);
        };

        let mut request = TwoFactorLogin {
            username,
            verification_code: code.to_owned(),
            two_factor_identifier,
            verification_method: TwoFactorMethod::Sms,
        };

        let result = match attempt.client.two_factor_login(&request).await {
            Err(e) if !e.is_transport() => {
                debug!(user_id, error = %e, "SMS verification failed, trying authenticator code");
                request.verification_method = TwoFactorMethod::Totp;
                attempt.client.two_factor_login(&request).await
            }
            other => other,
        };

        if let Err(e) = result {
            warn!(user_id, error = %e, "two-factor code rejected");
            self.attempts.store(user_id, attempt);
            return Err(ProvisioningError::StepRejected(e.to_string()));
        }
        self.finish(user_id, attempt.client).await
    }

    async fn finish(
        &self,
        user_id: &str,
        client: Arc<dyn PlatformClient>,
    ) -> Result<StepOutcome, ProvisioningError> {
        let token = extract_durable_token(client.as_ref()).await.map_err(|e| {
            warn!(user_id, error = %e, "no session cookie after login");
            ProvisioningError::InvalidSession
        })?;
        self.register(user_id, client, token).await
    }

    /// Register the linked account. On failure the attempt is parked as
    /// [`LoginState::Authenticated`] so the next code submission retries
    /// registration without logging in again.
    async fn register(
        &self,
        user_id: &str,
        client: Arc<dyn PlatformClient>,
        token: String,
    ) -> Result<StepOutcome, ProvisioningError> {
        let data = LoginData::SessionToken {
            session_id: token.clone(),
        };
        match self.registrar.register_puppet(user_id, data).await {
            Ok(puppet_id) => {
                info!(user_id, puppet_id, "account linked");
                Ok(StepOutcome::Completed { puppet_id })
            }
            Err(e) => {
                warn!(user_id, error = %e, "puppet registration failed");
                self.attempts.store(
                    user_id,
                    LoginAttempt {
                        client,
                        state: LoginState::Authenticated { token },
                    },
                );
                Err(ProvisioningError::Registration(e.to_string()))
            }
        }
    }
}
