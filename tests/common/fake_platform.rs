//! Scripted in-memory platform client shared by the integration suites.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use instagram_puppet::login::session_cookie_jar;
use instagram_puppet::platform::{
    CookieJar, InboxThread, PlatformClient, PlatformConnector, PlatformError, PlatformUser,
    TwoFactorLogin, TwoFactorMethod,
};

/// Clonable description of a platform failure.
#[derive(Debug, Clone)]
pub enum Failure {
    Checkpoint,
    TwoFactor(Option<String>),
    LoginRequired,
    BadCredentials,
    Api(String),
}

impl Failure {
    fn into_error(self) -> PlatformError {
        match self {
            Self::Checkpoint => PlatformError::CheckpointRequired,
            Self::TwoFactor(id) => PlatformError::TwoFactorRequired {
                two_factor_identifier: id,
            },
            Self::LoginRequired => PlatformError::LoginRequired,
            Self::BadCredentials => PlatformError::BadCredentials("bad password".to_owned()),
            Self::Api(msg) => PlatformError::Api(msg),
        }
    }
}

/// An outbound call recorded by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub thread_id: String,
    pub kind: &'static str,
    pub text: String,
    pub urls: Vec<String>,
    pub bytes: usize,
}

struct State {
    me: PlatformUser,
    login_failure: Option<Failure>,
    current_user_failure: Option<Failure>,
    inbox: Result<Vec<InboxThread>, Failure>,
    inbox_calls: usize,
    security_code_failure: Option<Failure>,
    two_factor_failures: VecDeque<Failure>,
    two_factor_methods: Vec<TwoFactorMethod>,
    challenge_resets: Vec<bool>,
    jar: CookieJar,
    login_token: Option<String>,
    sent: Vec<Sent>,
    next_id: u32,
    return_ids: bool,
    calls: Vec<String>,
}

/// Platform client whose responses are set by the test.
pub struct FakePlatform {
    state: Mutex<State>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                me: user("1", "Me", "me-pic"),
                login_failure: None,
                current_user_failure: None,
                inbox: Ok(Vec::new()),
                inbox_calls: 0,
                security_code_failure: None,
                two_factor_failures: VecDeque::new(),
                two_factor_methods: Vec::new(),
                challenge_resets: Vec::new(),
                jar: CookieJar {
                    store_type: "MemoryCookieStore".to_owned(),
                    reject_public_suffixes: true,
                    cookies: Vec::new(),
                },
                login_token: Some("fresh-token".to_owned()),
                sent: Vec::new(),
                next_id: 0,
                return_ids: true,
                calls: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake platform lock")
    }

    pub fn fail_login(&self, failure: Failure) {
        self.lock().login_failure = Some(failure);
    }

    pub fn fail_current_user(&self, failure: Failure) {
        self.lock().current_user_failure = Some(failure);
    }

    pub fn set_inbox(&self, threads: Vec<InboxThread>) {
        self.lock().inbox = Ok(threads);
    }

    pub fn fail_inbox(&self, failure: Failure) {
        self.lock().inbox = Err(failure);
    }

    pub fn inbox_calls(&self) -> usize {
        self.lock().inbox_calls
    }

    pub fn fail_security_code(&self, failure: Option<Failure>) {
        self.lock().security_code_failure = failure;
    }

    pub fn queue_two_factor_failure(&self, failure: Failure) {
        self.lock().two_factor_failures.push_back(failure);
    }

    pub fn two_factor_methods(&self) -> Vec<TwoFactorMethod> {
        self.lock().two_factor_methods.clone()
    }

    pub fn challenge_resets(&self) -> Vec<bool> {
        self.lock().challenge_resets.clone()
    }

    /// Token placed in the jar by a successful login step; `None` leaves it empty.
    pub fn set_login_token(&self, token: Option<&str>) {
        self.lock().login_token = token.map(str::to_owned);
    }

    pub fn jar(&self) -> CookieJar {
        self.lock().jar.clone()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.lock().sent.clone()
    }

    pub fn return_ids(&self, enabled: bool) {
        self.lock().return_ids = enabled;
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn record_call(&self, name: &str) {
        self.lock().calls.push(name.to_owned());
    }

    fn logged_in(state: &mut State) {
        if let Some(token) = state.login_token.clone() {
            state.jar = session_cookie_jar(&token);
        }
    }

    fn record_send(&self, thread_id: &str, kind: &'static str, text: &str, urls: &[String], bytes: usize) -> Option<String> {
        let mut state = self.lock();
        state.sent.push(Sent {
            thread_id: thread_id.to_owned(),
            kind,
            text: text.to_owned(),
            urls: urls.to_vec(),
            bytes,
        });
        state.next_id += 1;
        let id = format!("m-{}", state.next_id);
        state.return_ids.then_some(id)
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn generate_device(&self, _seed: &str) -> Result<(), PlatformError> {
        self.record_call("generate_device");
        Ok(())
    }

    async fn pre_login_flow(&self) -> Result<(), PlatformError> {
        self.record_call("pre_login_flow");
        Ok(())
    }

    async fn login(&self, _username: &str, _password: &str) -> Result<PlatformUser, PlatformError> {
        self.record_call("login");
        let mut state = self.lock();
        if let Some(failure) = state.login_failure.clone() {
            return Err(failure.into_error());
        }
        Self::logged_in(&mut state);
        Ok(state.me.clone())
    }

    async fn current_user(&self) -> Result<PlatformUser, PlatformError> {
        self.record_call("current_user");
        let state = self.lock();
        if let Some(failure) = state.current_user_failure.clone() {
            return Err(failure.into_error());
        }
        Ok(state.me.clone())
    }

    async fn challenge_auto(&self, reset: bool) -> Result<(), PlatformError> {
        self.record_call("challenge_auto");
        self.lock().challenge_resets.push(reset);
        Ok(())
    }

    async fn send_security_code(&self, _code: &str) -> Result<(), PlatformError> {
        self.record_call("send_security_code");
        let mut state = self.lock();
        if let Some(failure) = state.security_code_failure.clone() {
            return Err(failure.into_error());
        }
        Self::logged_in(&mut state);
        Ok(())
    }

    async fn two_factor_login(&self, request: &TwoFactorLogin) -> Result<PlatformUser, PlatformError> {
        self.record_call("two_factor_login");
        let mut state = self.lock();
        state.two_factor_methods.push(request.verification_method);
        if let Some(failure) = state.two_factor_failures.pop_front() {
            return Err(failure.into_error());
        }
        Self::logged_in(&mut state);
        Ok(state.me.clone())
    }

    async fn inbox(&self) -> Result<Vec<InboxThread>, PlatformError> {
        let mut state = self.lock();
        state.inbox_calls += 1;
        state.inbox.clone().map_err(Failure::into_error)
    }

    async fn broadcast_text(&self, thread_id: &str, text: &str) -> Result<Option<String>, PlatformError> {
        Ok(self.record_send(thread_id, "text", text, &[], 0))
    }

    async fn broadcast_photo(&self, thread_id: &str, jpeg: &[u8]) -> Result<Option<String>, PlatformError> {
        Ok(self.record_send(thread_id, "photo", "", &[], jpeg.len()))
    }

    async fn broadcast_link(
        &self,
        thread_id: &str,
        text: &str,
        urls: &[String],
    ) -> Result<Option<String>, PlatformError> {
        Ok(self.record_send(thread_id, "link", text, urls, 0))
    }

    async fn serialize_cookie_jar(&self) -> Result<CookieJar, PlatformError> {
        Ok(self.lock().jar.clone())
    }

    async fn deserialize_cookie_jar(&self, jar: &CookieJar) -> Result<(), PlatformError> {
        self.record_call("deserialize_cookie_jar");
        self.lock().jar = jar.clone();
        Ok(())
    }
}

/// Hands out the same fake for every client request.
pub struct FakeConnector {
    pub platform: Arc<FakePlatform>,
    created: Mutex<usize>,
}

impl FakeConnector {
    pub fn new(platform: Arc<FakePlatform>) -> Arc<Self> {
        Arc::new(Self {
            platform,
            created: Mutex::new(0),
        })
    }

    pub fn created(&self) -> usize {
        *self.created.lock().expect("connector lock")
    }
}

impl PlatformConnector for FakeConnector {
    fn new_client(&self) -> Arc<dyn PlatformClient> {
        *self.created.lock().expect("connector lock") += 1;
        self.platform.clone()
    }
}

// ── Fixtures ────────────────────────────────────────────────────

pub fn user(pk: &str, name: &str, pic_id: &str) -> PlatformUser {
    PlatformUser {
        pk: pk.to_owned(),
        username: name.to_lowercase(),
        full_name: name.to_owned(),
        profile_pic_url: Some(format!("https://cdn.example/{pic_id}.jpg")),
        profile_pic_id: Some(pic_id.to_owned()),
    }
}

pub fn text_item(id: &str, ts_ms: u64, text: &str) -> serde_json::Value {
    json!({
        "item_id": id,
        "user_id": 7,
        "timestamp": format!("{ts_ms}000"),
        "item_type": "text",
        "text": text,
    })
}

/// A private thread with one participant (id 7) and the given items, newest first.
pub fn thread(id: &str, participant_name: &str, items: Vec<serde_json::Value>) -> InboxThread {
    serde_json::from_value(json!({
        "thread_id": id,
        "thread_title": participant_name,
        "thread_type": "private",
        "users": [{ "pk": 7, "full_name": participant_name, "profile_pic_id": "pic-7" }],
        "items": items,
    }))
    .expect("fixture thread should deserialize")
}
