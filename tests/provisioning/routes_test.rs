//! Provisioning HTTP surface.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use instagram_puppet::provisioning::routes::{router, ProvisioningState};

use crate::fake_platform::{Failure, FakePlatform};
use crate::{provisioner, FakeRegistrar};

const SECRET: &str = "provision-secret";

fn app() -> (Router, Arc<FakePlatform>, Arc<FakeRegistrar>) {
    let (provisioner, platform, registrar) = provisioner();
    let app = router(Arc::new(ProvisioningState {
        provisioner,
        shared_secret: SECRET.to_owned(),
    }));
    (app, platform, registrar)
}

fn post(path: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_owned())).expect("request")
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

#[tokio::test]
async fn cookie_login_returns_created_puppet() {
    let (app, _platform, registrar) = app();
    let (status, body) = call(
        &app,
        post(
            "/login/cookie?user_id=@alice:example.org",
            Some(SECRET),
            r#"{"session_id":"tok"}"#,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "puppet_id": 1 }));
    assert_eq!(registrar.registered()[0].0, "@alice:example.org");
}

#[tokio::test]
async fn password_login_reports_next_step() {
    let (app, platform, _registrar) = app();
    platform.fail_login(Failure::TwoFactor(Some("id".to_owned())));

    let (status, body) = call(
        &app,
        post(
            "/login/password?user_id=@alice:example.org",
            Some(SECRET),
            r#"{"username":"alice","password":"pw"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({ "next_step": "/login/2fa" }));

    let (status, body) = call(
        &app,
        post(
            "/login/2fa?user_id=@alice:example.org",
            Some(SECRET),
            r#"{"code":"123456"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["puppet_id"], 1);
}

#[tokio::test]
async fn checkpoint_next_step_path() {
    let (app, platform, _registrar) = app();
    platform.fail_login(Failure::Checkpoint);

    let (status, body) = call(
        &app,
        post(
            "/login/password?user_id=@alice:example.org",
            Some(SECRET),
            r#"{"username":"alice","password":"pw"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({ "next_step": "/login/checkpoint" }));
}

#[tokio::test]
async fn failures_are_forbidden_error_objects() {
    let (app, platform, _registrar) = app();
    platform.fail_login(Failure::BadCredentials);

    let (status, body) = call(
        &app,
        post(
            "/login/password?user_id=@alice:example.org",
            Some(SECRET),
            r#"{"username":"alice","password":"wrong"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body,
        json!({ "errcode": "M_FORBIDDEN", "error": "Invalid username or password" })
    );

    let (status, body) = call(
        &app,
        post(
            "/login/checkpoint?user_id=@alice:example.org",
            Some(SECRET),
            r#"{"code":"1"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Login not started");
}

#[tokio::test]
async fn missing_or_wrong_secret_is_unauthorized() {
    let (app, _platform, registrar) = app();

    for token in [None, Some("wrong")] {
        let (status, body) = call(
            &app,
            post(
                "/login/cookie?user_id=@alice:example.org",
                token,
                r#"{"session_id":"tok"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errcode"], "M_UNKNOWN_TOKEN");
    }
    assert!(registrar.registered().is_empty());
}

#[tokio::test]
async fn malformed_requests_are_bad_json() {
    let (app, _platform, _registrar) = app();

    let (status, body) = call(
        &app,
        post("/login/cookie", Some(SECRET), r#"{"session_id":"tok"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errcode"], "M_BAD_JSON");

    let (status, body) = call(
        &app,
        post(
            "/login/password?user_id=@alice:example.org",
            Some(SECRET),
            r#"{"username":"alice"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errcode"], "M_BAD_JSON");
}
