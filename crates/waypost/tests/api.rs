//! HTTP API integration tests: the real router over an in-memory database.

use std::collections::HashMap;
use std::sync::Arc;

use axum_test::TestServer;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use waypost::api::{create_router, AppState};
use waypost::auth::{BuiltinAuth, RuntimeAuthenticator};
use waypost::config::Settings;
use waypost::db::Database;
use waypost::store::{NewUser, Role, Store};
use waypost::ws::{Hub, HubConfig};

struct TestApp {
    server: TestServer,
    store: Store,
    #[allow(dead_code)]
    files_root: tempfile::TempDir,
}

async fn test_app() -> TestApp {
    let files_root = tempfile::TempDir::new().unwrap();

    let mut settings = Settings::default();
    settings.auth.jwt_secret = "test-secret".to_string();
    settings.files.root = files_root.path().to_path_buf();

    let db = Database::in_memory().await.unwrap();
    let store = Store::new(&db);

    // Seed one admin and one regular user.
    store
        .create_user(NewUser {
            org_id: "default".into(),
            external_id: None,
            username: "admin".into(),
            password_hash: Some(BuiltinAuth::hash_password("admin-pass-1").unwrap()),
            role: Role::Admin,
        })
        .await
        .unwrap();
    store
        .create_user(NewUser {
            org_id: "default".into(),
            external_id: None,
            username: "mallory".into(),
            password_hash: Some(BuiltinAuth::hash_password("mallory-pass").unwrap()),
            role: Role::User,
        })
        .await
        .unwrap();

    let runtime_auth = Arc::new(RuntimeAuthenticator::new(
        store.clone(),
        HashMap::new(),
        None,
        3600,
    ));
    let hub = Hub::new(
        store.clone(),
        runtime_auth,
        HubConfig::from_settings(&settings),
        CancellationToken::new(),
    );
    let builtin = Arc::new(BuiltinAuth::new(
        store.clone(),
        &settings.auth.jwt_secret,
        settings.auth.jwt_expiry_secs,
    ));

    let state = AppState::new(
        db,
        store.clone(),
        hub,
        Arc::new(settings),
        builtin.clone(),
        Some(builtin),
    );

    TestApp {
        server: TestServer::new(create_router(state)).unwrap(),
        store,
        files_root,
    }
}

async fn login(server: &TestServer, username: &str, password: &str) -> String {
    let response = server
        .post("/api/auth/login")
        .json(&json!({ "username": username, "password": password }))
        .await;
    response.assert_status_ok();
    response.json::<Value>()["token"].as_str().unwrap().to_string()
}

fn bearer(token: &str) -> (axum::http::HeaderName, axum::http::HeaderValue) {
    (
        axum::http::header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    )
}

#[tokio::test]
async fn health_endpoints_respond() {
    let app = test_app().await;

    let health = app.server.get("/healthz").await;
    health.assert_status_ok();
    assert_eq!(health.json::<Value>()["status"], "ok");

    app.server.get("/readyz").await.assert_status_ok();
}

#[tokio::test]
async fn auth_config_names_the_provider() {
    let app = test_app().await;
    let response = app.server.get("/api/auth/config").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["provider"], "builtin");
}

#[tokio::test]
async fn login_succeeds_and_bad_credentials_fail() {
    let app = test_app().await;

    let token = login(&app.server, "admin", "admin-pass-1").await;
    assert!(!token.is_empty());

    let bad = app
        .server
        .post("/api/auth/login")
        .json(&json!({ "username": "admin", "password": "wrong" }))
        .await;
    bad.assert_status_unauthorized();
}

#[tokio::test]
async fn protected_routes_require_a_token() {
    let app = test_app().await;

    app.server.get("/api/sessions").await.assert_status_unauthorized();

    let token = login(&app.server, "admin", "admin-pass-1").await;
    let (name, value) = bearer(&token);
    let response = app
        .server
        .get("/api/sessions")
        .add_header(name, value)
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>().as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn session_creation_fails_cleanly_without_a_runtime() {
    let app = test_app().await;
    let token = login(&app.server, "admin", "admin-pass-1").await;

    // Unknown agent: 404.
    let (name, value) = bearer(&token);
    app.server
        .post("/api/sessions")
        .add_header(name, value)
        .json(&json!({ "agent_id": "missing" }))
        .await
        .assert_status_not_found();

    // Known agent with no live runtime connection: 503.
    app.store
        .upsert_runtime("r1", "default", "lab")
        .await
        .unwrap();
    app.store
        .replace_agents(
            "r1",
            "default",
            &[waypost_protocol::AgentDescriptor {
                id: "a1".into(),
                profile: "cli".into(),
                name: "CLI".into(),
                tags: None,
                caps: Default::default(),
                security: None,
            }],
        )
        .await
        .unwrap();

    let (name, value) = bearer(&token);
    app.server
        .post("/api/sessions")
        .add_header(name, value)
        .json(&json!({ "agent_id": "a1" }))
        .await
        .assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn messages_of_unknown_session_are_not_found() {
    let app = test_app().await;
    let token = login(&app.server, "admin", "admin-pass-1").await;

    let (name, value) = bearer(&token);
    let response = app
        .server
        .get("/api/sessions/sess_missing/messages")
        .add_header(name, value)
        .await;
    response.assert_status_not_found();
    assert_eq!(response.json::<Value>()["code"], "session_not_found");
}

#[tokio::test]
async fn device_code_happy_path_discloses_token_once() {
    let app = test_app().await;

    let started = app.server.post("/api/runtime/register").await;
    started.assert_status_ok();
    let body = started.json::<Value>();
    let user_code = body["user_code"].as_str().unwrap().to_string();
    let polling_token = body["polling_token"].as_str().unwrap().to_string();
    assert_eq!(body["expires_in"], 300);
    assert_eq!(body["interval"], 5);

    // Pending until approved.
    let pending = app
        .server
        .post("/api/runtime/register/poll")
        .json(&json!({ "polling_token": polling_token }))
        .await;
    pending.assert_status_ok();
    assert_eq!(pending.json::<Value>()["status"], "pending");

    // Approval requires admin.
    app.server
        .post("/api/runtime/register/approve")
        .json(&json!({ "user_code": user_code }))
        .await
        .assert_status_unauthorized();

    let admin_token = login(&app.server, "admin", "admin-pass-1").await;
    let (name, value) = bearer(&admin_token);
    let approved = app
        .server
        .post("/api/runtime/register/approve")
        .add_header(name, value)
        .json(&json!({ "user_code": user_code, "runtime_name": "lab1" }))
        .await;
    approved.assert_status_ok();
    let runtime_id = approved.json::<Value>()["runtime_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(runtime_id.starts_with("runtime-"));

    // First approved poll carries the plaintext.
    let first = app
        .server
        .post("/api/runtime/register/poll")
        .json(&json!({ "polling_token": polling_token }))
        .await;
    first.assert_status_ok();
    let first_body = first.json::<Value>();
    assert_eq!(first_body["status"], "approved");
    let token = first_body["token"].as_str().unwrap();
    assert_eq!(token.len(), 64);
    assert_eq!(first_body["runtime_id"], runtime_id.as_str());
    assert_eq!(first_body["org_id"], "default");

    // Second poll: status only, no plaintext.
    let second = app
        .server
        .post("/api/runtime/register/poll")
        .json(&json!({ "polling_token": polling_token }))
        .await;
    second.assert_status_ok();
    let second_body = second.json::<Value>();
    assert_eq!(second_body["status"], "approved");
    assert!(second_body.get("token").is_none());
}

#[tokio::test]
async fn approving_twice_conflicts_and_expiry_is_gone() {
    let app = test_app().await;
    let admin_token = login(&app.server, "admin", "admin-pass-1").await;

    let started = app.server.post("/api/runtime/register").await.json::<Value>();
    let user_code = started["user_code"].as_str().unwrap().to_string();

    let (name, value) = bearer(&admin_token);
    app.server
        .post("/api/runtime/register/approve")
        .add_header(name, value)
        .json(&json!({ "user_code": user_code }))
        .await
        .assert_status_ok();

    let (name, value) = bearer(&admin_token);
    let again = app
        .server
        .post("/api/runtime/register/approve")
        .add_header(name, value)
        .json(&json!({ "user_code": user_code }))
        .await;
    again.assert_status(axum::http::StatusCode::CONFLICT);

    // An expired code answers 410 on approval.
    let second = app.server.post("/api/runtime/register").await.json::<Value>();
    let expired_code = second["user_code"].as_str().unwrap().to_string();
    sqlx::query("UPDATE device_codes SET expires_at = datetime('now', '-1 minute') WHERE user_code = ?")
        .bind(&expired_code)
        .execute(app.store.pool())
        .await
        .unwrap();

    let (name, value) = bearer(&admin_token);
    app.server
        .post("/api/runtime/register/approve")
        .add_header(name, value)
        .json(&json!({ "user_code": expired_code }))
        .await
        .assert_status(axum::http::StatusCode::GONE);
}

#[tokio::test]
async fn user_management_is_admin_and_builtin_gated() {
    let app = test_app().await;

    let user_token = login(&app.server, "mallory", "mallory-pass").await;
    let (name, value) = bearer(&user_token);
    app.server
        .post("/api/users")
        .add_header(name, value)
        .json(&json!({ "username": "eve", "password": "password-123" }))
        .await
        .assert_status_forbidden();

    let admin_token = login(&app.server, "admin", "admin-pass-1").await;
    let (name, value) = bearer(&admin_token);
    let created = app
        .server
        .post("/api/users")
        .add_header(name, value)
        .json(&json!({ "username": "eve", "password": "password-123" }))
        .await;
    created.assert_status(axum::http::StatusCode::CREATED);

    // The new user can log in; the hash never leaves the server.
    let body = created.json::<Value>();
    assert!(body.get("password_hash").is_none());
    login(&app.server, "eve", "password-123").await;

    // Short passwords are rejected.
    let (name, value) = bearer(&admin_token);
    app.server
        .post("/api/users")
        .add_header(name, value)
        .json(&json!({ "username": "frank", "password": "short" }))
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn admin_views_are_role_gated() {
    let app = test_app().await;

    let user_token = login(&app.server, "mallory", "mallory-pass").await;
    let (name, value) = bearer(&user_token);
    app.server
        .get("/api/admin/audit")
        .add_header(name, value)
        .await
        .assert_status_forbidden();

    let admin_token = login(&app.server, "admin", "admin-pass-1").await;
    let (name, value) = bearer(&admin_token);
    let audit = app
        .server
        .get("/api/admin/audit")
        .add_header(name, value)
        .await;
    audit.assert_status_ok();
}

#[tokio::test]
async fn file_download_of_unknown_file_is_not_found() {
    let app = test_app().await;
    let token = login(&app.server, "admin", "admin-pass-1").await;

    let (name, value) = bearer(&token);
    let response = app
        .server
        .get("/api/files/file_missing")
        .add_query_param("session_id", "sess_missing")
        .add_header(name, value)
        .await;
    // The session does not exist, so the lookup dies there.
    response.assert_status_not_found();
}
