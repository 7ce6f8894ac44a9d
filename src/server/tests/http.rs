//! Integration tests for the shellgate HTTP API.
//!
//! Uses `axum_test::TestServer` against the real router with an in-memory
//! SQLite database — no TCP, no PTYs.

use anyhow::Result;
use axum_test::TestServer;
use common::auth::AuthRegistry;
use common::db::Db;
use common::hub::Hub;
use common::store::SessionStore;
use serde_json::{json, Value};
use server::{build_router, AppState};
use std::sync::Arc;

fn test_state() -> AppState {
    let db = Arc::new(Db::open_in_memory().expect("in-memory db"));
    let hub = Arc::new(Hub::new(db.clone()));
    AppState {
        hub,
        db,
        auth: Arc::new(AuthRegistry::new()),
        dist: None,
    }
}

fn test_server(state: &AppState) -> TestServer {
    TestServer::new(build_router(state.clone())).expect("failed to create test server")
}

async fn login(server: &TestServer, username: &str, password: &str) -> String {
    let resp = server
        .post("/api/login")
        .json(&json!({ "username": username, "password": password }))
        .await;
    let body: Value = resp.json();
    assert_eq!(body["code"], 0, "login failed: {body}");
    body["data"]["token"].as_str().expect("token").to_string()
}

#[tokio::test]
async fn login_rejects_bad_credentials() -> Result<()> {
    let state = test_state();
    state.db.add_user("alice", "s3cret")?;
    let server = test_server(&state);

    let resp = server
        .post("/api/login")
        .json(&json!({ "username": "alice", "password": "wrong" }))
        .await;
    let body: Value = resp.json();
    assert_eq!(body["code"], 1);
    assert_eq!(body["message"], "Invalid username or password");

    let resp = server.post("/api/login").text("not json").await;
    let body: Value = resp.json();
    assert_eq!(body["code"], 1);
    Ok(())
}

#[tokio::test]
async fn login_issues_a_working_token() -> Result<()> {
    let state = test_state();
    state.db.add_user("alice", "s3cret")?;
    let server = test_server(&state);

    let token = login(&server, "alice", "s3cret").await;
    assert_eq!(token.len(), 64);

    let resp = server.get("/api/status").authorization_bearer(&token).await;
    let body: Value = resp.json();
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["is_running"], false);
    Ok(())
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() -> Result<()> {
    let state = test_state();
    let server = test_server(&state);

    let resp = server.get("/api/terminals").await;
    assert_eq!(resp.status_code(), 401);
    assert_eq!(resp.text(), "Authentication token not provided");

    let resp = server
        .get("/api/terminals")
        .add_header(
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderValue::from_static("Basic abc"),
        )
        .await;
    assert_eq!(resp.status_code(), 401);
    assert_eq!(resp.text(), "Invalid authentication format, should be Bearer token");

    let resp = server
        .get("/api/terminals")
        .authorization_bearer("deadbeef")
        .await;
    assert_eq!(resp.status_code(), 401);
    assert_eq!(resp.text(), "Invalid or expired token");
    Ok(())
}

#[tokio::test]
async fn saved_commands_crud_over_the_api() -> Result<()> {
    let state = test_state();
    state.db.add_user("alice", "pw")?;
    let server = test_server(&state);
    let token = login(&server, "alice", "pw").await;

    let resp = server
        .post("/api/commands/add")
        .authorization_bearer(&token)
        .json(&json!({ "name": "deploy", "command": "make deploy", "description": "ship" }))
        .await;
    assert_eq!(resp.json::<Value>()["code"], 0);

    // Name and command are required.
    let resp = server
        .post("/api/commands/add")
        .authorization_bearer(&token)
        .json(&json!({ "name": "", "command": "x" }))
        .await;
    assert_eq!(resp.json::<Value>()["code"], 1);

    let resp = server.get("/api/commands").authorization_bearer(&token).await;
    let body: Value = resp.json();
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"][0]["name"], "deploy");
    assert_eq!(body["data"][0]["command"], "make deploy");

    let resp = server
        .post("/api/commands/update")
        .authorization_bearer(&token)
        .json(&json!({ "name": "missing", "command": "x" }))
        .await;
    assert_eq!(resp.json::<Value>()["code"], 1);

    let resp = server
        .get("/api/commands/delete")
        .authorization_bearer(&token)
        .add_query_param("name", "deploy")
        .await;
    assert_eq!(resp.json::<Value>()["code"], 0);

    let resp = server.get("/api/commands").authorization_bearer(&token).await;
    assert_eq!(resp.json::<Value>()["data"], json!([]));
    Ok(())
}

#[tokio::test]
async fn terminal_list_shows_hibernated_rows() -> Result<()> {
    let state = test_state();
    state.db.add_user("alice", "pw")?;
    // A session hibernated in some earlier life of the process.
    state.db.save("alice", "t-old", b"history")?;
    state.db.set_active("alice", "t-old", false)?;
    // Another user's session must not leak into alice's view.
    state.db.save("bob", "t-bob", b"")?;

    let server = test_server(&state);
    let token = login(&server, "alice", "pw").await;

    let resp = server.get("/api/terminals").authorization_bearer(&token).await;
    let body: Value = resp.json();
    assert_eq!(body["code"], 0);
    let items = body["data"].as_array().expect("array");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["terminal_id"], "t-old");
    assert_eq!(items[0]["active"], false);
    assert!(items[0]["age"].as_str().unwrap().ends_with('s'));
    assert!(items[0]["created_at"].as_str().unwrap().len() == 19);
    Ok(())
}

#[tokio::test]
async fn killing_an_unknown_terminal_reports_the_error() -> Result<()> {
    let state = test_state();
    state.db.add_user("alice", "pw")?;
    let server = test_server(&state);
    let token = login(&server, "alice", "pw").await;

    let resp = server
        .get("/api/terminals/kill")
        .authorization_bearer(&token)
        .add_query_param("terminal_id", "ghost")
        .await;
    let body: Value = resp.json();
    assert_eq!(body["code"], 1);
    assert_eq!(body["message"], "terminal session does not exist");

    let resp = server.get("/api/terminals/kill").authorization_bearer(&token).await;
    assert_eq!(resp.json::<Value>()["message"], "Missing parameter: terminal_id");
    Ok(())
}

#[tokio::test]
async fn run_state_cycles_through_start_and_stop() -> Result<()> {
    let state = test_state();
    state.db.add_user("alice", "pw")?;
    let server = test_server(&state);
    let token = login(&server, "alice", "pw").await;

    let resp = server
        .get("/api/start")
        .authorization_bearer(&token)
        .add_query_param("cmd", "tail -f /var/log/syslog")
        .await;
    assert_eq!(resp.json::<Value>()["code"], 0);

    let resp = server.get("/api/status").authorization_bearer(&token).await;
    let body: Value = resp.json();
    assert_eq!(body["data"]["is_running"], true);
    assert_eq!(body["data"]["command"], "tail -f /var/log/syslog");

    let resp = server.get("/api/stop").authorization_bearer(&token).await;
    assert_eq!(resp.json::<Value>()["code"], 0);

    let resp = server.get("/api/status").authorization_bearer(&token).await;
    assert_eq!(resp.json::<Value>()["data"]["is_running"], false);

    let resp = server.get("/api/start").authorization_bearer(&token).await;
    assert_eq!(resp.json::<Value>()["message"], "Missing parameter: cmd");
    Ok(())
}
