//! Axum router and API handlers: login, run-state, saved commands, terminal
//! list/kill, the WebSocket attach route, and the optional web UI build. All
//! API responses share one envelope: `{code, message, data?}`, code 0 on
//! success.

use crate::middleware::{self, AuthedUser};
use crate::ws;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use common::auth::AuthRegistry;
use common::db::Db;
use common::hub::Hub;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

/// Shared app state threaded into every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub db: Arc<Db>,
    pub auth: Arc<AuthRegistry>,
    pub dist: Option<PathBuf>,
}

/// Uniform API envelope. Code 0 means success.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn ok(message: &str, data: Option<Value>) -> Json<ApiResponse> {
    Json(ApiResponse {
        code: 0,
        message: message.to_string(),
        data,
    })
}

fn fail(message: impl Into<String>) -> Json<ApiResponse> {
    Json(ApiResponse {
        code: 1,
        message: message.into(),
        data: None,
    })
}

/// Build the application router. The IP allow-list layer is added by
/// [`run_web_server`], where peer addresses exist.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/start", get(start_handler))
        .route("/api/stop", get(stop_handler))
        .route("/api/terminals", get(list_terminals_handler))
        .route("/api/terminals/kill", get(kill_terminal_handler))
        .route("/api/commands", get(list_commands_handler))
        .route("/api/commands/add", post(add_command_handler))
        .route("/api/commands/update", post(update_command_handler))
        .route("/api/commands/delete", get(delete_command_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_token,
        ));

    let mut app = Router::new()
        .route("/api/login", post(login_handler))
        .route("/ws", get(ws::ws_handler))
        .merge(protected);

    if let Some(ref dist) = state.dist {
        let spa = ServeDir::new(dist).fallback(ServeFile::new(dist.join("index.html")));
        app = app.fallback_service(spa);
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    app.layer(cors).with_state(state)
}

/// Bind and serve until SIGINT/SIGTERM.
pub async fn run_web_server(
    addr: SocketAddr,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(ref dist) = state.dist {
        if !dist.join("index.html").exists() {
            warn!("web UI dist {:?} has no index.html; serving API only", dist);
        }
    }

    let app = build_router(state.clone()).layer(axum::middleware::from_fn_with_state(
        state,
        middleware::ip_allowlist,
    ));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("shellgate listening on http://{addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("server has shut down");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutting down");
}

// ── auth ────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login_handler(
    State(state): State<AppState>,
    body: Result<Json<LoginBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return fail("Invalid request format").into_response();
    };
    if !state.db.validate_user(&body.username, &body.password) {
        return fail("Invalid username or password").into_response();
    }
    let token = state.auth.issue_token(&body.username);
    info!("user {} logged in", body.username);
    ok(
        "Login successful",
        Some(json!({ "token": token, "username": body.username })),
    )
    .into_response()
}

// ── run state ───────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct StartQuery {
    cmd: Option<String>,
}

async fn start_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
    Query(query): Query<StartQuery>,
) -> Json<ApiResponse> {
    let Some(cmd) = query.cmd.filter(|c| !c.is_empty()) else {
        return fail("Missing parameter: cmd");
    };
    state.auth.set_running(&username, &cmd);
    ok("Command received", Some(json!({ "cmd": cmd })))
}

async fn stop_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
) -> Json<ApiResponse> {
    state.auth.clear_running(&username);
    ok("Command stopped", None)
}

async fn status_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
) -> Json<ApiResponse> {
    let run_state = state.auth.run_state(&username);
    ok(
        "Status retrieved",
        Some(json!({
            "is_running": run_state.is_running,
            "command": run_state.command,
        })),
    )
}

// ── terminal sessions ───────────────────────────────────────────────

async fn list_terminals_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
) -> Json<ApiResponse> {
    let sessions = state.hub.list(&username);
    ok("Terminal sessions retrieved", Some(json!(sessions)))
}

#[derive(serde::Deserialize)]
struct KillQuery {
    terminal_id: Option<String>,
}

async fn kill_terminal_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
    Query(query): Query<KillQuery>,
) -> Json<ApiResponse> {
    let Some(terminal_id) = query.terminal_id.filter(|id| !id.is_empty()) else {
        return fail("Missing parameter: terminal_id");
    };
    match state.hub.kill(&username, &terminal_id) {
        Ok(()) => ok("Terminal session terminated", None),
        Err(e) => {
            warn!("kill of {username}/{terminal_id} failed: {e}");
            fail(e.to_string())
        }
    }
}

// ── saved commands ──────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct CommandBody {
    name: String,
    command: String,
    #[serde(default)]
    description: String,
}

async fn list_commands_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
) -> Json<ApiResponse> {
    match state.db.commands_for_user(&username) {
        Ok(commands) => ok("Commands retrieved", Some(json!(commands))),
        Err(e) => {
            warn!("failed to list commands for {username}: {e}");
            fail("Failed to get user commands")
        }
    }
}

async fn add_command_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
    body: Result<Json<CommandBody>, axum::extract::rejection::JsonRejection>,
) -> Json<ApiResponse> {
    let Ok(Json(body)) = body else {
        return fail("Invalid request format");
    };
    if body.name.is_empty() || body.command.is_empty() {
        return fail("Name and command are required");
    }
    match state
        .db
        .add_command(&username, &body.name, &body.command, &body.description)
    {
        Ok(()) => ok("Command added", None),
        Err(e) => fail(format!("Failed to add command: {e}")),
    }
}

async fn update_command_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
    body: Result<Json<CommandBody>, axum::extract::rejection::JsonRejection>,
) -> Json<ApiResponse> {
    let Ok(Json(body)) = body else {
        return fail("Invalid request format");
    };
    if body.name.is_empty() || body.command.is_empty() {
        return fail("Name and command are required");
    }
    match state
        .db
        .update_command(&username, &body.name, &body.command, &body.description)
    {
        Ok(true) => ok("Command updated", None),
        Ok(false) => fail(format!(
            "Command {} does not exist or does not belong to user {username}",
            body.name
        )),
        Err(e) => fail(format!("Failed to update command: {e}")),
    }
}

#[derive(serde::Deserialize)]
struct DeleteCommandQuery {
    name: Option<String>,
}

async fn delete_command_handler(
    State(state): State<AppState>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
    Query(query): Query<DeleteCommandQuery>,
) -> Json<ApiResponse> {
    let Some(name) = query.name.filter(|n| !n.is_empty()) else {
        return fail("Missing parameter: name");
    };
    match state.db.delete_command(&username, &name) {
        Ok(true) => ok("Command deleted", None),
        Ok(false) => fail(format!(
            "Command {name} does not exist or does not belong to user {username}"
        )),
        Err(e) => fail(format!("Failed to delete command: {e}")),
    }
}
