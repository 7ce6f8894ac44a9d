//! Request middleware: the IP allow-list gate and bearer-token auth.

use crate::web_server::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use tracing::warn;

/// Authenticated username, attached to requests that passed token auth.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub String);

/// Every route sits behind this. Rejected peers get 504 and no body, so a
/// scanner cannot tell the gateway from a closed port.
pub async fn ip_allowlist(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = addr.ip().to_string();
    match state.db.is_ip_allowed(&ip) {
        Ok(true) => next.run(request).await,
        Ok(false) => StatusCode::GATEWAY_TIMEOUT.into_response(),
        Err(e) => {
            warn!("allow-list lookup failed for {ip}: {e}");
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

/// Protected API routes require `Authorization: Bearer <token>`.
pub async fn require_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(header_value) = header_value else {
        return (StatusCode::UNAUTHORIZED, "Authentication token not provided").into_response();
    };
    let Some(token) = header_value.strip_prefix("Bearer ") else {
        return (
            StatusCode::UNAUTHORIZED,
            "Invalid authentication format, should be Bearer token",
        )
            .into_response();
    };
    let Some(username) = state.auth.validate_token(token) else {
        return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response();
    };
    request.extensions_mut().insert(AuthedUser(username));
    next.run(request).await
}
