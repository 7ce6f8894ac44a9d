//! WebSocket attach: the per-client half of a terminal session. The token is
//! validated from the query string before the upgrade. After it, the replay
//! and history sentinel go out first, then one writer task interleaves the
//! session's live broadcast with this client's direct replies while the pump
//! reads control frames and shell input.

use crate::web_server::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::hub::{mint_terminal_id, AttachedClient, Hub};
use common::protocol::{self, ClientFrame, Frame, HISTORY_SENTINEL};
use common::session::Session;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Read deadline on the client channel. Timeouts alone never detach; they just
/// give the pump a chance to observe session teardown.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat replies are delayed to damp tight heartbeat loops from
/// misbehaving clients.
const HEARTBEAT_REPLY_DELAY: Duration = Duration::from_millis(200);

/// Queue depth for per-client direct replies (heartbeats).
const DIRECT_QUEUE_CAP: usize = 8;

#[derive(serde::Deserialize)]
pub struct WsQuery {
    #[serde(rename = "terminalId")]
    terminal_id: Option<String>,
    token: Option<String>,
}

/// `GET /ws?terminalId=&token=` — authenticate, settle the terminal id, upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(username) = query
        .token
        .as_deref()
        .and_then(|token| state.auth.validate_token(token))
    else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    let terminal_id = query
        .terminal_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(mint_terminal_id);
    info!("user {username} authenticated for terminal {terminal_id} from {addr}");

    let hub = state.hub.clone();
    let client_key = addr.to_string();
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, hub, username, terminal_id, client_key))
}

async fn handle_terminal_socket(
    mut socket: WebSocket,
    hub: Arc<Hub>,
    username: String,
    terminal_id: String,
    client_key: String,
) {
    // Greeting pair first: the client learns the id the server settled on.
    if socket
        .send(Message::Text(protocol::welcome_message(&terminal_id).into()))
        .await
        .is_err()
    {
        return;
    }
    if socket
        .send(Message::Text(protocol::auth_ok_message(&terminal_id).into()))
        .await
        .is_err()
    {
        return;
    }

    let attached = match hub.attach(&username, &terminal_id, client_key.clone()) {
        Ok(attached) => attached,
        Err(e) => {
            warn!("attach failed for {username}/{terminal_id}: {e}");
            let _ = socket
                .send(Message::Binary(format!("{e}\r\n").into_bytes().into()))
                .await;
            return;
        }
    };
    let AttachedClient {
        session,
        replay,
        mut live_rx,
    } = attached;

    // Replay before anything live: the subscription starts exactly where the
    // snapshot ended, so the client sees history, the sentinel, then the
    // stream with no seam.
    if !replay.is_empty() {
        if socket.send(Message::Binary(replay.into())).await.is_err() {
            hub.detach(&session, &client_key);
            return;
        }
        if socket
            .send(Message::Binary(HISTORY_SENTINEL.into()))
            .await
            .is_err()
        {
            hub.detach(&session, &client_key);
            return;
        }
    }

    let (direct_tx, mut direct_rx) = mpsc::channel::<Frame>(DIRECT_QUEUE_CAP);
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: the live broadcast plus this client's direct replies. A client
    // that lags the broadcast is cut off rather than handed a stream with a
    // hole in it; the scroll-back replay on its next attach catches it up.
    let writer_key = client_key.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                live = live_rx.recv() => match live {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("client {writer_key} lagged {missed} frames behind; disconnecting so replay can catch it up");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                direct = direct_rx.recv() => match direct {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let message = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(bytes) => Message::Binary(bytes),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    client_pump(&hub, &session, &mut ws_rx, &direct_tx, &client_key).await;

    drop(direct_tx);
    let _ = writer.await;
}

/// Read framed messages until the client goes away, asks to close, or the
/// session is torn down under it.
async fn client_pump(
    hub: &Arc<Hub>,
    session: &Arc<Session>,
    ws_rx: &mut SplitStream<WebSocket>,
    direct_tx: &mpsc::Sender<Frame>,
    client_key: &str,
) {
    loop {
        let received = tokio::select! {
            _ = session.done().cancelled() => break,
            received = tokio::time::timeout(CLIENT_READ_TIMEOUT, ws_rx.next()) => received,
        };
        let message = match received {
            Err(_) => continue, // read deadline; re-arm
            Ok(None) => {
                hub.detach(session, client_key);
                break;
            }
            Ok(Some(Err(e))) => {
                info!("client {client_key} read error on session {}: {e}", session.id);
                hub.detach(session, client_key);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match protocol::parse_text_frame(text.as_str()) {
                ClientFrame::Resize { cols, rows } => {
                    // Applied before any later input byte from this client.
                    session.resize(cols, rows).await;
                }
                ClientFrame::Heartbeat => {
                    session.touch();
                    tokio::time::sleep(HEARTBEAT_REPLY_DELAY).await;
                    if direct_tx
                        .try_send(Frame::Text(protocol::heartbeat_reply(&session.id)))
                        .is_err()
                    {
                        warn!("failed to queue heartbeat reply for client {client_key}");
                    }
                }
                ClientFrame::Close => {
                    info!("client {client_key} requested close of session {}", session.id);
                    hub.close_client(session, client_key);
                    break;
                }
                ClientFrame::Input(bytes) => session.write_input(bytes).await,
                ClientFrame::Invalid { kind, reason } => {
                    warn!("rejecting malformed {kind} frame from client {client_key}: {reason}");
                }
            },
            Message::Binary(bytes) => session.write_input(bytes.to_vec()).await,
            Message::Close(_) => {
                hub.detach(session, client_key);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
        session.touch();
    }
}
