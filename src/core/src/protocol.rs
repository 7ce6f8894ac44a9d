//! WebSocket wire format. Text frames carry JSON envelopes tagged by `type`;
//! binary frames are raw PTY bytes. Text that is not a recognized control
//! envelope is treated as raw terminal input, matching what xterm-style
//! frontends send.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

/// Marks the boundary between replayed scroll-back and live output.
pub const HISTORY_SENTINEL: &[u8] = b"\r\n--- History ends, new session begins ---\r\n";

/// An outbound frame queued for one client.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Frame::Binary(b) => Some(b),
            Frame::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(t) => Some(t),
            Frame::Binary(_) => None,
        }
    }
}

/// A parsed inbound text frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Resize { cols: u16, rows: u16 },
    Heartbeat,
    Close,
    /// Anything that is not a control envelope: written to the PTY as-is.
    Input(Vec<u8>),
    /// A recognized control type whose payload did not match its schema.
    Invalid { kind: String, reason: &'static str },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "terminalId")]
    #[allow(dead_code)]
    terminal_id: Option<String>,
    data: Option<Value>,
}

#[derive(Deserialize)]
struct ResizeData {
    cols: u16,
    rows: u16,
}

/// Classify one inbound text frame. Non-JSON text and unknown `type` values
/// fall through as raw input; a known `type` with a malformed payload is
/// rejected rather than typed into the shell.
pub fn parse_text_frame(text: &str) -> ClientFrame {
    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        return ClientFrame::Input(text.as_bytes().to_vec());
    };
    match envelope.kind.as_str() {
        "resize" => match envelope
            .data
            .and_then(|d| serde_json::from_value::<ResizeData>(d).ok())
        {
            Some(r) => ClientFrame::Resize {
                cols: r.cols,
                rows: r.rows,
            },
            None => ClientFrame::Invalid {
                kind: "resize".to_string(),
                reason: "data must be {cols, rows}",
            },
        },
        "heartbeat" => ClientFrame::Heartbeat,
        "close" => ClientFrame::Close,
        _ => ClientFrame::Input(text.as_bytes().to_vec()),
    }
}

/// `welcome` greeting, the first framed message a client receives.
pub fn welcome_message(terminal_id: &str) -> String {
    json!({
        "type": "welcome",
        "terminalId": terminal_id,
        "data": "Terminal connected\r\n",
    })
    .to_string()
}

/// `auth` envelope confirming the attach and carrying the assigned id.
pub fn auth_ok_message(terminal_id: &str) -> String {
    json!({
        "type": "auth",
        "terminalId": terminal_id,
        "success": true,
    })
    .to_string()
}

/// `heartbeat` reply.
pub fn heartbeat_reply(terminal_id: &str) -> String {
    json!({
        "type": "heartbeat",
        "terminalId": terminal_id,
        "data": "pong",
    })
    .to_string()
}

/// Live PTY output: raw bytes base64-wrapped in an `output` envelope.
pub fn output_message(terminal_id: &str, data: &[u8]) -> String {
    json!({
        "type": "output",
        "terminalId": terminal_id,
        "data": BASE64.encode(data),
    })
    .to_string()
}
