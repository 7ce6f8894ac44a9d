//! Shellgate server: axum HTTP + WebSocket over the session core. The terminal
//! hub, database and token registry live in `common`; this crate is the wire.

pub mod config;
pub mod middleware;
pub mod web_server;
pub mod ws;

pub use config::ServerConfig;
pub use web_server::{build_router, run_web_server, AppState};
