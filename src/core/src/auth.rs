//! Session tokens and per-user run state. Tokens are process-local: issued at
//! login, validated on every API call and WebSocket attach, gone on restart.
//! Also holds the credential generators used by the startup bootstrap.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt::Write as _;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+[]{}|;:,.<>?";

/// What a user is currently running, for the status endpoints.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub is_running: bool,
    pub command: String,
}

/// Token -> username map plus per-user run state.
#[derive(Default)]
pub struct AuthRegistry {
    tokens: DashMap<String, String>,
    states: DashMap<String, RunState>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token for a logged-in user.
    pub fn issue_token(&self, username: &str) -> String {
        let token = generate_token();
        self.tokens.insert(token.clone(), username.to_string());
        token
    }

    /// Resolve a token to its username.
    pub fn validate_token(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|entry| entry.value().clone())
    }

    pub fn run_state(&self, username: &str) -> RunState {
        self.states
            .get(username)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn set_running(&self, username: &str, command: &str) {
        self.states.insert(
            username.to_string(),
            RunState {
                is_running: true,
                command: command.to_string(),
            },
        );
    }

    pub fn clear_running(&self, username: &str) {
        self.states.insert(username.to_string(), RunState::default());
    }
}

/// 32 random bytes, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Random username: one char from each of lower/upper/digit, the rest mixed,
/// shuffled, with an optional prefix.
pub fn generate_username(prefix: &str, len: usize) -> String {
    let len = len.max(4);
    let mut rng = rand::thread_rng();
    let mixed: Vec<u8> = [LOWER, UPPER, DIGITS].concat();
    let mut name = vec![
        LOWER[rng.gen_range(0..LOWER.len())],
        UPPER[rng.gen_range(0..UPPER.len())],
        DIGITS[rng.gen_range(0..DIGITS.len())],
    ];
    while name.len() < len {
        name.push(mixed[rng.gen_range(0..mixed.len())]);
    }
    name.shuffle(&mut rng);
    format!("{prefix}{}", String::from_utf8(name).expect("ascii"))
}

/// Random password containing at least one char of every class.
pub fn generate_password(len: usize) -> String {
    let len = len.max(8);
    let mut rng = rand::thread_rng();
    let all: Vec<u8> = [LOWER, UPPER, DIGITS, SYMBOLS].concat();
    let mut pass = vec![
        LOWER[rng.gen_range(0..LOWER.len())],
        UPPER[rng.gen_range(0..UPPER.len())],
        DIGITS[rng.gen_range(0..DIGITS.len())],
        SYMBOLS[rng.gen_range(0..SYMBOLS.len())],
    ];
    while pass.len() < len {
        pass.push(all[rng.gen_range(0..all.len())]);
    }
    pass.shuffle(&mut rng);
    String::from_utf8(pass).expect("ascii")
}
