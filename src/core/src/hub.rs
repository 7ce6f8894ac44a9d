//! The hub: every live terminal session in one registry, plus the lifecycle
//! operations around it — attach/restore/create, detach, explicit close, the
//! idle reaper and forced kill. Constructed once at startup and threaded into
//! the HTTP handlers; nothing here is process-global.
//!
//! Registry entries always refer to sessions with an open PTY or at least one
//! attached client; teardown hibernates to the store first, then removes the
//! entry, so a racing attach either finds the live session or falls through
//! to the restore path. Reap, close and disconnect never signal the shell
//! process — they close the PTY and the shell sees hangup; the SIGTERM →
//! hard-kill escalation belongs to [`Hub::kill`] alone.

use crate::protocol::Frame;
use crate::pty;
use crate::session::{format_duration, format_timestamp, unix_now_secs, Session};
use crate::store::SessionStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Reaper cadence.
pub const REAP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// A session idle longer than this is hibernated by the reaper.
pub const IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Inactive store rows older than this are purged after each sweep.
pub const VACUUM_AFTER_DAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    owner: String,
    terminal_id: String,
}

impl SessionKey {
    fn new(owner: &str, terminal_id: &str) -> Self {
        Self {
            owner: owner.to_string(),
            terminal_id: terminal_id.to_string(),
        }
    }

    fn of(session: &Session) -> Self {
        Self::new(&session.owner, &session.id)
    }
}

/// Attach failed because the shell could not be spawned.
#[derive(Debug)]
pub struct AttachError(pub String);

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to start terminal: {}", self.0)
    }
}

/// Why a kill request was not a clean success.
#[derive(Debug)]
pub enum KillError {
    NotFound,
    Signal(io::Error),
}

impl fmt::Display for KillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillError::NotFound => write!(f, "terminal session does not exist"),
            KillError::Signal(e) => write!(f, "failed to terminate process: {e}"),
        }
    }
}

/// What a successful attach hands the transport: the session, the scroll-back
/// replay snapshotted at the attach boundary, and the live output
/// subscription that starts exactly there.
pub struct AttachedClient {
    pub session: Arc<Session>,
    pub replay: Vec<u8>,
    pub live_rx: broadcast::Receiver<Frame>,
}

/// One row of the merged live + hibernated list view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TerminalListItem {
    pub terminal_id: String,
    pub created_at: String,
    pub last_active: String,
    pub active: bool,
    pub age: String,
    pub duration: String,
    #[serde(skip)]
    last_active_secs: u64,
}

impl TerminalListItem {
    fn new(terminal_id: String, created: u64, last: u64, active: bool, now: u64) -> Self {
        Self {
            terminal_id,
            created_at: format_timestamp(created),
            last_active: format_timestamp(last),
            active,
            age: format_duration(now.saturating_sub(last)),
            duration: format_duration(last.saturating_sub(created)),
            last_active_secs: last,
        }
    }
}

/// Mint a terminal id for attaches that did not bring one:
/// monotonic nanos plus a random suffix, matching what frontends generate.
pub fn mint_terminal_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}_{}", nanos, rand::thread_rng().gen_range(0..10_000))
}

/// Registry of live sessions plus the persistence adapter behind them.
pub struct Hub {
    registry: DashMap<SessionKey, Arc<Session>>,
    store: Arc<dyn SessionStore>,
}

impl Hub {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            registry: DashMap::new(),
            store,
        }
    }

    /// Read-only lookup, mostly for tests and the admin surface.
    pub fn get(&self, owner: &str, terminal_id: &str) -> Option<Arc<Session>> {
        self.registry
            .get(&SessionKey::new(owner, terminal_id))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Attach a client to `(owner, terminal_id)`, creating or restoring the
    /// session as needed.
    pub fn attach(
        self: &Arc<Self>,
        owner: &str,
        terminal_id: &str,
        client_key: String,
    ) -> Result<AttachedClient, AttachError> {
        let key = SessionKey::new(owner, terminal_id);

        if let Some(existing) = self.registry.get(&key).map(|e| Arc::clone(e.value())) {
            if existing.pty_open() {
                let (replay, live_rx) = existing.attach_client(client_key.clone());
                existing.touch();
                info!(
                    "client {client_key} attached to session {terminal_id} ({} clients)",
                    existing.client_count()
                );
                return Ok(AttachedClient {
                    session: existing,
                    replay,
                    live_rx,
                });
            }
            // Shell already gone; drop the husk and fall through to restore.
            self.registry.remove(&key);
        }

        // A stored row restores the scroll-back whether or not it was cleanly
        // hibernated; the active flag only matters to vacuum.
        let seed = match self.store.load(owner, terminal_id) {
            Ok(Some(stored)) => {
                info!("restoring terminal session {terminal_id} for user {owner}");
                stored.buffer
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("failed to load stored session {owner}/{terminal_id}: {e}");
                Vec::new()
            }
        };

        let (bridge, out_rx) = pty::spawn_shell().map_err(|e| AttachError(e.to_string()))?;
        let session = Arc::new(Session::new(owner, terminal_id, seed, bridge));

        match self.registry.entry(key) {
            Entry::Occupied(entry) => {
                // Lost a concurrent create: first caller wins, our
                // speculative PTY is discarded.
                let winner = Arc::clone(entry.get());
                drop(entry);
                session.terminate();
                let (replay, live_rx) = winner.attach_client(client_key);
                winner.touch();
                Ok(AttachedClient {
                    session: winner,
                    replay,
                    live_rx,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                let (replay, live_rx) = session.attach_client(client_key.clone());
                self.spawn_output_pump(Arc::clone(&session), out_rx);
                info!("client {client_key} opened terminal session {terminal_id} for user {owner}");
                Ok(AttachedClient {
                    session,
                    replay,
                    live_rx,
                })
            }
        }
    }

    /// PTY pump: shell output -> scroll-back -> base64 broadcast. EOF means
    /// the shell exited; the session hibernates and leaves the registry.
    fn spawn_output_pump(self: &Arc<Self>, session: Arc<Session>, mut rx: mpsc::Receiver<Vec<u8>>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.done().cancelled() => return,
                    chunk = rx.recv() => match chunk {
                        Some(data) => {
                            session.touch();
                            session.broadcast_output(&data);
                        }
                        None => break,
                    },
                }
            }
            // EOF can race with a deliberate teardown (kill already deleted
            // the row); only a natural shell exit hibernates.
            if session.done().is_cancelled() {
                return;
            }
            info!("pty closed, hibernating session {} for user {}", session.id, session.owner);
            hub.hibernate_and_remove(&session);
        });
    }

    /// Hibernate to the store, then remove and tear down. Store failures are
    /// logged; in-memory teardown always completes.
    fn hibernate_and_remove(&self, session: &Arc<Session>) {
        let snapshot = session.snapshot();
        if let Err(e) = self.store.save(&session.owner, &session.id, &snapshot) {
            warn!("failed to hibernate session {}: {e}", session.id);
        }
        if let Err(e) = self.store.set_active(&session.owner, &session.id, false) {
            warn!("failed to mark session {} inactive: {e}", session.id);
        }
        self.registry.remove(&SessionKey::of(session));
        session.terminate();
    }

    /// A client's channel died (or ended). The shell keeps running; when the
    /// last client leaves, the scroll-back is persisted so a later crash
    /// cannot lose it.
    pub fn detach(&self, session: &Arc<Session>, client_key: &str) {
        let Some(remaining) = session.detach_client(client_key) else {
            return;
        };
        info!(
            "client {client_key} disconnected from session {} ({remaining} clients remaining)",
            session.id
        );
        if remaining == 0 {
            let snapshot = session.snapshot();
            if let Err(e) = self.store.save(&session.owner, &session.id, &snapshot) {
                warn!("failed to save session {} on disconnect: {e}", session.id);
            }
        }
    }

    /// A client asked to close. When it was the last one the session ends:
    /// scroll-back saved, row marked inactive, entry removed, PTY closed. The
    /// shell is hung up, not signalled.
    pub fn close_client(&self, session: &Arc<Session>, client_key: &str) {
        let Some(remaining) = session.detach_client(client_key) else {
            return;
        };
        info!(
            "client {client_key} closed session {} ({remaining} clients remaining)",
            session.id
        );
        if remaining > 0 {
            return;
        }

        let snapshot = session.snapshot();
        if let Err(e) = self.store.save(&session.owner, &session.id, &snapshot) {
            warn!("failed to save session {} on close: {e}", session.id);
        }
        if let Err(e) = self.store.set_active(&session.owner, &session.id, false) {
            warn!("failed to mark session {} inactive: {e}", session.id);
        }
        self.registry.remove(&SessionKey::of(session));
        session.terminate();
    }

    /// Forced kill from the admin API. Destructive: the persistence row is
    /// deleted, so a later attach with the same id starts fresh. This is the
    /// one path that signals the shell (SIGTERM, then the hard kill);
    /// teardown proceeds even when signalling fails, and that failure is
    /// returned.
    pub fn kill(&self, owner: &str, terminal_id: &str) -> Result<(), KillError> {
        let key = SessionKey::new(owner, terminal_id);
        let session = self
            .registry
            .get(&key)
            .map(|e| Arc::clone(e.value()))
            .ok_or(KillError::NotFound)?;

        let signalled = session.signal_terminate();
        if let Err(e) = self.store.delete(owner, terminal_id) {
            warn!("failed to delete stored session {owner}/{terminal_id}: {e}");
        }
        self.registry.remove(&key);
        session.terminate();
        info!("killed terminal session {terminal_id} for user {owner}");
        signalled.map_err(KillError::Signal)
    }

    /// One reaper sweep: hibernate idle sessions, then vacuum the store.
    pub fn reap_idle(&self) {
        let now = unix_now_secs();
        let mut idle = Vec::new();
        for entry in self.registry.iter() {
            if now.saturating_sub(entry.value().last_active_secs()) > IDLE_TIMEOUT_SECS {
                idle.push(Arc::clone(entry.value()));
            }
        }
        for session in idle {
            info!("reaping idle terminal session {} for user {}", session.id, session.owner);
            self.hibernate_and_remove(&session);
        }
        match self.store.vacuum(VACUUM_AFTER_DAYS) {
            Ok(0) => {}
            Ok(purged) => info!("purged {purged} hibernated sessions older than {VACUUM_AFTER_DAYS} days"),
            Err(e) => warn!("session store vacuum failed: {e}"),
        }
    }

    /// Run the reaper on its fixed cadence for the life of the process.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.tick().await; // the first tick is immediate
            loop {
                ticker.tick().await;
                hub.reap_idle();
            }
        });
    }

    /// Merged view of hibernated rows and live sessions for one owner, most
    /// recently active first. A live session wins over its own stored row.
    pub fn list(&self, owner: &str) -> Vec<TerminalListItem> {
        let now = unix_now_secs();
        let mut items: Vec<TerminalListItem> = match self.store.list(owner) {
            Ok(rows) => rows
                .into_iter()
                .map(|r| TerminalListItem::new(r.terminal_id, r.created_at, r.last_active, r.active, now))
                .collect(),
            Err(e) => {
                warn!("failed to list stored sessions for {owner}: {e}");
                Vec::new()
            }
        };

        for entry in self.registry.iter() {
            if entry.key().owner != owner {
                continue;
            }
            let session = entry.value();
            let live = TerminalListItem::new(
                session.id.clone(),
                session.created_at_secs(),
                session.last_active_secs(),
                true,
                now,
            );
            match items.iter_mut().find(|i| i.terminal_id == live.terminal_id) {
                Some(slot) => *slot = live,
                None => items.push(live),
            }
        }

        items.sort_by(|a, b| b.last_active_secs.cmp(&a.last_active_secs));
        items
    }
}
