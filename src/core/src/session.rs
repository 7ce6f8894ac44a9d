//! Terminal session state: the bounded scroll-back ring, the per-session
//! client set, and the session record shared by the PTY and client pumps.
//!
//! Locking order inside a session is state → clients → scroll-back; no lock
//! is held across PTY or network I/O. Live output fans out on a broadcast
//! channel that evicts oldest-first: a subscriber that falls behind is told it
//! lagged instead of silently losing bytes mid-stream, and the scroll-back
//! replay on re-attach is its recovery. The scroll-back, not a per-client
//! queue, is the buffer of record.

use crate::protocol::{self, Frame};
use crate::pty::PtyBridge;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Scroll-back capacity per session. New output evicts the oldest bytes.
pub const SCROLLBACK_CAP_BYTES: usize = 100 * 1024;

/// Live output broadcast capacity (frames buffered per lagging subscriber
/// before the channel evicts oldest and signals the lag).
pub const LIVE_BROADCAST_CAP: usize = 256;

/// Fixed-capacity scroll-back of raw PTY output. Appends never fail; when over
/// capacity the oldest bytes are dropped. One writer (the PTY pump), any
/// number of readers (attach replay).
pub struct ScrollbackBuffer {
    data: Mutex<Vec<u8>>,
    cap: usize,
}

impl ScrollbackBuffer {
    pub fn new() -> Self {
        Self::with_contents(Vec::new())
    }

    /// Seed from a hibernated row. Oversized seeds keep only the tail.
    pub fn with_contents(mut seed: Vec<u8>) -> Self {
        if seed.len() > SCROLLBACK_CAP_BYTES {
            seed.drain(..seed.len() - SCROLLBACK_CAP_BYTES);
        }
        Self {
            data: Mutex::new(seed),
            cap: SCROLLBACK_CAP_BYTES,
        }
    }

    /// Append bytes; if over capacity, drop oldest.
    pub fn push(&self, bytes: &[u8]) {
        let mut g = self.data.lock().expect("scrollback mutex");
        g.extend_from_slice(bytes);
        if g.len() > self.cap {
            let excess = g.len() - self.cap;
            g.drain(..excess);
        }
    }

    /// Copy of current contents, for replay to a newly attached client.
    pub fn dump(&self) -> Vec<u8> {
        self.data.lock().expect("scrollback mutex").clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().expect("scrollback mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// One shell session: the PTY, the set of attached clients, the scroll-back
/// and the activity clock. Shared as `Arc<Session>` between the hub, the PTY
/// pump and every client pump; `done` wakes all of them on teardown.
pub struct Session {
    pub owner: String,
    pub id: String,
    created_at: u64,
    last_active: AtomicU64,
    pty: Mutex<Option<Arc<PtyBridge>>>,
    clients: Mutex<HashSet<String>>,
    buffer: ScrollbackBuffer,
    live_tx: broadcast::Sender<Frame>,
    done: CancellationToken,
}

impl Session {
    pub fn new(owner: &str, id: &str, seed: Vec<u8>, bridge: PtyBridge) -> Self {
        let now = unix_now_secs();
        let (live_tx, _) = broadcast::channel(LIVE_BROADCAST_CAP);
        Self {
            owner: owner.to_string(),
            id: id.to_string(),
            created_at: now,
            last_active: AtomicU64::new(now),
            pty: Mutex::new(Some(Arc::new(bridge))),
            clients: Mutex::new(HashSet::new()),
            buffer: ScrollbackBuffer::with_contents(seed),
            live_tx,
            done: CancellationToken::new(),
        }
    }

    /// Fired once when the session terminates; pumps select on this.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub fn created_at_secs(&self) -> u64 {
        self.created_at
    }

    pub fn last_active_secs(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Advance the activity clock. Monotone: a stale wall clock never moves it
    /// backwards.
    pub fn touch(&self) {
        self.last_active.fetch_max(unix_now_secs(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn force_last_active(&self, secs: u64) {
        self.last_active.store(secs, Ordering::Relaxed);
    }

    pub fn pty_open(&self) -> bool {
        self.pty.lock().expect("pty mutex").is_some()
    }

    fn bridge(&self) -> Option<Arc<PtyBridge>> {
        self.pty.lock().expect("pty mutex").clone()
    }

    /// Register a client. The replay snapshot and the live subscription are
    /// taken under the same lock `broadcast_output` holds, so the boundary is
    /// exact: every byte is either in the replay or on the subscription,
    /// never both and never neither.
    pub fn attach_client(&self, key: String) -> (Vec<u8>, broadcast::Receiver<Frame>) {
        let mut clients = self.clients.lock().expect("clients mutex");
        let replay = self.buffer.dump();
        let live_rx = self.live_tx.subscribe();
        clients.insert(key);
        (replay, live_rx)
    }

    /// Remove a client. Returns the remaining client count, or None if the key
    /// was not attached (a second detach of the same client is a no-op).
    pub fn detach_client(&self, key: &str) -> Option<usize> {
        let mut clients = self.clients.lock().expect("clients mutex");
        if !clients.remove(key) {
            return None;
        }
        Some(clients.len())
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("clients mutex").len()
    }

    /// Append shell output to the scroll-back and fan it out to every
    /// subscriber as one `output` envelope. The channel evicts oldest frames
    /// for a subscriber that falls behind and signals the lag; what a client
    /// actually receives is always a contiguous run, never a stream with a
    /// hole in the middle.
    pub fn broadcast_output(&self, data: &[u8]) {
        let _clients = self.clients.lock().expect("clients mutex");
        self.buffer.push(data);
        let _ = self
            .live_tx
            .send(Frame::Text(protocol::output_message(&self.id, data)));
    }

    /// Copy of the scroll-back, for replay or hibernation.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.dump()
    }

    /// Write client input to the shell. No-op once the PTY is gone.
    pub async fn write_input(&self, data: Vec<u8>) {
        let Some(bridge) = self.bridge() else { return };
        let id = self.id.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Err(e) = bridge.write_all(&data) {
                warn!("failed to write to pty for session {id}: {e}");
            }
        })
        .await;
    }

    /// Apply a window resize. Completes before the caller's next input write.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let Some(bridge) = self.bridge() else { return };
        let id = self.id.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Err(e) = bridge.resize(cols, rows) {
                warn!("failed to resize pty for session {id}: {e}");
            }
        })
        .await;
    }

    /// SIGTERM the shell, hard-killing if that fails. Only the forced admin
    /// kill escalates this far; every other teardown goes through
    /// [`Session::terminate`] alone. Ok when the PTY is already gone.
    pub fn signal_terminate(&self) -> io::Result<()> {
        match self.bridge() {
            Some(bridge) => bridge.signal_terminate(),
            None => Ok(()),
        }
    }

    /// Tear down: fire `done`, drop every client, close the PTY. The shell is
    /// not signalled; it sees hangup when the master side closes, the same as
    /// a real terminal going away. `done` fires first so the pumps see a
    /// deliberate teardown, not a natural shell exit. Safe to call twice.
    pub fn terminate(&self) {
        self.done.cancel();
        self.clients.lock().expect("clients mutex").clear();
        drop(self.pty.lock().expect("pty mutex").take());
    }
}

/// Unix timestamp for "now" (seconds).
pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `YYYY-MM-DD HH:MM:SS` (UTC) for list views.
pub fn format_timestamp(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Compact `XhYmZs` rendering of a span in seconds.
pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

// Civil date from days since the epoch, per Howard Hinnant's algorithm.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::spawn_shell;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use tokio::sync::broadcast::error::TryRecvError;

    fn decode_output(frame: Frame) -> Vec<u8> {
        let text = frame.as_text().expect("live output frames are text");
        let v: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(v["type"], "output");
        BASE64.decode(v["data"].as_str().unwrap()).unwrap()
    }

    #[test]
    fn scrollback_keeps_everything_under_capacity() {
        let buf = ScrollbackBuffer::new();
        buf.push(b"hello ");
        buf.push(b"world");
        assert_eq!(buf.dump(), b"hello world");
    }

    #[test]
    fn scrollback_evicts_oldest_first() {
        let buf = ScrollbackBuffer::new();
        // 150 KiB of distinct positions: byte i is (i % 251) so boundaries are checkable.
        let total = 150 * 1024;
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(4096) {
            buf.push(chunk);
        }
        let snap = buf.dump();
        assert_eq!(snap.len(), SCROLLBACK_CAP_BYTES);
        // The replay must start exactly where eviction stopped: offset total - cap.
        let start = total - SCROLLBACK_CAP_BYTES;
        assert_eq!(snap[0], (start % 251) as u8);
        assert_eq!(*snap.last().unwrap(), ((total - 1) % 251) as u8);
        assert_eq!(snap, &data[start..]);
    }

    #[test]
    fn scrollback_single_oversized_push_keeps_tail() {
        let buf = ScrollbackBuffer::new();
        let data: Vec<u8> = (0..SCROLLBACK_CAP_BYTES + 10).map(|i| (i % 256) as u8).collect();
        buf.push(&data);
        let snap = buf.dump();
        assert_eq!(snap.len(), SCROLLBACK_CAP_BYTES);
        assert_eq!(snap, &data[10..]);
    }

    #[test]
    fn scrollback_snapshot_is_suffix_of_appends() {
        let buf = ScrollbackBuffer::new();
        buf.push(b"abc");
        let first = buf.dump();
        assert_eq!(first, b"abc");
        buf.push(b"def");
        let second = buf.dump();
        assert!(b"abcdef".ends_with(&second[..]));
        assert_eq!(second, b"abcdef");
    }

    #[test]
    fn seeded_scrollback_truncates_to_tail() {
        let seed: Vec<u8> = vec![7u8; SCROLLBACK_CAP_BYTES + 5];
        let buf = ScrollbackBuffer::with_contents(seed);
        assert_eq!(buf.len(), SCROLLBACK_CAP_BYTES);
    }

    #[tokio::test]
    async fn fanout_replays_history_before_live_output() {
        let (bridge, _rx) = spawn_shell().expect("spawn shell");
        let session = Session::new("u", "s1", Vec::new(), bridge);

        let (replay_a, mut rx_a) = session.attach_client("a".into());
        assert!(replay_a.is_empty());

        session.broadcast_output(b"abc");
        session.broadcast_output(b"def");

        // B attaches later: the replay carries "abcdef"; its subscription
        // starts exactly at the boundary, with no duplicate and no gap.
        let (replay_b, mut rx_b) = session.attach_client("b".into());
        assert_eq!(replay_b, b"abcdef");
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));

        session.broadcast_output(b"ghi");

        assert_eq!(decode_output(rx_a.try_recv().unwrap()), b"abc");
        assert_eq!(decode_output(rx_a.try_recv().unwrap()), b"def");
        assert_eq!(decode_output(rx_a.try_recv().unwrap()), b"ghi");
        assert_eq!(decode_output(rx_b.try_recv().unwrap()), b"ghi");

        session.terminate();
    }

    #[tokio::test]
    async fn lagging_subscriber_is_signalled_not_given_a_gap() {
        let (bridge, _rx) = spawn_shell().expect("spawn shell");
        let session = Session::new("u", "s2", Vec::new(), bridge);
        let (_, mut live_rx) = session.attach_client("a".into());

        for i in 0..LIVE_BROADCAST_CAP + 16 {
            session.broadcast_output(format!("chunk {i}").as_bytes());
        }

        // The channel evicted oldest frames and says so; the next frame read
        // after the lag is the oldest retained one, so everything received is
        // contiguous from there on.
        let Err(TryRecvError::Lagged(missed)) = live_rx.try_recv() else {
            panic!("expected a lag signal");
        };
        assert_eq!(missed as usize, 16);
        let first_retained = decode_output(live_rx.try_recv().unwrap());
        assert_eq!(first_retained, format!("chunk {}", 16).as_bytes());

        session.terminate();
    }

    #[tokio::test]
    async fn empty_scrollback_attach_gets_no_replay() {
        let (bridge, _rx) = spawn_shell().expect("spawn shell");
        let session = Session::new("u", "s3", Vec::new(), bridge);
        let (replay, mut live_rx) = session.attach_client("a".into());
        assert!(replay.is_empty());
        assert!(matches!(live_rx.try_recv(), Err(TryRecvError::Empty)));
        session.terminate();
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let (bridge, _rx) = spawn_shell().expect("spawn shell");
        let session = Session::new("u", "s4", Vec::new(), bridge);
        let _ = session.attach_client("a".into());
        assert_eq!(session.detach_client("a"), Some(0));
        assert_eq!(session.detach_client("a"), None);
        session.terminate();
    }

    #[tokio::test]
    async fn terminate_fires_done_and_clears_state() {
        let (bridge, _rx) = spawn_shell().expect("spawn shell");
        let session = Session::new("u", "s5", Vec::new(), bridge);
        let _ = session.attach_client("a".into());
        assert!(session.pty_open());
        session.terminate();
        assert!(!session.pty_open());
        assert_eq!(session.client_count(), 0);
        assert!(session.done().is_cancelled());
        // Safe to call again.
        session.terminate();
    }

    #[test]
    fn touch_never_moves_backwards() {
        let clock = AtomicU64::new(100);
        clock.fetch_max(90, Ordering::Relaxed);
        assert_eq!(clock.load(Ordering::Relaxed), 100);
        clock.fetch_max(110, Ordering::Relaxed);
        assert_eq!(clock.load(Ordering::Relaxed), 110);
    }

    #[test]
    fn timestamps_render_as_utc_datetime() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_700_000_000), "2023-11-14 22:13:20");
    }

    #[test]
    fn durations_render_compactly() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m5s");
        assert_eq!(format_duration(3 * 3600 + 62), "3h1m2s");
    }
}
