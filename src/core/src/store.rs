//! Persistence seam for hibernated terminal sessions. The hub only ever talks
//! to this trait; production uses the SQLite-backed [`crate::db::Db`], tests
//! substitute [`MemoryStore`].

use crate::session::unix_now_secs;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Error from the persistence layer. The hub logs these and moves on; a failed
/// hibernate loses scroll-back, never correctness.
#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError(e.to_string())
    }
}

/// A hibernated session loaded for restore.
pub struct StoredSession {
    pub buffer: Vec<u8>,
    pub active: bool,
}

/// One row of the per-owner list view.
pub struct SessionRow {
    pub terminal_id: String,
    pub created_at: u64,
    pub last_active: u64,
    pub active: bool,
}

/// Store of hibernated sessions keyed by `(owner, terminal_id)`. Safe for
/// concurrent use by the pumps, the reaper and the admin API.
pub trait SessionStore: Send + Sync {
    /// Upsert the scroll-back; bumps `last_active` and marks the row active.
    fn save(&self, owner: &str, terminal_id: &str, buffer: &[u8]) -> Result<(), StoreError>;

    /// Load a row for restore; `None` when no such session was ever saved.
    fn load(&self, owner: &str, terminal_id: &str) -> Result<Option<StoredSession>, StoreError>;

    /// Flip the active flag (hibernate / wake), bumping `last_active`.
    fn set_active(&self, owner: &str, terminal_id: &str, active: bool) -> Result<(), StoreError>;

    /// Destructive removal, used by kill. Deleting a missing row is not an error.
    fn delete(&self, owner: &str, terminal_id: &str) -> Result<(), StoreError>;

    /// Purge inactive rows whose `last_active` is older than the threshold.
    /// Returns how many rows went away.
    fn vacuum(&self, older_than_days: u32) -> Result<u64, StoreError>;

    /// All rows for one owner, most recently active first.
    fn list(&self, owner: &str) -> Result<Vec<SessionRow>, StoreError>;
}

#[derive(Clone)]
struct MemoryRow {
    buffer: Vec<u8>,
    created_at: u64,
    last_active: u64,
    active: bool,
}

/// In-memory `SessionStore` for tests.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(String, String), MemoryRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: age a row so vacuum thresholds can be exercised.
    pub fn backdate(&self, owner: &str, terminal_id: &str, last_active: u64) {
        let mut rows = self.rows.lock().expect("memory store mutex");
        if let Some(row) = rows.get_mut(&(owner.to_string(), terminal_id.to_string())) {
            row.last_active = last_active;
        }
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, owner: &str, terminal_id: &str, buffer: &[u8]) -> Result<(), StoreError> {
        let now = unix_now_secs();
        let mut rows = self.rows.lock().expect("memory store mutex");
        rows.entry((owner.to_string(), terminal_id.to_string()))
            .and_modify(|row| {
                row.buffer = buffer.to_vec();
                row.last_active = now;
                row.active = true;
            })
            .or_insert(MemoryRow {
                buffer: buffer.to_vec(),
                created_at: now,
                last_active: now,
                active: true,
            });
        Ok(())
    }

    fn load(&self, owner: &str, terminal_id: &str) -> Result<Option<StoredSession>, StoreError> {
        let rows = self.rows.lock().expect("memory store mutex");
        Ok(rows
            .get(&(owner.to_string(), terminal_id.to_string()))
            .map(|row| StoredSession {
                buffer: row.buffer.clone(),
                active: row.active,
            }))
    }

    fn set_active(&self, owner: &str, terminal_id: &str, active: bool) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("memory store mutex");
        if let Some(row) = rows.get_mut(&(owner.to_string(), terminal_id.to_string())) {
            row.active = active;
            row.last_active = unix_now_secs();
        }
        Ok(())
    }

    fn delete(&self, owner: &str, terminal_id: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("memory store mutex");
        rows.remove(&(owner.to_string(), terminal_id.to_string()));
        Ok(())
    }

    fn vacuum(&self, older_than_days: u32) -> Result<u64, StoreError> {
        let cutoff = unix_now_secs().saturating_sub(u64::from(older_than_days) * 86_400);
        let mut rows = self.rows.lock().expect("memory store mutex");
        let before = rows.len();
        rows.retain(|_, row| row.active || row.last_active >= cutoff);
        Ok((before - rows.len()) as u64)
    }

    fn list(&self, owner: &str) -> Result<Vec<SessionRow>, StoreError> {
        let rows = self.rows.lock().expect("memory store mutex");
        let mut out: Vec<SessionRow> = rows
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|((_, id), row)| SessionRow {
                terminal_id: id.clone(),
                created_at: row.created_at,
                last_active: row.last_active,
                active: row.active,
            })
            .collect();
        out.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(out)
    }
}
