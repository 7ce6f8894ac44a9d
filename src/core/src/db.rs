//! SQLite database: single connection, WAL mode, all tables created on open.
//! Holds user accounts, the IP allow-list, saved commands, and hibernated
//! terminal sessions. Timestamps are unix seconds.

use crate::session::format_timestamp;
use crate::store::{SessionRow, SessionStore, StoreError, StoredSession};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A user-scoped command bookmark.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SavedCommand {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub description: String,
    pub created_at: String,
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database file and ensure all tables exist.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("db mutex")
    }

    // ── users ───────────────────────────────────────────────────────

    pub fn add_user(&self, username: &str, password: &str) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT INTO users (username, password) VALUES (?1, ?2)",
            params![username, password],
        )?;
        Ok(())
    }

    pub fn validate_user(&self, username: &str, password: &str) -> bool {
        let stored: Option<String> = self
            .conn()
            .query_row(
                "SELECT password FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);
        stored.is_some_and(|p| p == password)
    }

    pub fn all_users(&self) -> rusqlite::Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT username, password FROM users ORDER BY username")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    // ── IP allow-list ───────────────────────────────────────────────

    /// Add an address; a duplicate just refreshes the description.
    pub fn add_allowed_ip(&self, ip: &str, description: &str) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT INTO ip_allowlist (ip, description) VALUES (?1, ?2)
             ON CONFLICT(ip) DO UPDATE SET description = excluded.description",
            params![ip, description],
        )?;
        Ok(())
    }

    /// An empty allow-list admits everyone.
    pub fn is_ip_allowed(&self, ip: &str) -> rusqlite::Result<bool> {
        let conn = self.conn();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM ip_allowlist", [], |row| row.get(0))?;
        if total == 0 {
            return Ok(true);
        }
        let hits: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ip_allowlist WHERE ip = ?1",
            params![ip],
            |row| row.get(0),
        )?;
        Ok(hits > 0)
    }

    // ── saved commands ──────────────────────────────────────────────

    pub fn commands_for_user(&self, username: &str) -> rusqlite::Result<Vec<SavedCommand>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, command, description, created_at
             FROM saved_commands WHERE username = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![username], |row| {
            Ok(SavedCommand {
                id: row.get(0)?,
                name: row.get(1)?,
                command: row.get(2)?,
                description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                created_at: format_timestamp(row.get::<_, i64>(4)? as u64),
            })
        })?;
        rows.collect()
    }

    pub fn add_command(
        &self,
        username: &str,
        name: &str,
        command: &str,
        description: &str,
    ) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT INTO saved_commands (username, name, command, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, name, command, description],
        )?;
        Ok(())
    }

    /// Returns false when the named command does not belong to the user.
    pub fn update_command(
        &self,
        username: &str,
        name: &str,
        command: &str,
        description: &str,
    ) -> rusqlite::Result<bool> {
        let changed = self.conn().execute(
            "UPDATE saved_commands SET command = ?3, description = ?4
             WHERE username = ?1 AND name = ?2",
            params![username, name, command, description],
        )?;
        Ok(changed > 0)
    }

    /// Returns false when the named command does not belong to the user.
    pub fn delete_command(&self, username: &str, name: &str) -> rusqlite::Result<bool> {
        let changed = self.conn().execute(
            "DELETE FROM saved_commands WHERE username = ?1 AND name = ?2",
            params![username, name],
        )?;
        Ok(changed > 0)
    }
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            username    TEXT UNIQUE NOT NULL,
            password    TEXT NOT NULL,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        CREATE TABLE IF NOT EXISTS ip_allowlist (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            ip          TEXT UNIQUE NOT NULL,
            description TEXT,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );

        CREATE TABLE IF NOT EXISTS saved_commands (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            username    TEXT NOT NULL,
            name        TEXT NOT NULL,
            command     TEXT NOT NULL,
            description TEXT,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now')),
            UNIQUE(username, name)
        );

        CREATE TABLE IF NOT EXISTS terminal_sessions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            terminal_id TEXT NOT NULL,
            username    TEXT NOT NULL,
            buffer      BLOB,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now')),
            last_active INTEGER NOT NULL DEFAULT (strftime('%s','now')),
            active      INTEGER NOT NULL DEFAULT 1,
            UNIQUE(username, terminal_id)
        );
        ",
    )
}

impl SessionStore for Db {
    fn save(&self, owner: &str, terminal_id: &str, buffer: &[u8]) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO terminal_sessions (username, terminal_id, buffer)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(username, terminal_id) DO UPDATE SET
                 buffer = excluded.buffer,
                 last_active = strftime('%s','now'),
                 active = 1",
            params![owner, terminal_id, buffer],
        )?;
        Ok(())
    }

    fn load(&self, owner: &str, terminal_id: &str) -> Result<Option<StoredSession>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT buffer, active FROM terminal_sessions
                 WHERE username = ?1 AND terminal_id = ?2",
                params![owner, terminal_id],
                |row| {
                    Ok(StoredSession {
                        buffer: row.get::<_, Option<Vec<u8>>>(0)?.unwrap_or_default(),
                        active: row.get::<_, i64>(1)? == 1,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn set_active(&self, owner: &str, terminal_id: &str, active: bool) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE terminal_sessions SET active = ?3, last_active = strftime('%s','now')
             WHERE username = ?1 AND terminal_id = ?2",
            params![owner, terminal_id, i64::from(active)],
        )?;
        Ok(())
    }

    fn delete(&self, owner: &str, terminal_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM terminal_sessions WHERE username = ?1 AND terminal_id = ?2",
            params![owner, terminal_id],
        )?;
        Ok(())
    }

    fn vacuum(&self, older_than_days: u32) -> Result<u64, StoreError> {
        let purged = self.conn().execute(
            "DELETE FROM terminal_sessions
             WHERE active = 0 AND last_active < strftime('%s','now') - ?1 * 86400",
            params![i64::from(older_than_days)],
        )?;
        Ok(purged as u64)
    }

    fn list(&self, owner: &str) -> Result<Vec<SessionRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT terminal_id, created_at, last_active, active
             FROM terminal_sessions WHERE username = ?1 ORDER BY last_active DESC",
        )?;
        let rows = stmt.query_map(params![owner], |row| {
            Ok(SessionRow {
                terminal_id: row.get(0)?,
                created_at: row.get::<_, i64>(1)? as u64,
                last_active: row.get::<_, i64>(2)? as u64,
                active: row.get::<_, i64>(3)? == 1,
            })
        })?;
        let rows: Result<Vec<_>, _> = rows.collect();
        Ok(rows?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backdate(db: &Db, owner: &str, terminal_id: &str, secs_ago: i64) {
        db.conn()
            .execute(
                "UPDATE terminal_sessions SET last_active = strftime('%s','now') - ?3
                 WHERE username = ?1 AND terminal_id = ?2",
                params![owner, terminal_id, secs_ago],
            )
            .unwrap();
    }

    #[test]
    fn users_validate_against_stored_credentials() {
        let db = Db::open_in_memory().unwrap();
        db.add_user("alice", "s3cret").unwrap();
        assert!(db.validate_user("alice", "s3cret"));
        assert!(!db.validate_user("alice", "wrong"));
        assert!(!db.validate_user("bob", "s3cret"));
        assert!(db.add_user("alice", "other").is_err());
        assert_eq!(db.all_users().unwrap().len(), 1);
    }

    #[test]
    fn empty_allowlist_admits_everyone() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.is_ip_allowed("203.0.113.9").unwrap());
        db.add_allowed_ip("192.0.2.1", "office").unwrap();
        assert!(db.is_ip_allowed("192.0.2.1").unwrap());
        assert!(!db.is_ip_allowed("203.0.113.9").unwrap());
        // Re-adding refreshes the description instead of failing.
        db.add_allowed_ip("192.0.2.1", "office, renamed").unwrap();
    }

    #[test]
    fn saved_commands_crud() {
        let db = Db::open_in_memory().unwrap();
        db.add_command("alice", "deploy", "make deploy", "ship it").unwrap();
        assert!(db.add_command("alice", "deploy", "x", "").is_err());

        let cmds = db.commands_for_user("alice").unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].command, "make deploy");

        assert!(db.update_command("alice", "deploy", "make deploy -e prod", "").unwrap());
        assert!(!db.update_command("alice", "missing", "x", "").unwrap());
        assert!(!db.update_command("bob", "deploy", "x", "").unwrap());

        assert!(db.delete_command("alice", "deploy").unwrap());
        assert!(!db.delete_command("alice", "deploy").unwrap());
        assert!(db.commands_for_user("alice").unwrap().is_empty());
    }

    #[test]
    fn session_rows_round_trip_raw_bytes() {
        let db = Db::open_in_memory().unwrap();
        let payload = vec![0u8, 155, 255, 13, 10, 27];
        db.save("u", "t1", &payload).unwrap();
        let row = db.load("u", "t1").unwrap().expect("row");
        assert_eq!(row.buffer, payload);
        assert!(row.active);

        db.set_active("u", "t1", false).unwrap();
        assert!(!db.load("u", "t1").unwrap().unwrap().active);

        // Saving again reactivates the row.
        db.save("u", "t1", b"more").unwrap();
        assert!(db.load("u", "t1").unwrap().unwrap().active);
    }

    #[test]
    fn delete_is_destructive_and_quiet_on_missing() {
        let db = Db::open_in_memory().unwrap();
        db.save("u", "t1", b"x").unwrap();
        db.delete("u", "t1").unwrap();
        assert!(db.load("u", "t1").unwrap().is_none());
        db.delete("u", "t1").unwrap();
    }

    #[test]
    fn vacuum_purges_only_aged_inactive_rows() {
        let db = Db::open_in_memory().unwrap();
        db.save("u", "old-idle", b"").unwrap();
        db.set_active("u", "old-idle", false).unwrap();
        backdate(&db, "u", "old-idle", 8 * 86_400);

        db.save("u", "old-live", b"").unwrap();
        backdate(&db, "u", "old-live", 8 * 86_400);

        db.save("u", "fresh-idle", b"").unwrap();
        db.set_active("u", "fresh-idle", false).unwrap();

        assert_eq!(db.vacuum(7).unwrap(), 1);
        assert!(db.load("u", "old-idle").unwrap().is_none());
        assert!(db.load("u", "old-live").unwrap().is_some());
        assert!(db.load("u", "fresh-idle").unwrap().is_some());
    }

    #[test]
    fn list_is_per_owner_most_recent_first() {
        let db = Db::open_in_memory().unwrap();
        db.save("u", "a", b"").unwrap();
        backdate(&db, "u", "a", 500);
        db.save("u", "b", b"").unwrap();
        db.save("other", "c", b"").unwrap();

        let rows = db.list("u").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].terminal_id, "b");
        assert_eq!(rows[1].terminal_id, "a");
    }
}
