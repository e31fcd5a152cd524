//! SQLite persistence for the fleet
//!
//! A single [`Store`] owns the connection and implements the repository
//! traits:
//!
//! - [`SubscriptionLedger`] - issued credentials, the source of truth for load
//! - [`BanRepository`] - ban facts
//! - [`AccountRepository`] - users, tariffs and the action audit log
//! - [`NodeRepository`] - persisted node definitions
//!
//! Every mutation is a single statement or a single transaction. Timestamps
//! are stored as unix milliseconds.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gatefleet::storage::{Store, SubscriptionLedger};
//!
//! let store = Store::open("data/gatefleet.db")?;
//! let active = store.active_for_user(42)?;
//! ```

pub mod accounts;
pub mod bans;
pub mod ledger;
pub mod nodes;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

pub use accounts::{AccountRepository, ActionRecord, NewAction};
pub use bans::BanRepository;
pub use ledger::SubscriptionLedger;
pub use nodes::NodeRepository;

/// Everything the orchestrator needs from persistence
pub trait FleetStore: SubscriptionLedger + BanRepository + AccountRepository + NodeRepository {}

impl<T> FleetStore for T where
    T: SubscriptionLedger + BanRepository + AccountRepository + NodeRepository
{
}

/// SQLite-backed store
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::with_source(format!("failed to create {}", parent.display()), e)
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// In-memory store for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                username TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                endpoint TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                location TEXT,
                public_host TEXT NOT NULL,
                public_port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                max_capacity INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tariffs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                duration_days INTEGER NOT NULL,
                traffic_gb INTEGER NOT NULL,
                price REAL NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                remote_id TEXT NOT NULL,
                client_uuid TEXT NOT NULL,
                label TEXT NOT NULL,
                tariff_id INTEGER,
                is_free INTEGER NOT NULL DEFAULT 0,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                quota_bytes INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                deactivated_at INTEGER,
                UNIQUE (node_id, remote_id)
            );

            CREATE INDEX IF NOT EXISTS idx_credentials_owner ON credentials(owner_id, active);
            CREATE INDEX IF NOT EXISTS idx_credentials_node ON credentials(node_id, active);
            CREATE INDEX IF NOT EXISTS idx_credentials_expiry ON credentials(active, expires_at);

            CREATE TABLE IF NOT EXISTS bans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                scope TEXT NOT NULL,
                node_id INTEGER,
                actor_id INTEGER NOT NULL,
                reason TEXT NOT NULL,
                remote_id TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_bans_user ON bans(user_id, scope);

            CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                target_id INTEGER,
                details TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::other("database connection lock poisoned"))
    }
}

/// Map unique-constraint violations to [`Error::Conflict`]
pub(crate) fn map_conflict(err: rusqlite::Error, what: impl FnOnce() -> String) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(what())
        }
        _ => Error::Database(err),
    }
}

/// Clamp a u64 into SQLite's signed integer range
pub(crate) fn to_sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_store_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");

        let store = Store::open(&path).unwrap();
        assert!(path.exists());

        let conn = store.conn().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('users', 'nodes', 'tariffs', 'credentials', 'bans', 'action_log')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");

        drop(Store::open(&path).unwrap());
        assert!(Store::open(&path).is_ok());
    }

    #[test]
    fn test_to_sql_u64_clamps() {
        assert_eq!(to_sql_u64(5), 5);
        assert_eq!(to_sql_u64(u64::MAX), i64::MAX);
    }
}
