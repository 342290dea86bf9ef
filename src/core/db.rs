//! SQLite connection and schema.
//!
//! The database holds three independent surfaces: the episode table (a
//! mutable projection), the append-only processing event log, and the
//! delivery ledger. Every write is a single auto-committed statement.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};
use thiserror::Error;
use tracing::debug;

use crate::domain::PayloadError;

use super::delivery::DeliveryLedger;
use super::event_store::EventStore;
use super::registry::Registry;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feeds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    active INTEGER NOT NULL DEFAULT 1,
    metadata TEXT,
    last_polled_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feeds_active ON feeds(active);

CREATE TABLE IF NOT EXISTS episodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_id INTEGER NOT NULL,
    episode_guid TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    description TEXT,
    link TEXT,
    content_url TEXT NOT NULL,
    artwork_url TEXT,
    published_at TEXT,
    duration_minutes INTEGER,
    file_size_mb REAL,
    context TEXT,
    result TEXT,
    raw_record TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (feed_id) REFERENCES feeds(id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_episodes_feed_id ON episodes(feed_id);

-- Append-only: rows are never updated or deleted
CREATE TABLE IF NOT EXISTS processing_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    episode_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    event_data TEXT,
    additional_details TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_processing_events_episode_created
    ON processing_events(episode_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_processing_events_episode_status
    ON processing_events(episode_id, status);
CREATE INDEX IF NOT EXISTS idx_processing_events_status_created
    ON processing_events(status, created_at DESC);

CREATE TABLE IF NOT EXISTS deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    episode_id INTEGER NOT NULL,
    destination TEXT NOT NULL,
    delivered_at TEXT NOT NULL,
    FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE RESTRICT
);

-- At-most-once delivery per (episode, destination)
CREATE UNIQUE INDEX IF NOT EXISTS idx_deliveries_episode_destination
    ON deliveries(episode_id, destination);
"#;

/// Errors from the persistent store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("episode already exists: {0}")]
    DuplicateGuid(String),

    #[error("corrupt event {id}: {reason}")]
    CorruptEvent { id: i64, reason: String },

    #[error("corrupt event {id}: {source}")]
    CorruptPayload {
        id: i64,
        #[source]
        source: PayloadError,
    },

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("database connection lock poisoned")]
    LockPoisoned,
}

/// Owner of the SQLite connection.
///
/// Components are borrowed views: [`EventStore`], [`Registry`] and
/// [`DeliveryLedger`].
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!(path = %path.display(), "Opened database");
        Self::init(conn)
    }

    /// In-memory database (tests and dry runs)
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Append-only processing event log
    pub fn events(&self) -> EventStore<'_> {
        EventStore::new(self)
    }

    /// Feeds and episodes
    pub fn registry(&self) -> Registry<'_> {
        Registry::new(self)
    }

    /// Per-destination delivery dedup records
    pub fn deliveries(&self) -> DeliveryLedger<'_> {
        DeliveryLedger::new(self)
    }
}

/// Timestamp format used in every table (lexical order = time order)
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

/// True when the error is a UNIQUE constraint violation (not a foreign key)
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("podmon.db");

        let db = Database::open(&path).unwrap();
        let conn = db.conn().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('feeds', 'episodes', 'processing_events', 'deliveries')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("podmon.db");

        drop(Database::open(&path).unwrap());
        assert!(Database::open(&path).is_ok());
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = format_timestamp(parse_timestamp("2024-01-01T00:00:00.000001Z").unwrap());
        let b = format_timestamp(parse_timestamp("2024-01-01T00:00:00.000010Z").unwrap());
        assert!(a < b);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
