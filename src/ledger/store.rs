//! SQLite backing store for the ledger.
//!
//! Two connections are opened on the same database file: one handed to the
//! single-writer worker, one shared behind a mutex for caller-thread reads
//! and the synchronous fallback write path. Under WAL, readers do not block
//! the writer.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

/// Thread-safe read handle over the ledger database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the ledger database, returning the read handle and the
    /// dedicated writer connection.
    pub fn open(path: &Path) -> anyhow::Result<(Self, Connection)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)?;
        apply_pragmas(&writer)?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open(path)?;
        apply_pragmas(&reader)?;

        let store = Self {
            conn: Arc::new(Mutex::new(reader)),
        };
        Ok((store, writer))
    }

    /// Execute a closure with access to the read connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, rusqlite::Error>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        f(&conn)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        TEXT PRIMARY KEY,
    trace_id        TEXT NOT NULL,
    event_type      TEXT NOT NULL
        CHECK (event_type IN ('precheck_hold', 'commit', 'cancel', 'adjust', 'retry_attempt')),
    provider        TEXT NOT NULL,
    model           TEXT NOT NULL,
    usage_json      TEXT NOT NULL DEFAULT '{}',
    usage_known     INTEGER NOT NULL DEFAULT 0,
    cost_est_usd    REAL,
    cost_actual_usd REAL,
    status          TEXT NOT NULL DEFAULT 'ok'
        CHECK (status IN ('ok', 'error', 'cancelled', 'rate_limited')),
    timing_json     TEXT NOT NULL DEFAULT '{}',
    metadata_json   TEXT NOT NULL DEFAULT '{}',
    timestamp       REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_trace ON events(trace_id);
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema_and_wal() {
        let dir = tempfile::tempdir().unwrap();
        let (store, writer) = Store::open(&dir.path().join("ledger.db")).unwrap();

        let mode: String = writer
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let count: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reader_sees_writer_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (store, writer) = Store::open(&dir.path().join("ledger.db")).unwrap();

        writer
            .execute(
                "INSERT INTO events (event_id, trace_id, event_type, provider, model, timestamp) \
                 VALUES ('e1', 't1', 'commit', 'echo', 'm', 1.0)",
                [],
            )
            .unwrap();

        let count: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_schema_rejects_unknown_event_type() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, writer) = Store::open(&dir.path().join("ledger.db")).unwrap();

        let result = writer.execute(
            "INSERT INTO events (event_id, trace_id, event_type, provider, model, timestamp) \
             VALUES ('e1', 't1', 'bogus', 'echo', 'm', 1.0)",
            [],
        );
        assert!(result.is_err());
    }
}
