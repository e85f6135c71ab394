//! # Factory
//!
//! Opens the database and hands out one [`Strategy`] per object kind.
//! Every strategy gets its own connection to the same database; SQLite's
//! WAL mode coordinates them. For in-memory databases the connections
//! share one cache, and the factory keeps an anchor connection open so
//! the database outlives any individual strategy.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::strategy::Strategy;
use crate::types::Object;

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hands out per-kind strategies backed by one database.
pub struct Factory {
    /// Connection string every strategy opens.
    location: String,
    migration_timeout: Option<Duration>,
    /// Keeps a shared in-memory database alive between strategies.
    _anchor: Option<Mutex<Connection>>,
}

impl Factory {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let location = path
            .as_ref()
            .to_str()
            .ok_or_else(|| Error::InvalidArgument("database path is not valid UTF-8".to_string()))?
            .to_string();
        // Probe the location once so a bad path fails here, not on the
        // first strategy.
        let conn = open_connection(&location)?;
        drop(conn);
        Ok(Self {
            location,
            migration_timeout: None,
            _anchor: None,
        })
    }

    /// Creates a private in-memory database, shared by every strategy
    /// this factory hands out. Primarily for tests.
    pub fn open_in_memory() -> Result<Self> {
        let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let location = format!("file:revstore-mem-{seq}?mode=memory&cache=shared");
        let anchor = open_connection(&location)?;
        Ok(Self {
            location,
            migration_timeout: None,
            _anchor: Some(Mutex::new(anchor)),
        })
    }

    /// Bounds how long a strategy's table migration may take.
    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = Some(timeout);
        self
    }

    /// Builds the strategy for `kind`, storing rows in a table named
    /// after the lowercased kind.
    pub async fn strategy<T: Object>(&self, kind: &str) -> Result<Strategy<T>> {
        self.strategy_with_table(kind, &kind.to_lowercase()).await
    }

    /// Builds the strategy for `kind` with an explicit table name.
    pub async fn strategy_with_table<T: Object>(
        &self,
        kind: &str,
        table: &str,
    ) -> Result<Strategy<T>> {
        let conn = open_connection(&self.location)?;
        let db = Db::spawn(conn, kind, table)?;
        tracing::debug!(kind, table, "migrating store");
        match self.migration_timeout {
            Some(timeout) => tokio::time::timeout(timeout, Strategy::new(db))
                .await
                .map_err(|_| {
                    Error::Internal(format!("migration of {table:?} timed out after {timeout:?}"))
                })?,
            None => Strategy::new(db).await,
        }
    }
}

fn open_connection(location: &str) -> Result<Connection> {
    let conn = Connection::open(location)?;
    // WAL keeps readers unblocked by the writer; NORMAL syncs the WAL on
    // commit. The busy timeout covers the handoff between the strategies'
    // connections.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA busy_timeout = 5000;\n\
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================
