//! Catalog database layer for the uguu share scanner
//!
//! This crate owns the SQLite catalog: shares and their scan commands, the
//! content-addressed trees, and the path/file rows of every tree. The spider
//! uses it through [`UguuDb`] for scheduling primitives and through
//! [`CatalogTx`] for the writes of a single reconciliation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use uguu_db::{UguuDb, Result};
//!
//! let db = UguuDb::open("~/.uguu/uguu.sqlite3").await?;
//!
//! // Scheduler operations
//! let due = db.select_due_shares(UguuDb::now_millis(), 4, &[]).await?;
//!
//! // Reconciliation
//! let mut tx = db.begin_catalog().await?;
//! let tree = tx.resolve_or_create("d41d8cd98f00b204e9800998ecf8427e").await?;
//! tx.commit().await?;
//! ```

mod error;
mod schema;
mod types;

// Method implementations organized by domain
mod catalog;
mod locks;
mod shares;
mod trees;

pub use catalog::{CatalogTx, INSERT_BATCH_ROWS};
pub use error::{DbError, Result};
pub use trees::ResolvedTree;
pub use types::*;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the catalog database.
///
/// This is the only way to access the catalog. Do not open raw sqlx
/// connections elsewhere.
#[derive(Clone)]
pub struct UguuDb {
    pool: SqlitePool,
}

impl UguuDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Database opened");

        Ok(db)
    }

    /// Open a private in-memory database.
    ///
    /// The pool is limited to one connection so every query sees the same
    /// database. Callers must not hold a [`CatalogTx`] while using the pool.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Get the underlying connection pool (escape hatch for ad hoc queries).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start the transaction a reconciliation writes through.
    pub async fn begin_catalog(&self) -> Result<CatalogTx> {
        let tx = self.pool.begin().await?;
        Ok(CatalogTx::new(tx))
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl UguuDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
