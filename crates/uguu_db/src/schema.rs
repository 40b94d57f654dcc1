//! Catalog schema creation.
//!
//! All CREATE TABLE statements live here - single source of truth. The web
//! front end reads the same tables, so column names follow its queries.

use crate::error::Result;
use crate::UguuDb;
use tracing::debug;

impl UguuDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_share_tables().await?;
        self.create_tree_tables().await?;

        debug!("Database schema verified");
        Ok(())
    }

    /// Networks, scan commands and shares (written by discovery and the pinger)
    async fn create_share_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS networks (
                network TEXT PRIMARY KEY,
                lookup_config TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scantypes (
                scantype_id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_command TEXT NOT NULL,
                protocol TEXT NOT NULL CHECK (protocol IN ('smb', 'ftp', 'http')),
                priority INTEGER NOT NULL DEFAULT -1
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS shares (
                share_id INTEGER PRIMARY KEY AUTOINCREMENT,
                tree_id INTEGER REFERENCES trees(tree_id) ON DELETE RESTRICT,
                scantype_id INTEGER NOT NULL REFERENCES scantypes(scantype_id) ON DELETE RESTRICT,
                network TEXT NOT NULL REFERENCES networks(network) ON DELETE CASCADE,
                protocol TEXT NOT NULL CHECK (protocol IN ('smb', 'ftp', 'http')),
                hostname TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'offline' CHECK (state IN ('online', 'offline')),
                size INTEGER NOT NULL DEFAULT 0,
                last_state_change INTEGER,
                last_scan INTEGER,
                next_scan INTEGER,
                last_lookup INTEGER,
                UNIQUE(protocol, hostname, port)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_shares_due ON shares(state, next_scan)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_shares_tree ON shares(tree_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Trees, their paths and files, and the tree locks
    async fn create_tree_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS trees (
                tree_id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT UNIQUE,
                size INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS paths (
                tree_id INTEGER NOT NULL REFERENCES trees(tree_id) ON DELETE CASCADE,
                treepath_id INTEGER NOT NULL,
                parent_id INTEGER,
                parentfile_id INTEGER,
                path TEXT NOT NULL DEFAULT '',
                items INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tree_id, treepath_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS files (
                file_id INTEGER PRIMARY KEY AUTOINCREMENT,
                tree_id INTEGER NOT NULL,
                treepath_id INTEGER NOT NULL,
                pathfile_id INTEGER NOT NULL,
                treedir_id INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL DEFAULT '',
                type TEXT,
                tsname TEXT NOT NULL DEFAULT '',
                tspath TEXT NOT NULL DEFAULT '',
                created INTEGER NOT NULL,
                FOREIGN KEY (tree_id, treepath_id)
                    REFERENCES paths(tree_id, treepath_id) ON DELETE CASCADE
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Slot lookups; not unique because renumbering shifts rows one by one
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_slot ON files(tree_id, treepath_id, pathfile_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_paths_parent ON paths(tree_id, parent_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tree_locks (
                tree_id INTEGER PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
