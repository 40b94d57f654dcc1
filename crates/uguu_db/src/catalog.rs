//! Catalog writes of a single reconciliation.
//!
//! [`CatalogTx`] wraps one SQLite transaction. Dropping it without calling
//! [`CatalogTx::commit`] rolls everything back, which is how failed scans
//! leave no trace.
//!
//! File inserts are buffered and written as multi-row INSERTs. Every other
//! statement that touches a (tree, path) with buffered inserts flushes the
//! buffer first, so operations on the same directory are never reordered.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::UguuDb;
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashSet;
use tracing::debug;

/// SQLite's default bound-parameter limit.
const MAX_PARAMS: usize = 999;

const FILE_COLUMNS: [&str; 10] = [
    "tree_id",
    "treepath_id",
    "pathfile_id",
    "treedir_id",
    "size",
    "name",
    "type",
    "tsname",
    "tspath",
    "created",
];

/// Buffered file rows are flushed once this many are pending.
pub const INSERT_BATCH_ROWS: usize = MAX_PARAMS / FILE_COLUMNS.len();

/// Transaction handle for reconciliation writes.
pub struct CatalogTx {
    pub(crate) tx: Transaction<'static, Sqlite>,
    pending: Vec<(i64, NewFile)>,
    pending_dirs: HashSet<(i64, i64)>,
    created: i64,
}

impl CatalogTx {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self {
            tx,
            pending: Vec::new(),
            pending_dirs: HashSet::new(),
            created: UguuDb::now_millis(),
        }
    }

    /// Flush buffered inserts and commit.
    pub async fn commit(mut self) -> Result<()> {
        self.flush().await?;
        self.tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Buffering
    // ========================================================================

    /// Write all buffered file rows.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.pending);
        self.pending_dirs.clear();
        self.insert_files(&rows).await
    }

    async fn flush_for(&mut self, tree_id: i64, treepath_id: i64) -> Result<()> {
        if self.pending_dirs.contains(&(tree_id, treepath_id)) {
            self.flush().await?;
        }
        Ok(())
    }

    async fn insert_files(&mut self, rows: &[(i64, NewFile)]) -> Result<()> {
        let row_clause = format!("({})", vec!["?"; FILE_COLUMNS.len()].join(", "));
        let columns = FILE_COLUMNS.join(", ");

        for chunk in rows.chunks(INSERT_BATCH_ROWS) {
            let values_clause = std::iter::repeat(row_clause.as_str())
                .take(chunk.len())
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("INSERT INTO files ({}) VALUES {}", columns, values_clause);

            let mut query = sqlx::query(&sql);
            for (tree_id, file) in chunk {
                query = query
                    .bind(*tree_id)
                    .bind(file.treepath_id)
                    .bind(file.pathfile_id)
                    .bind(file.treedir_id)
                    .bind(file.size)
                    .bind(&file.name)
                    .bind(file.file_type.map(|t| t.as_str()))
                    .bind(&file.tsname)
                    .bind(&file.tspath)
                    .bind(self.created);
            }
            query.execute(&mut *self.tx).await?;
        }

        debug!(rows = rows.len(), "Flushed file inserts");
        Ok(())
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// Delete every path of a tree; files go with them.
    pub async fn clear_tree(&mut self, tree_id: i64) -> Result<u64> {
        self.pending.retain(|(t, _)| *t != tree_id);
        self.pending_dirs.retain(|(t, _)| *t != tree_id);

        let result = sqlx::query("DELETE FROM paths WHERE tree_id = ?")
            .bind(tree_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Insert a directory node. Its back-reference and totals are filled in
    /// when the entry naming it is seen.
    pub async fn insert_path(&mut self, tree_id: i64, treepath_id: i64, path: &str) -> Result<()> {
        sqlx::query("INSERT INTO paths (tree_id, treepath_id, path) VALUES (?, ?, ?)")
            .bind(tree_id)
            .bind(treepath_id)
            .bind(path)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Delete a directory node and its files.
    pub async fn delete_path(&mut self, tree_id: i64, treepath_id: i64) -> Result<()> {
        self.flush_for(tree_id, treepath_id).await?;

        let result = sqlx::query("DELETE FROM paths WHERE tree_id = ? AND treepath_id = ?")
            .bind(tree_id)
            .bind(treepath_id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::constraint(format!(
                "delete of missing path {} in tree {}",
                treepath_id, tree_id
            )));
        }
        Ok(())
    }

    /// Replace the text of an existing path.
    pub async fn rename_path(&mut self, tree_id: i64, treepath_id: i64, path: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE paths SET path = ? WHERE tree_id = ? AND treepath_id = ?")
                .bind(path)
                .bind(tree_id)
                .bind(treepath_id)
                .execute(&mut *self.tx)
                .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::constraint(format!(
                "modify of missing path {} in tree {}",
                treepath_id, tree_id
            )));
        }
        Ok(())
    }

    /// Text of a path, if it exists.
    pub async fn path_text(&mut self, tree_id: i64, treepath_id: i64) -> Result<Option<String>> {
        let path: Option<String> =
            sqlx::query_scalar("SELECT path FROM paths WHERE tree_id = ? AND treepath_id = ?")
                .bind(tree_id)
                .bind(treepath_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(path)
    }

    /// Point a path back at the directory entry that names it and record
    /// its totals. Returns false when the path does not exist.
    pub async fn link_directory(
        &mut self,
        tree_id: i64,
        treedir_id: i64,
        parent: Option<(i64, i64)>,
        items: i64,
        size: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE paths SET parent_id = ?, parentfile_id = ?, items = ?, size = ?
            WHERE tree_id = ? AND treepath_id = ?
            "#,
        )
        .bind(parent.map(|(path, _)| path))
        .bind(parent.map(|(_, slot)| slot))
        .bind(items)
        .bind(size)
        .bind(tree_id)
        .bind(treedir_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Buffer a file row. The slot is taken as given.
    pub async fn append_file(&mut self, tree_id: i64, file: NewFile) -> Result<()> {
        self.pending_dirs.insert((tree_id, file.treepath_id));
        self.pending.push((tree_id, file));
        if self.pending.len() >= INSERT_BATCH_ROWS {
            self.flush().await?;
        }
        Ok(())
    }

    /// Delete the file at `slot` and close the gap it leaves.
    pub async fn delete_file(&mut self, tree_id: i64, treepath_id: i64, slot: i64) -> Result<()> {
        self.remove_file(tree_id, treepath_id, slot).await?;

        sqlx::query(
            r#"
            UPDATE files SET pathfile_id = pathfile_id - 1
            WHERE tree_id = ? AND treepath_id = ? AND pathfile_id > ?
            "#,
        )
        .bind(tree_id)
        .bind(treepath_id)
        .bind(slot)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE paths SET parentfile_id = parentfile_id - 1
            WHERE tree_id = ? AND parent_id = ? AND parentfile_id > ?
            "#,
        )
        .bind(tree_id)
        .bind(treepath_id)
        .bind(slot)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Delete the file at `slot`, leaving a gap for a later merge to close.
    pub async fn remove_file(&mut self, tree_id: i64, treepath_id: i64, slot: i64) -> Result<()> {
        self.flush_for(tree_id, treepath_id).await?;

        let result = sqlx::query(
            "DELETE FROM files WHERE tree_id = ? AND treepath_id = ? AND pathfile_id = ?",
        )
        .bind(tree_id)
        .bind(treepath_id)
        .bind(slot)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::constraint(format!(
                "delete of slot {} under path {} in tree {} matched {} rows",
                slot,
                treepath_id,
                tree_id,
                result.rows_affected()
            )));
        }
        Ok(())
    }

    /// Update the size of the file at `slot`; slots do not move.
    pub async fn update_file_size(
        &mut self,
        tree_id: i64,
        treepath_id: i64,
        slot: i64,
        size: i64,
    ) -> Result<()> {
        self.flush_for(tree_id, treepath_id).await?;

        let result = sqlx::query(
            "UPDATE files SET size = ? WHERE tree_id = ? AND treepath_id = ? AND pathfile_id = ?",
        )
        .bind(size)
        .bind(tree_id)
        .bind(treepath_id)
        .bind(slot)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::constraint(format!(
                "modify of slot {} under path {} in tree {} matched {} rows",
                slot,
                treepath_id,
                tree_id,
                result.rows_affected()
            )));
        }
        Ok(())
    }

    /// Merge files staged for a rewritten directory into its existing rows.
    ///
    /// Staged files keep their announced slots. Existing rows fill the
    /// remaining slots in their previous order, and directories named by a
    /// moved row follow it. Existing rows also take the new `tspath`.
    pub async fn merge_staged_files(
        &mut self,
        tree_id: i64,
        treepath_id: i64,
        tspath: &str,
        staged: Vec<NewFile>,
    ) -> Result<()> {
        self.flush_for(tree_id, treepath_id).await?;

        let survivors = sqlx::query(
            r#"
            SELECT file_id, pathfile_id, treedir_id FROM files
            WHERE tree_id = ? AND treepath_id = ?
            ORDER BY pathfile_id, file_id
            "#,
        )
        .bind(tree_id)
        .bind(treepath_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let total = (survivors.len() + staged.len()) as i64;
        let mut taken = HashSet::with_capacity(staged.len());
        for file in &staged {
            if file.treepath_id != treepath_id {
                return Err(DbError::constraint(format!(
                    "staged file for path {} merged into path {}",
                    file.treepath_id, treepath_id
                )));
            }
            if file.pathfile_id < 0 || file.pathfile_id >= total || !taken.insert(file.pathfile_id)
            {
                return Err(DbError::constraint(format!(
                    "staged slot {} under path {} in tree {} is outside 0..{} or duplicated",
                    file.pathfile_id, treepath_id, tree_id, total
                )));
            }
        }

        sqlx::query("UPDATE files SET tspath = ? WHERE tree_id = ? AND treepath_id = ?")
            .bind(tspath)
            .bind(tree_id)
            .bind(treepath_id)
            .execute(&mut *self.tx)
            .await?;

        let free_slots = (0..total).filter(|slot| !taken.contains(slot));
        for (row, slot) in survivors.iter().zip(free_slots) {
            let file_id: i64 = row.get("file_id");
            let old_slot: i64 = row.get("pathfile_id");
            let treedir_id: i64 = row.get("treedir_id");
            if old_slot == slot {
                continue;
            }

            sqlx::query("UPDATE files SET pathfile_id = ? WHERE file_id = ?")
                .bind(slot)
                .bind(file_id)
                .execute(&mut *self.tx)
                .await?;
            if treedir_id != 0 {
                sqlx::query(
                    "UPDATE paths SET parentfile_id = ? WHERE tree_id = ? AND treepath_id = ?",
                )
                .bind(slot)
                .bind(tree_id)
                .bind(treedir_id)
                .execute(&mut *self.tx)
                .await?;
            }
        }

        let rows: Vec<(i64, NewFile)> = staged.into_iter().map(|f| (tree_id, f)).collect();
        if !rows.is_empty() {
            self.insert_files(&rows).await?;
        }

        debug!(tree_id, treepath_id, total, "Merged staged files");
        Ok(())
    }

    // ========================================================================
    // Shares
    // ========================================================================

    /// Point a share at a tree (or at none).
    pub async fn set_share_tree(&mut self, share_id: i64, tree_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE shares SET tree_id = ? WHERE share_id = ?")
            .bind(tree_id)
            .bind(share_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Record a successful scan: timestamps, and the size when one was seen.
    pub async fn finish_share_scan(
        &mut self,
        share_id: i64,
        size: Option<i64>,
        last_scan: i64,
        next_scan: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE shares SET last_scan = ?, next_scan = ?, size = COALESCE(?, size)
            WHERE share_id = ?
            "#,
        )
        .bind(last_scan)
        .bind(next_scan)
        .bind(size)
        .bind(share_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}
