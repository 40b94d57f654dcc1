//! Content-addressed tree store.
//!
//! Trees are keyed by the digest of a full listing. Shares with identical
//! content point at the same tree, and a tree is deleted once no share
//! references it.

use crate::catalog::CatalogTx;
use crate::error::{DbError, Result};
use crate::types::*;
use crate::UguuDb;
use sqlx::Row;
use tracing::debug;

/// Attempts at resolving a digest before giving up.
const RESOLVE_ATTEMPTS: usize = 3;

/// Outcome of [`CatalogTx::resolve_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTree {
    pub tree_id: i64,
    /// Size of an already populated tree; `None` when the tree was just
    /// created and the caller must fill it.
    pub size: Option<i64>,
}

impl ResolvedTree {
    pub fn is_new(&self) -> bool {
        self.size.is_none()
    }
}

fn row_to_tree(row: &sqlx::sqlite::SqliteRow) -> Tree {
    Tree {
        tree_id: row.get("tree_id"),
        hash: row.get("hash"),
        size: row.get("size"),
    }
}

impl CatalogTx {
    /// Get a tree by ID
    pub async fn get_tree(&mut self, tree_id: i64) -> Result<Option<Tree>> {
        let row = sqlx::query("SELECT tree_id, hash, size FROM trees WHERE tree_id = ?")
            .bind(tree_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.as_ref().map(row_to_tree))
    }

    /// Find the tree holding this digest.
    pub async fn find_tree_by_hash(&mut self, hash: &str) -> Result<Option<Tree>> {
        let row = sqlx::query("SELECT tree_id, hash, size FROM trees WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.as_ref().map(row_to_tree))
    }

    /// Return the tree for `hash`, creating an empty one if none exists.
    ///
    /// Two scans racing on the same new digest both end up with the one
    /// row the unique constraint let through.
    pub async fn resolve_or_create(&mut self, hash: &str) -> Result<ResolvedTree> {
        for attempt in 1..=RESOLVE_ATTEMPTS {
            let result =
                sqlx::query("INSERT INTO trees (hash) VALUES (?) ON CONFLICT(hash) DO NOTHING")
                    .bind(hash)
                    .execute(&mut *self.tx)
                    .await?;
            if result.rows_affected() == 1 {
                let tree_id = result.last_insert_rowid();
                debug!(tree_id, hash, "Created tree");
                return Ok(ResolvedTree {
                    tree_id,
                    size: None,
                });
            }

            if let Some(tree) = self.find_tree_by_hash(hash).await? {
                return Ok(ResolvedTree {
                    tree_id: tree.tree_id,
                    size: Some(tree.size),
                });
            }
            debug!(hash, attempt, "Tree vanished between insert and lookup, retrying");
        }

        Err(DbError::invalid_state(format!(
            "could not resolve tree for digest {}",
            hash
        )))
    }

    pub async fn set_tree_hash(&mut self, tree_id: i64, hash: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE trees SET hash = ? WHERE tree_id = ?")
            .bind(hash)
            .bind(tree_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn set_tree_size(&mut self, tree_id: i64, size: i64) -> Result<()> {
        sqlx::query("UPDATE trees SET size = ? WHERE tree_id = ?")
            .bind(size)
            .bind(tree_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Number of shares pointing at a tree.
    pub async fn tree_share_count(&mut self, tree_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shares WHERE tree_id = ?")
            .bind(tree_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count)
    }

    /// Delete a tree if no share references it any more.
    ///
    /// A foreign key failure means some share still uses it; that is
    /// swallowed. Returns true when the tree was deleted.
    pub async fn release_tree(&mut self, tree_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM trees
            WHERE tree_id = ? AND NOT EXISTS (SELECT 1 FROM shares WHERE tree_id = ?)
            "#,
        )
        .bind(tree_id)
        .bind(tree_id)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(done) => {
                let deleted = done.rows_affected() == 1;
                debug!(tree_id, deleted, "Released tree");
                Ok(deleted)
            }
            Err(e) => {
                let err = DbError::from(e);
                if err.is_foreign_key_violation() {
                    debug!(tree_id, "Tree still referenced, kept");
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }
}

impl UguuDb {
    /// Get a tree by ID
    pub async fn get_tree(&self, tree_id: i64) -> Result<Option<Tree>> {
        let row = sqlx::query("SELECT tree_id, hash, size FROM trees WHERE tree_id = ?")
            .bind(tree_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_tree))
    }

    /// Overwrite a tree's digest outside of a scan.
    pub async fn set_tree_hash(&self, tree_id: i64, hash: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE trees SET hash = ? WHERE tree_id = ?")
            .bind(hash)
            .bind(tree_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of trees in the catalog.
    pub async fn count_trees(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trees")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// All paths of a tree, ordered by id.
    pub async fn list_paths(&self, tree_id: i64) -> Result<Vec<PathRow>> {
        let rows = sqlx::query(
            r#"
            SELECT treepath_id, parent_id, parentfile_id, path, items, size
            FROM paths WHERE tree_id = ?
            ORDER BY treepath_id
            "#,
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PathRow {
                treepath_id: row.get("treepath_id"),
                parent_id: row.get("parent_id"),
                parentfile_id: row.get("parentfile_id"),
                path: row.get("path"),
                items: row.get("items"),
                size: row.get("size"),
            })
            .collect())
    }

    /// All files of a tree, ordered by directory then slot.
    pub async fn list_files(&self, tree_id: i64) -> Result<Vec<FileRow>> {
        let rows = sqlx::query(
            r#"
            SELECT treepath_id, pathfile_id, treedir_id, size, name, type
            FROM files WHERE tree_id = ?
            ORDER BY treepath_id, pathfile_id
            "#,
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let file_type: Option<String> = row.get("type");
                let file_type = match file_type {
                    Some(t) => Some(
                        FileType::parse(&t)
                            .ok_or_else(|| DbError::invalid_state(format!("file type {}", t)))?,
                    ),
                    None => None,
                };
                Ok(FileRow {
                    treepath_id: row.get("treepath_id"),
                    pathfile_id: row.get("pathfile_id"),
                    treedir_id: row.get("treedir_id"),
                    size: row.get("size"),
                    name: row.get("name"),
                    file_type,
                })
            })
            .collect()
    }

    /// Search text stored for one file, as `(tsname, tspath)`.
    pub async fn file_search_text(
        &self,
        tree_id: i64,
        treepath_id: i64,
        slot: i64,
    ) -> Result<Option<(String, String)>> {
        let row = sqlx::query(
            r#"
            SELECT tsname, tspath FROM files
            WHERE tree_id = ? AND treepath_id = ? AND pathfile_id = ?
            "#,
        )
        .bind(tree_id)
        .bind(treepath_id)
        .bind(slot)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| (row.get("tsname"), row.get("tspath"))))
    }
}
