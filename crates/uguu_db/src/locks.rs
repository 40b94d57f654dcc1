//! Cross-process tree locks.
//!
//! A row in `tree_locks` means some spider instance is rewriting that tree.
//! Locks are never waited on: a busy tree is skipped until its next scan.
//! Rows older than the caller's TTL are assumed to belong to a crashed
//! instance and may be taken over.

use crate::error::Result;
use crate::UguuDb;
use tracing::debug;

impl UguuDb {
    /// Try to take the lock for `tree_id` without blocking.
    ///
    /// Succeeds when the row was inserted, or when an existing row older
    /// than `ttl_millis` was taken over.
    pub async fn try_lock_tree(&self, tree_id: i64, holder: &str, ttl_millis: i64) -> Result<bool> {
        let now = Self::now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO tree_locks (tree_id, holder, acquired_at) VALUES (?, ?, ?)
            ON CONFLICT(tree_id) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at
            WHERE tree_locks.acquired_at < ?
            "#,
        )
        .bind(tree_id)
        .bind(holder)
        .bind(now)
        .bind(now.saturating_sub(ttl_millis))
        .execute(&self.pool)
        .await?;

        let locked = result.rows_affected() == 1;
        debug!(tree_id, holder, locked, "Tree lock attempt");
        Ok(locked)
    }

    /// Release a lock if `holder` still owns it. Returns false otherwise.
    pub async fn unlock_tree(&self, tree_id: i64, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tree_locks WHERE tree_id = ? AND holder = ?")
            .bind(tree_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Current holder of a tree lock, if any.
    pub async fn tree_lock_holder(&self, tree_id: i64) -> Result<Option<String>> {
        let holder: Option<String> =
            sqlx::query_scalar("SELECT holder FROM tree_locks WHERE tree_id = ?")
                .bind(tree_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    #[tokio::test]
    async fn test_second_holder_is_refused() {
        let db = UguuDb::open_memory().await.unwrap();

        assert!(db.try_lock_tree(7, "spider-a", HOUR).await.unwrap());
        assert!(!db.try_lock_tree(7, "spider-b", HOUR).await.unwrap());
        assert_eq!(db.tree_lock_holder(7).await.unwrap().as_deref(), Some("spider-a"));

        // Other trees are independent
        assert!(db.try_lock_tree(8, "spider-b", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_requires_owner() {
        let db = UguuDb::open_memory().await.unwrap();
        assert!(db.try_lock_tree(3, "spider-a", HOUR).await.unwrap());

        assert!(!db.unlock_tree(3, "spider-b").await.unwrap());
        assert!(db.unlock_tree(3, "spider-a").await.unwrap());
        assert!(db.try_lock_tree(3, "spider-b", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let db = UguuDb::open_memory().await.unwrap();
        sqlx::query("INSERT INTO tree_locks (tree_id, holder, acquired_at) VALUES (5, 'crashed', 0)")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(db.try_lock_tree(5, "spider-a", HOUR).await.unwrap());
        assert_eq!(db.tree_lock_holder(5).await.unwrap().as_deref(), Some("spider-a"));
    }
}
