//! Share operations (scheduling and claiming)

use crate::error::{DbError, Result};
use crate::types::*;
use crate::UguuDb;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;

impl UguuDb {
    // ========================================================================
    // Discovery-side inserts
    // ========================================================================

    /// Register a network (no-op if it already exists)
    pub async fn insert_network(&self, network: &str) -> Result<()> {
        sqlx::query("INSERT INTO networks (network) VALUES (?) ON CONFLICT(network) DO NOTHING")
            .bind(network)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Register a scan command for a protocol
    pub async fn insert_scantype(
        &self,
        protocol: Protocol,
        scan_command: &str,
        priority: i32,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scantypes (scan_command, protocol, priority) VALUES (?, ?, ?)",
        )
        .bind(scan_command)
        .bind(protocol.as_str())
        .bind(priority)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Insert a share without a tree; it is scanned once it is online
    pub async fn insert_share(&self, share: &NewShare) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO shares (scantype_id, network, protocol, hostname, port, state, last_state_change)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(share.scantype_id)
        .bind(&share.network)
        .bind(share.protocol.as_str())
        .bind(&share.hostname)
        .bind(share.port as i64)
        .bind(share.state.as_str())
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Mark a share online or offline
    pub async fn set_share_state(&self, share_id: i64, state: Availability) -> Result<()> {
        let result = sqlx::query(
            "UPDATE shares SET state = ?, last_state_change = ? WHERE share_id = ? AND state != ?",
        )
        .bind(state.as_str())
        .bind(Self::now_millis())
        .bind(share_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(share_id, state = %state.as_str(), changed = result.rows_affected(), "Share state set");
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Get a share by ID
    pub async fn get_share(&self, share_id: i64) -> Result<Option<Share>> {
        let row = sqlx::query(
            r#"
            SELECT share_id, tree_id, scantype_id, network, protocol, hostname, port,
                   state, size, last_scan, next_scan
            FROM shares WHERE share_id = ?
            "#,
        )
        .bind(share_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_share(&row)?)),
            None => Ok(None),
        }
    }

    /// All shares that currently reference a tree
    pub async fn list_shares_with_tree(&self) -> Result<Vec<Share>> {
        let rows = sqlx::query(
            r#"
            SELECT share_id, tree_id, scantype_id, network, protocol, hostname, port,
                   state, size, last_scan, next_scan
            FROM shares WHERE tree_id IS NOT NULL
            ORDER BY share_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.row_to_share(row)).collect()
    }

    /// All registered scan commands
    pub async fn load_scantypes(&self) -> Result<Vec<ScanType>> {
        let rows = sqlx::query(
            "SELECT scantype_id, protocol, scan_command, priority FROM scantypes ORDER BY scantype_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let protocol: String = row.get("protocol");
                Ok(ScanType {
                    scantype_id: row.get("scantype_id"),
                    protocol: parse_protocol(&protocol)?,
                    scan_command: row.get("scan_command"),
                    priority: row.get("priority"),
                })
            })
            .collect()
    }

    fn row_to_share(&self, row: &SqliteRow) -> Result<Share> {
        let protocol: String = row.get("protocol");
        let state: String = row.get("state");

        Ok(Share {
            share_id: row.get("share_id"),
            tree_id: row.get("tree_id"),
            scantype_id: row.get("scantype_id"),
            network: row.get("network"),
            protocol: parse_protocol(&protocol)?,
            hostname: row.get("hostname"),
            port: parse_port(row.get("port"))?,
            state: Availability::parse(&state)
                .ok_or_else(|| DbError::invalid_state(format!("share state {}", state)))?,
            size: row.get("size"),
            last_scan: row.get("last_scan"),
            next_scan: row.get("next_scan"),
        })
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Online shares whose next scan is due, oldest-due first.
    ///
    /// Shares listed in `exclude` (already in flight in this process) are
    /// skipped.
    pub async fn select_due_shares(
        &self,
        now: i64,
        limit: usize,
        exclude: &[i64],
    ) -> Result<Vec<DueShare>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            r#"
            SELECT share_id, tree_id, scantype_id, protocol, hostname, port
            FROM shares
            WHERE state = 'online' AND (next_scan IS NULL OR next_scan < ?)
            "#,
        );
        if !exclude.is_empty() {
            let placeholders = vec!["?"; exclude.len()].join(", ");
            sql.push_str(&format!(" AND share_id NOT IN ({})", placeholders));
        }
        sql.push_str(" ORDER BY next_scan IS NOT NULL, next_scan, share_id LIMIT ?");

        let mut query = sqlx::query(&sql).bind(now);
        for share_id in exclude {
            query = query.bind(*share_id);
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        // A share that cannot be decoded must not keep the others from scanning
        Ok(rows
            .iter()
            .filter_map(|row| match due_share(row) {
                Ok(share) => Some(share),
                Err(e) => {
                    let share_id: i64 = row.get("share_id");
                    warn!(share_id, error = %e, "Skipping undecodable share");
                    None
                }
            })
            .collect())
    }

    /// Optimistically claim a due share by pushing its `next_scan` forward.
    ///
    /// Returns true only when this call moved the share; a concurrent
    /// scheduler that got there first makes the update match zero rows.
    pub async fn claim_share(&self, share_id: i64, now: i64, next_scan: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE shares SET next_scan = ?
            WHERE share_id = ? AND (next_scan IS NULL OR next_scan < ?)
            "#,
        )
        .bind(next_scan)
        .bind(share_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Set `next_scan` unconditionally (failure backoff)
    pub async fn set_next_scan(&self, share_id: i64, next_scan: i64) -> Result<()> {
        sqlx::query("UPDATE shares SET next_scan = ? WHERE share_id = ?")
            .bind(next_scan)
            .bind(share_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn due_share(row: &SqliteRow) -> Result<DueShare> {
    let protocol: String = row.get("protocol");
    Ok(DueShare {
        share_id: row.get("share_id"),
        tree_id: row.get("tree_id"),
        scantype_id: row.get("scantype_id"),
        protocol: parse_protocol(&protocol)?,
        hostname: row.get("hostname"),
        port: parse_port(row.get("port"))?,
    })
}

fn parse_protocol(s: &str) -> Result<Protocol> {
    Protocol::parse(s).ok_or_else(|| DbError::invalid_state(format!("protocol {}", s)))
}

fn parse_port(port: i64) -> Result<u16> {
    u16::try_from(port).map_err(|_| DbError::invalid_state(format!("port {}", port)))
}
