//! Recompute tree digests from the baselines on disk.
//!
//! Used after baselines were deleted or restored by hand: a tree whose share
//! has no baseline loses its digest, so the next scan of that share is a
//! full scan and cannot be mistaken for unchanged.

use crate::baseline;
use crate::error::Result;
use std::path::Path;
use tracing::{info, warn};
use uguu_db::UguuDb;

/// Totals of one rehash run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RehashSummary {
    pub hashed: u64,
    pub cleared: u64,
    pub conflicts: u64,
}

pub async fn rehash(db: &UguuDb, save_dir: &Path) -> Result<RehashSummary> {
    let mut summary = RehashSummary::default();

    for share in db.list_shares_with_tree().await? {
        let Some(tree_id) = share.tree_id else {
            continue;
        };
        let save_path = baseline::save_path(save_dir, share.protocol, &share.hostname, share.port);
        let label = baseline::share_str(share.protocol, &share.hostname, share.port);

        let digest = match baseline::file_digest(&save_path) {
            Ok(digest) => Some(digest),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(
                    share = %label,
                    path = %save_path.display(),
                    error = %e,
                    "Unreadable baseline"
                );
                None
            }
        };

        match db.set_tree_hash(tree_id, digest.as_deref()).await {
            Ok(()) if digest.is_some() => summary.hashed += 1,
            Ok(()) => summary.cleared += 1,
            Err(e) if e.is_unique_violation() => {
                warn!(share = %label, tree_id, "Another tree already has this digest");
                summary.conflicts += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        hashed = summary.hashed,
        cleared = summary.cleared,
        conflicts = summary.conflicts,
        "Rehash finished"
    );
    Ok(summary)
}
