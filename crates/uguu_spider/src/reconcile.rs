//! Applying a captured scan to the catalog.
//!
//! One finished scan is reconciled inside one [`CatalogTx`]. Depending on
//! the new listing digest the share is left alone, pointed at an existing
//! tree with the same content, or its tree is rewritten, either from the
//! scanner's patch records or from the full listing. The baseline file is
//! only replaced after the transaction committed.

use crate::baseline;
use crate::config::SpiderConfig;
use crate::error::{Result, SpiderError};
use crate::protocol::{FileRecord, LineParser, Record, ScanMode};
use crate::scanner::CapturedScan;
use crate::search_text;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use uguu_db::{CatalogTx, FileType, NewFile, Tree, UguuDb};

/// A claimed share whose scanner output is being applied.
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub share_id: i64,
    /// `proto://host[:port]`, for logs
    pub share: String,
    /// Tree the share pointed at when it was claimed
    pub tree_id: Option<i64>,
    pub save_path: PathBuf,
    /// The scanner was given the baseline and asked for a patch
    pub patch_requested: bool,
}

/// Counters of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub mode: ScanMode,
    pub paths_added: u64,
    pub paths_deleted: u64,
    pub paths_modified: u64,
    pub files_added: u64,
    pub files_deleted: u64,
    pub files_modified: u64,
}

impl ReconcileStats {
    fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            paths_added: 0,
            paths_deleted: 0,
            paths_modified: 0,
            files_added: 0,
            files_deleted: 0,
            files_modified: 0,
        }
    }

    pub fn added(&self) -> u64 {
        self.paths_added + self.files_added
    }

    pub fn deleted(&self) -> u64 {
        self.paths_deleted + self.files_deleted
    }

    pub fn modified(&self) -> u64 {
        self.paths_modified + self.files_modified
    }
}

impl fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delete {}, add {}, modify {}",
            self.deleted(),
            self.added(),
            self.modified()
        )
    }
}

/// Result of one scan attempt.
#[derive(Debug)]
pub enum ScanOutcome {
    /// The share's tree was rewritten
    Updated(ReconcileStats),
    /// The listing digest did not change
    Unchanged,
    /// The share now shares an existing tree
    Deduplicated { tree_id: i64 },
    Failed(SpiderError),
}

/// Decide whether a patch can be applied to the tree it claims to patch.
pub fn choose_mode(
    job: &ScanJob,
    captured: &CapturedScan,
    tree_hash: Option<&str>,
    patch_fallback: f64,
) -> ScanMode {
    if !job.patch_requested {
        return ScanMode::Full;
    }
    let Some(sentinel) = captured.sentinel.as_deref() else {
        warn!(share = %job.share, "Scanner produced no patch digest, applying full listing");
        return ScanMode::Full;
    };
    if Some(sentinel) != tree_hash {
        warn!(
            share = %job.share,
            expected = tree_hash.unwrap_or("none"),
            got = sentinel,
            "Patch digest mismatch, applying full listing"
        );
        return ScanMode::Full;
    }
    let patch_lines = captured.patch_line_count() as f64;
    if patch_lines > patch_fallback * captured.listing_lines as f64 {
        info!(
            share = %job.share,
            patch_lines = captured.patch_line_count(),
            listing_lines = captured.listing_lines,
            "Patch too large, applying full listing"
        );
        return ScanMode::Full;
    }
    ScanMode::Patch
}

/// Apply a captured scan to the catalog and install the new baseline.
pub async fn reconcile(
    db: &UguuDb,
    config: &SpiderConfig,
    job: &ScanJob,
    captured: CapturedScan,
) -> Result<ScanOutcome> {
    let start = Instant::now();
    let digest = captured.digest.clone();
    let mut tx = db.begin_catalog().await?;

    let previous = match job.tree_id {
        Some(tree_id) => tx.get_tree(tree_id).await?,
        None => None,
    };
    let previous_hash = previous.as_ref().and_then(|t| t.hash.clone());

    let (outcome, size) = if previous_hash.as_deref() == Some(digest.as_str()) {
        let size = match (&previous, captured.root_size) {
            (Some(tree), Some(size)) => {
                tx.set_tree_size(tree.tree_id, size).await?;
                Some(size)
            }
            (Some(tree), None) => Some(tree.size),
            (None, size) => size,
        };
        (ScanOutcome::Unchanged, size)
    } else if let Some(existing) = tx.find_tree_by_hash(&digest).await? {
        deduplicate(&mut tx, job, previous.as_ref(), &existing).await?
    } else if let Some(tree) = exclusive_tree(&mut tx, previous.as_ref()).await? {
        let mode = choose_mode(job, &captured, previous_hash.as_deref(), config.patch_fallback);
        let stats = populate(&mut tx, tree.tree_id, mode, &captured).await?;
        let size = captured.root_size.unwrap_or(tree.size);
        tx.set_tree_hash(tree.tree_id, Some(&digest)).await?;
        tx.set_tree_size(tree.tree_id, size).await?;
        (ScanOutcome::Updated(stats), Some(size))
    } else {
        let resolved = tx.resolve_or_create(&digest).await?;
        match resolved.size {
            Some(size) => {
                let existing = Tree {
                    tree_id: resolved.tree_id,
                    hash: Some(digest.clone()),
                    size,
                };
                deduplicate(&mut tx, job, previous.as_ref(), &existing).await?
            }
            None => {
                let stats = populate(&mut tx, resolved.tree_id, ScanMode::Full, &captured).await?;
                let size = captured.root_size.unwrap_or(0);
                tx.set_tree_size(resolved.tree_id, size).await?;
                tx.set_share_tree(job.share_id, Some(resolved.tree_id)).await?;
                if let Some(old) = &previous {
                    tx.release_tree(old.tree_id).await?;
                }
                (ScanOutcome::Updated(stats), Some(size))
            }
        }
    };

    let now = UguuDb::now_millis();
    tx.finish_share_scan(
        job.share_id,
        size,
        now,
        now.saturating_add(config.success_backoff_millis()),
    )
    .await?;
    tx.commit().await?;

    if let Err(e) = baseline::install(&job.save_path, captured.listing) {
        warn!(
            share = %job.share,
            path = %job.save_path.display(),
            error = %e,
            "Failed to save baseline, next scan will be a full scan"
        );
    }

    let update_time = start.elapsed();
    match &outcome {
        ScanOutcome::Updated(stats) => info!(
            share = %job.share,
            mode = stats.mode.as_str(),
            scan_time = ?captured.scan_time,
            update_time = ?update_time,
            "Share updated: {}",
            stats
        ),
        ScanOutcome::Unchanged => info!(
            share = %job.share,
            scan_time = ?captured.scan_time,
            "Share unchanged"
        ),
        ScanOutcome::Deduplicated { tree_id } => info!(
            share = %job.share,
            tree_id,
            scan_time = ?captured.scan_time,
            "Share content matches an existing tree"
        ),
        ScanOutcome::Failed(_) => {}
    }
    Ok(outcome)
}

/// The previous tree, if this share is its only user.
async fn exclusive_tree(tx: &mut CatalogTx, previous: Option<&Tree>) -> Result<Option<Tree>> {
    let Some(tree) = previous else {
        return Ok(None);
    };
    if tx.tree_share_count(tree.tree_id).await? <= 1 {
        Ok(Some(tree.clone()))
    } else {
        Ok(None)
    }
}

async fn deduplicate(
    tx: &mut CatalogTx,
    job: &ScanJob,
    previous: Option<&Tree>,
    existing: &Tree,
) -> Result<(ScanOutcome, Option<i64>)> {
    debug!(share = %job.share, tree_id = existing.tree_id, "Reusing tree");
    tx.set_share_tree(job.share_id, Some(existing.tree_id)).await?;
    if let Some(old) = previous {
        if old.tree_id != existing.tree_id {
            tx.release_tree(old.tree_id).await?;
        }
    }
    Ok((
        ScanOutcome::Deduplicated {
            tree_id: existing.tree_id,
        },
        Some(existing.size),
    ))
}

/// Rewrite a tree's paths and files from the captured output.
pub async fn populate(
    tx: &mut CatalogTx,
    tree_id: i64,
    mode: ScanMode,
    captured: &CapturedScan,
) -> Result<ReconcileStats> {
    let mut parser = LineParser::new(mode);
    let mut applier = TreeWriter::new(tx, tree_id, mode);

    match mode {
        ScanMode::Patch => {
            for line in &captured.patch_lines {
                if let Some(record) = parser.parse(line)? {
                    applier.apply(record).await?;
                }
            }
        }
        ScanMode::Full => {
            let cleared = applier.tx.clear_tree(tree_id).await?;
            debug!(tree_id, paths = cleared, "Cleared tree for full listing");

            let file = tokio::fs::File::open(captured.listing_path()).await?;
            let mut reader = BufReader::new(file);
            let mut line = Vec::with_capacity(256);
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }
                if let Some(record) = parser.parse(&line)? {
                    applier.apply(record).await?;
                }
            }
        }
    }

    if parser.escaped_lines() > 0 {
        warn!(tree_id, lines = parser.escaped_lines(), "Escaped non utf-8 names");
    }
    applier.finish().await
}

// ============================================================================
// Record application
// ============================================================================

/// What is known about a path during one reconciliation.
#[derive(Debug)]
struct PathState {
    tspath: String,
    /// Rewritten by a `*` record; its adds are staged and merged
    modified: bool,
    staged: Vec<NewFile>,
}

impl PathState {
    fn new(path: &str) -> Self {
        Self {
            tspath: search_text::prepare(path),
            modified: false,
            staged: Vec::new(),
        }
    }
}

/// Back-reference for a path that has not been inserted yet.
#[derive(Debug, Clone, Copy)]
struct DirLink {
    parent: Option<(i64, i64)>,
    items: i64,
    size: i64,
}

struct TreeWriter<'a> {
    tx: &'a mut CatalogTx,
    tree_id: i64,
    paths: HashMap<i64, PathState>,
    pending_links: HashMap<i64, DirLink>,
    stats: ReconcileStats,
}

impl<'a> TreeWriter<'a> {
    fn new(tx: &'a mut CatalogTx, tree_id: i64, mode: ScanMode) -> Self {
        Self {
            tx,
            tree_id,
            paths: HashMap::new(),
            pending_links: HashMap::new(),
            stats: ReconcileStats::new(mode),
        }
    }

    async fn apply(&mut self, record: Record) -> Result<()> {
        let tree_id = self.tree_id;
        match record {
            Record::PathAdd(p) => {
                self.tx.insert_path(tree_id, p.id, &p.path).await?;
                self.paths.insert(p.id, PathState::new(&p.path));
                self.stats.paths_added += 1;
                if let Some(link) = self.pending_links.remove(&p.id) {
                    self.tx
                        .link_directory(tree_id, p.id, link.parent, link.items, link.size)
                        .await?;
                }
            }
            Record::PathDelete(p) => {
                self.paths.remove(&p.id);
                self.pending_links.remove(&p.id);
                self.tx.delete_path(tree_id, p.id).await?;
                self.stats.paths_deleted += 1;
            }
            Record::PathModify(p) => {
                self.merge_staged(p.id).await?;
                self.tx.rename_path(tree_id, p.id, &p.path).await?;
                let state = self
                    .paths
                    .entry(p.id)
                    .or_insert_with(|| PathState::new(&p.path));
                state.tspath = search_text::prepare(&p.path);
                state.modified = true;
                self.stats.paths_modified += 1;
            }
            Record::FileAdd(f) => {
                let file = self.new_file(&f).await?;
                match self.paths.get_mut(&f.parent_id) {
                    Some(state) if state.modified => state.staged.push(file),
                    _ => self.tx.append_file(tree_id, file).await?,
                }
                self.stats.files_added += 1;
                if f.dir_link > 0 {
                    self.link(f.dir_link, Some((f.parent_id, f.slot)), f.items, f.size)
                        .await?;
                }
            }
            Record::FileDelete(f) => {
                if self.is_modified(f.parent_id) {
                    self.tx.remove_file(tree_id, f.parent_id, f.slot).await?;
                } else {
                    self.tx.delete_file(tree_id, f.parent_id, f.slot).await?;
                }
                self.stats.files_deleted += 1;
            }
            Record::FileModify(f) => {
                self.tx
                    .update_file_size(tree_id, f.parent_id, f.slot, f.size)
                    .await?;
                self.stats.files_modified += 1;
                if f.dir_link > 0 {
                    self.link(f.dir_link, Some((f.parent_id, f.slot)), f.items, f.size)
                        .await?;
                }
            }
            Record::RootSizeObserved {
                size,
                dir_link,
                items,
            } => {
                if dir_link > 0 {
                    self.link(dir_link, None, items, size).await?;
                }
            }
            Record::DigestSentinel(_) => {}
        }
        Ok(())
    }

    async fn new_file(&mut self, f: &FileRecord) -> Result<NewFile> {
        let tspath = self.tspath(f.parent_id).await?;
        Ok(NewFile {
            treepath_id: f.parent_id,
            pathfile_id: f.slot,
            treedir_id: f.dir_link,
            size: f.size,
            file_type: FileType::classify(&f.name, f.dir_link),
            tsname: search_text::prepare(&f.name),
            tspath,
            name: f.name.clone(),
        })
    }

    /// Search text of a path, loading it from the catalog on first use.
    async fn tspath(&mut self, treepath_id: i64) -> Result<String> {
        if let Some(state) = self.paths.get(&treepath_id) {
            return Ok(state.tspath.clone());
        }
        let path = self
            .tx
            .path_text(self.tree_id, treepath_id)
            .await?
            .ok_or_else(|| {
                SpiderError::integrity(format!(
                    "file under missing path {} in tree {}",
                    treepath_id, self.tree_id
                ))
            })?;
        let state = PathState::new(&path);
        let tspath = state.tspath.clone();
        self.paths.insert(treepath_id, state);
        Ok(tspath)
    }

    /// Record the entry naming a directory. A staged rewrite of that
    /// directory is complete once its entry is seen.
    async fn link(
        &mut self,
        treedir_id: i64,
        parent: Option<(i64, i64)>,
        items: i64,
        size: i64,
    ) -> Result<()> {
        self.merge_staged(treedir_id).await?;
        let linked = self
            .tx
            .link_directory(self.tree_id, treedir_id, parent, items, size)
            .await?;
        if !linked {
            self.pending_links
                .insert(treedir_id, DirLink { parent, items, size });
        }
        Ok(())
    }

    fn is_modified(&self, treepath_id: i64) -> bool {
        self.paths
            .get(&treepath_id)
            .is_some_and(|state| state.modified)
    }

    /// Merge the stage of a modified path and renumber its survivors.
    async fn merge_staged(&mut self, treepath_id: i64) -> Result<()> {
        let Some(state) = self.paths.get_mut(&treepath_id) else {
            return Ok(());
        };
        if !state.modified {
            return Ok(());
        }
        let staged = std::mem::take(&mut state.staged);
        let tspath = state.tspath.clone();
        self.tx
            .merge_staged_files(self.tree_id, treepath_id, &tspath, staged)
            .await?;
        Ok(())
    }

    async fn finish(mut self) -> Result<ReconcileStats> {
        let mut modified: Vec<i64> = self
            .paths
            .iter()
            .filter(|(_, state)| state.modified)
            .map(|(id, _)| *id)
            .collect();
        modified.sort_unstable();

        for treepath_id in modified {
            let Some(state) = self.paths.get_mut(&treepath_id) else {
                continue;
            };
            let staged = std::mem::take(&mut state.staged);
            let tspath = state.tspath.clone();
            self.tx
                .merge_staged_files(self.tree_id, treepath_id, &tspath, staged)
                .await?;
        }

        if !self.pending_links.is_empty() {
            debug!(
                tree_id = self.tree_id,
                unresolved = self.pending_links.len(),
                "Directory entries without a matching path"
            );
        }
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uguu_db::{Availability, NewShare, Protocol};

    const LISTING: &[u8] = b"0 1 \n1 0 0 30 1 2 \n1 1 0 10 0 0 a.mp3\n1 1 1 20 2 1 sub\n0 2 sub\n1 2 0 20 0 0 Show.S01E02.mkv\n";

    async fn setup() -> (TempDir, UguuDb, SpiderConfig, ScanJob) {
        let tmp = TempDir::new().unwrap();
        let db = UguuDb::open_memory().await.unwrap();
        db.insert_network("lan").await.unwrap();
        let scantype = db.insert_scantype(Protocol::Smb, "smbscan", 0).await.unwrap();
        let share_id = db
            .insert_share(&NewShare {
                scantype_id: scantype,
                network: "lan".into(),
                protocol: Protocol::Smb,
                hostname: "host".into(),
                port: 0,
                state: Availability::Online,
            })
            .await
            .unwrap();
        let config = SpiderConfig {
            save_dir: tmp.path().to_path_buf(),
            ..SpiderConfig::default()
        };
        let job = ScanJob {
            share_id,
            share: "smb://host".into(),
            tree_id: None,
            save_path: baseline::save_path(tmp.path(), Protocol::Smb, "host", 0),
            patch_requested: false,
        };
        (tmp, db, config, job)
    }

    fn capture(tmp: &TempDir, output: &[u8]) -> CapturedScan {
        CapturedScan::from_output(output, tmp.path(), 1000).unwrap()
    }

    #[tokio::test]
    async fn test_first_scan_populates_tree() {
        let (tmp, db, config, job) = setup().await;

        let outcome = reconcile(&db, &config, &job, capture(&tmp, LISTING))
            .await
            .unwrap();
        let ScanOutcome::Updated(stats) = &outcome else {
            panic!("expected update, got {:?}", outcome);
        };
        assert_eq!(stats.mode, ScanMode::Full);
        assert_eq!((stats.paths_added, stats.files_added), (2, 3));

        let share = db.get_share(job.share_id).await.unwrap().unwrap();
        assert_eq!(share.size, 30);
        let tree_id = share.tree_id.unwrap();
        let tree = db.get_tree(tree_id).await.unwrap().unwrap();
        assert_eq!(tree.hash.as_deref(), Some(format!("{:x}", md5::compute(LISTING)).as_str()));

        let paths = db.list_paths(tree_id).await.unwrap();
        assert_eq!(paths[0].parent_id, None);
        assert_eq!((paths[0].items, paths[0].size), (2, 30));
        assert_eq!(paths[1].parent_id, Some(1));
        assert_eq!(paths[1].parentfile_id, Some(1));

        let files = db.list_files(tree_id).await.unwrap();
        assert_eq!(files[1].file_type, Some(FileType::Dir));
        assert_eq!(files[2].file_type, Some(FileType::Video));
        let (tsname, tspath) = db.file_search_text(tree_id, 2, 0).await.unwrap().unwrap();
        assert_eq!(tsname, "Show S01E02 S01 E02 01 02  mkv");
        assert_eq!(tspath, "sub");

        assert_eq!(std::fs::read(&job.save_path).unwrap(), LISTING);
    }

    #[tokio::test]
    async fn test_same_digest_is_unchanged() {
        let (tmp, db, config, mut job) = setup().await;
        reconcile(&db, &config, &job, capture(&tmp, LISTING))
            .await
            .unwrap();
        job.tree_id = db.get_share(job.share_id).await.unwrap().unwrap().tree_id;

        let outcome = reconcile(&db, &config, &job, capture(&tmp, LISTING))
            .await
            .unwrap();
        assert!(matches!(outcome, ScanOutcome::Unchanged));
        assert!(baseline::old_path(&job.save_path).is_file());
        assert_eq!(db.count_trees().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_sentinel_applies_listing() {
        let (tmp, db, config, mut job) = setup().await;
        reconcile(&db, &config, &job, capture(&tmp, LISTING))
            .await
            .unwrap();
        job.tree_id = db.get_share(job.share_id).await.unwrap().unwrap().tree_id;
        job.patch_requested = true;

        // Claims to delete a slot that does not exist; must never be applied
        let output = b"* 00000000000000000000000000000000\n- 1 1 7 0 0 0 ghost\n0 1 \n1 0 0 10 0 1 \n1 1 0 10 0 0 a.mp3\n";
        let outcome = reconcile(&db, &config, &job, capture(&tmp, output))
            .await
            .unwrap();
        let ScanOutcome::Updated(stats) = &outcome else {
            panic!("expected update, got {:?}", outcome);
        };
        assert_eq!(stats.mode, ScanMode::Full);
        assert_eq!(stats.files_deleted, 0);

        let files = db.list_files(job.tree_id.unwrap()).await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_patch_falls_back() {
        let (tmp, _db, _config, mut job) = setup().await;
        job.patch_requested = true;
        let hash = "d41d8cd98f00b204e9800998ecf8427e";
        let output = format!("* {}\n+ 1 1 0 1 0 0 x\n+ 1 1 1 1 0 0 y\n0 1 \n1 1 0 1 0 0 x\n", hash);
        let captured = capture(&tmp, output.as_bytes());

        assert_eq!(choose_mode(&job, &captured, Some(hash), 0.8), ScanMode::Full);
        assert_eq!(choose_mode(&job, &captured, Some(hash), 1.0), ScanMode::Patch);
        assert_eq!(choose_mode(&job, &captured, None, 1.0), ScanMode::Full);

        job.patch_requested = false;
        assert_eq!(choose_mode(&job, &captured, Some(hash), 1.0), ScanMode::Full);
    }

    #[test]
    fn test_stats_summary() {
        let mut stats = ReconcileStats::new(ScanMode::Patch);
        stats.paths_added = 1;
        stats.files_added = 2;
        stats.files_deleted = 4;
        stats.files_modified = 1;
        assert_eq!(stats.to_string(), "delete 4, add 3, modify 1");
    }
}
