//! Reconciliation of captured scanner output against a real catalog.

use tempfile::TempDir;
use uguu_db::{Availability, FileRow, NewShare, PathRow, Protocol, UguuDb};
use uguu_spider::baseline;
use uguu_spider::reconcile::{reconcile, ScanJob, ScanOutcome};
use uguu_spider::{CapturedScan, ErrorKind, ScanMode, SpiderConfig};

const L0: &str = "\
0 1
1 0 0 60 1 3
1 1 0 10 0 0 a.txt
1 1 1 20 0 0 b.txt
1 1 2 30 2 1 dir
0 2 dir
1 2 0 30 0 0 c.mp3
";

struct TestEnv {
    tmp: TempDir,
    db: UguuDb,
    config: SpiderConfig,
}

impl TestEnv {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let db = UguuDb::open(tmp.path().join("uguu.sqlite3")).await.unwrap();
        db.insert_network("lan").await.unwrap();
        let config = SpiderConfig {
            save_dir: tmp.path().to_path_buf(),
            ..SpiderConfig::default()
        };
        Self { tmp, db, config }
    }

    async fn add_share(&self, host: &str) -> ScanJob {
        let scantype = self
            .db
            .insert_scantype(Protocol::Smb, "smbscan", 0)
            .await
            .unwrap();
        let share_id = self
            .db
            .insert_share(&NewShare {
                scantype_id: scantype,
                network: "lan".to_string(),
                protocol: Protocol::Smb,
                hostname: host.to_string(),
                port: 0,
                state: Availability::Online,
            })
            .await
            .unwrap();
        ScanJob {
            share_id,
            share: baseline::share_str(Protocol::Smb, host, 0),
            tree_id: None,
            save_path: baseline::save_path(self.tmp.path(), Protocol::Smb, host, 0),
            patch_requested: false,
        }
    }

    fn capture(&self, output: &str) -> CapturedScan {
        CapturedScan::from_output(output.as_bytes(), self.tmp.path(), 10_000).unwrap()
    }

    async fn scan(&self, job: &mut ScanJob, output: &str) -> uguu_spider::Result<ScanOutcome> {
        let outcome = reconcile(&self.db, &self.config, job, self.capture(output)).await?;
        job.tree_id = self.share_tree(job.share_id).await;
        job.patch_requested = job.tree_id.is_some() && job.save_path.is_file();
        Ok(outcome)
    }

    async fn share_tree(&self, share_id: i64) -> Option<i64> {
        self.db.get_share(share_id).await.unwrap().unwrap().tree_id
    }

    async fn snapshot(&self, tree_id: i64) -> (Vec<PathRow>, Vec<FileRow>) {
        (
            self.db.list_paths(tree_id).await.unwrap(),
            self.db.list_files(tree_id).await.unwrap(),
        )
    }
}

fn md5_hex(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

/// Apply `listing` as a full scan in a fresh catalog.
async fn full_snapshot(listing: &str) -> (Vec<PathRow>, Vec<FileRow>) {
    let env = TestEnv::new().await;
    let mut job = env.add_share("reference").await;
    env.scan(&mut job, listing).await.unwrap();
    env.snapshot(job.tree_id.unwrap()).await
}

fn assert_dense(files: &[FileRow]) {
    let mut expected = std::collections::HashMap::new();
    for file in files {
        let next = expected.entry(file.treepath_id).or_insert(0);
        assert_eq!(file.pathfile_id, *next, "gap under path {}", file.treepath_id);
        *next += 1;
    }
}

#[tokio::test]
async fn test_patch_matches_full_listing() {
    let l1 = "\
0 1
1 0 0 80 1 2
1 1 0 10 0 0 a.txt
1 1 1 70 2 2 dir
0 2 dir
1 2 0 35 0 0 c.mp3
1 2 1 35 0 0 d.txt
";
    let env = TestEnv::new().await;
    let mut job = env.add_share("fileserver").await;
    env.scan(&mut job, L0).await.unwrap();
    let tree_id = job.tree_id.unwrap();
    assert!(job.patch_requested);

    let output = format!(
        "* {}\n- 1 1 1 20 0 0 b.txt\n* 1 1 1 70 2 2 dir\n* 1 2 0 35 0 0 c.mp3\n+ 1 2 1 35 0 0 d.txt\n* 1 0 0 80 1 2 \n{}",
        md5_hex(L0),
        l1
    );
    let outcome = env.scan(&mut job, &output).await.unwrap();
    let ScanOutcome::Updated(stats) = &outcome else {
        panic!("expected update, got {:?}", outcome);
    };
    assert_eq!(stats.mode, ScanMode::Patch);
    assert_eq!(stats.to_string(), "delete 1, add 1, modify 2");

    // Updated in place
    assert_eq!(job.tree_id, Some(tree_id));
    let tree = env.db.get_tree(tree_id).await.unwrap().unwrap();
    assert_eq!(tree.hash, Some(md5_hex(l1)));
    assert_eq!(tree.size, 80);

    let patched = env.snapshot(tree_id).await;
    assert_dense(&patched.1);
    assert_eq!(patched, full_snapshot(l1).await);
}

#[tokio::test]
async fn test_rewritten_directory_is_merged() {
    let l2 = "\
0 1
1 0 0 65 1 3
1 1 0 10 0 0 a.txt
1 1 1 20 0 0 b.txt
1 1 2 35 2 2 folder
0 2 folder
1 2 0 5 0 0 e.txt
1 2 1 30 0 0 c.mp3
";
    let env = TestEnv::new().await;
    let mut job = env.add_share("fileserver").await;
    env.scan(&mut job, L0).await.unwrap();
    let tree_id = job.tree_id.unwrap();

    let output = format!(
        "* {}\n- 1 1 2 30 2 1 dir\n* 0 2 folder\n+ 1 2 0 5 0 0 e.txt\n+ 1 1 2 35 2 2 folder\n* 1 0 0 65 1 3 \n{}",
        md5_hex(L0),
        l2
    );
    let outcome = env.scan(&mut job, &output).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Updated(s) if s.mode == ScanMode::Patch));

    let patched = env.snapshot(tree_id).await;
    assert_dense(&patched.1);
    assert_eq!(patched, full_snapshot(l2).await);

    let (_, tspath) = env
        .db
        .file_search_text(tree_id, 2, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tspath, "folder");
}

#[tokio::test]
async fn test_deletes_in_rewritten_directory_use_old_slots() {
    let before = "\
0 1
1 0 0 200 1 5
1 1 0 10 0 0 a.txt
1 1 1 20 0 0 b.txt
1 1 2 30 0 0 c.txt
1 1 3 40 0 0 d.txt
1 1 4 100 0 0 big.iso
";
    let after = "\
0 1
1 0 0 150 1 3
1 1 0 10 0 0 a.txt
1 1 1 40 0 0 d.txt
1 1 2 100 0 0 big.iso
";
    let mut env = TestEnv::new().await;
    env.config.patch_fallback = 10.0;
    let mut job = env.add_share("fileserver").await;
    env.scan(&mut job, before).await.unwrap();
    let tree_id = job.tree_id.unwrap();

    let output = format!(
        "* {}\n* 0 1 \n- 1 1 1 20 0 0 b.txt\n- 1 1 2 30 0 0 c.txt\n* 1 0 0 150 1 3 \n{}",
        md5_hex(before),
        after
    );
    let outcome = env.scan(&mut job, &output).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Updated(s) if s.mode == ScanMode::Patch));

    let patched = env.snapshot(tree_id).await;
    assert_dense(&patched.1);
    let names: Vec<_> = patched.1.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["a.txt", "d.txt", "big.iso"]);
    assert_eq!(patched, full_snapshot(after).await);
}

#[tokio::test]
async fn test_bad_patch_rolls_back() {
    let env = TestEnv::new().await;
    let mut job = env.add_share("fileserver").await;
    env.scan(&mut job, L0).await.unwrap();
    let tree_id = job.tree_id.unwrap();
    let before = env.snapshot(tree_id).await;

    // Slot 9 does not exist
    let listing = L0.replace("1 1 1 20 0 0 b.txt", "1 1 1 21 0 0 b.txt");
    let output = format!(
        "* {}\n- 1 1 0 10 0 0 a.txt\n- 1 1 9 1 0 0 ghost\n{}",
        md5_hex(L0),
        listing
    );
    let err = env.scan(&mut job, &output).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);

    assert_eq!(env.snapshot(tree_id).await, before);
    let tree = env.db.get_tree(tree_id).await.unwrap().unwrap();
    assert_eq!(tree.hash, Some(md5_hex(L0)));
    // Baseline untouched
    assert_eq!(std::fs::read_to_string(&job.save_path).unwrap(), L0);
}

#[tokio::test]
async fn test_identical_shares_share_a_tree() {
    let env = TestEnv::new().await;
    let mut first = env.add_share("one").await;
    let mut second = env.add_share("two").await;

    env.scan(&mut first, L0).await.unwrap();
    let outcome = env.scan(&mut second, L0).await.unwrap();

    assert!(matches!(outcome, ScanOutcome::Deduplicated { tree_id } if Some(tree_id) == first.tree_id));
    assert_eq!(first.tree_id, second.tree_id);
    assert_eq!(env.db.count_trees().await.unwrap(), 1);
    let share = env.db.get_share(second.share_id).await.unwrap().unwrap();
    assert_eq!(share.size, 60);
}

#[tokio::test]
async fn test_shared_tree_is_not_rewritten() {
    let changed = "0 1 \n1 0 0 10 1 1 \n1 1 0 10 0 0 a.txt\n";
    let env = TestEnv::new().await;
    let mut first = env.add_share("one").await;
    let mut second = env.add_share("two").await;
    env.scan(&mut first, L0).await.unwrap();
    env.scan(&mut second, L0).await.unwrap();
    let shared = first.tree_id.unwrap();

    let outcome = env.scan(&mut second, changed).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Updated(s) if s.mode == ScanMode::Full));

    assert_ne!(second.tree_id, Some(shared));
    assert_eq!(env.db.get_tree(shared).await.unwrap().unwrap().hash, Some(md5_hex(L0)));
    assert_eq!(env.db.list_files(shared).await.unwrap().len(), 4);
    assert_eq!(env.db.count_trees().await.unwrap(), 2);

    // The last user moving away frees the old tree
    env.scan(&mut first, changed).await.unwrap();
    assert_eq!(first.tree_id, second.tree_id);
    assert!(env.db.get_tree(shared).await.unwrap().is_none());
}
