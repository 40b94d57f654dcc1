//! Catalog transaction tests: slot density, merges, tree store.

use tempfile::TempDir;
use uguu_db::{
    Availability, CatalogTx, FileType, NewFile, NewShare, Protocol, UguuDb, INSERT_BATCH_ROWS,
};

struct TestEnv {
    _tmp: TempDir,
    db: UguuDb,
}

impl TestEnv {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let db = UguuDb::open(tmp.path().join("uguu.sqlite3")).await.unwrap();
        db.insert_network("lan").await.unwrap();
        Self { _tmp: tmp, db }
    }

    async fn add_share(&self, host: &str) -> i64 {
        let scantype = self
            .db
            .insert_scantype(Protocol::Smb, "smbscan", -1)
            .await
            .unwrap();
        self.db
            .insert_share(&NewShare {
                scantype_id: scantype,
                network: "lan".to_string(),
                protocol: Protocol::Smb,
                hostname: host.to_string(),
                port: 0,
                state: Availability::Online,
            })
            .await
            .unwrap()
    }

    /// Tree with one directory (path 1) holding the given names at slots 0..n.
    async fn tree_with_files(&self, hash: &str, names: &[&str]) -> i64 {
        let mut tx = self.db.begin_catalog().await.unwrap();
        let tree = tx.resolve_or_create(hash).await.unwrap();
        tx.insert_path(tree.tree_id, 1, "").await.unwrap();
        for (slot, name) in names.iter().enumerate() {
            tx.append_file(tree.tree_id, file(1, slot as i64, 0, name))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        tree.tree_id
    }

    async fn names(&self, tree_id: i64, treepath_id: i64) -> Vec<(i64, String)> {
        self.db
            .list_files(tree_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|f| f.treepath_id == treepath_id)
            .map(|f| (f.pathfile_id, f.name))
            .collect()
    }
}

fn file(treepath_id: i64, slot: i64, treedir_id: i64, name: &str) -> NewFile {
    NewFile {
        treepath_id,
        pathfile_id: slot,
        treedir_id,
        size: 10,
        name: name.to_string(),
        file_type: FileType::classify(name, treedir_id),
        tsname: name.replace('.', " "),
        tspath: String::new(),
    }
}

fn owned(pairs: &[(i64, &str)]) -> Vec<(i64, String)> {
    pairs.iter().map(|(s, n)| (*s, n.to_string())).collect()
}

#[tokio::test]
async fn test_delete_renumbers_following_slots() {
    let env = TestEnv::new().await;
    let tree = env
        .tree_with_files("h1", &["a.mp3", "b.mp3", "c.avi", "d.iso"])
        .await;

    let mut tx = env.db.begin_catalog().await.unwrap();
    tx.delete_file(tree, 1, 1).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        env.names(tree, 1).await,
        owned(&[(0, "a.mp3"), (1, "c.avi"), (2, "d.iso")])
    );
}

#[tokio::test]
async fn test_delete_shifts_linked_directories() {
    let env = TestEnv::new().await;
    let mut tx = env.db.begin_catalog().await.unwrap();
    let tree = tx.resolve_or_create("h2").await.unwrap().tree_id;
    tx.insert_path(tree, 1, "").await.unwrap();
    tx.insert_path(tree, 2, "docs").await.unwrap();
    tx.append_file(tree, file(1, 0, 0, "a.txt")).await.unwrap();
    tx.append_file(tree, file(1, 1, 0, "b.txt")).await.unwrap();
    tx.append_file(tree, file(1, 2, 2, "docs")).await.unwrap();
    assert!(tx.link_directory(tree, 2, Some((1, 2)), 0, 0).await.unwrap());
    tx.commit().await.unwrap();

    let mut tx = env.db.begin_catalog().await.unwrap();
    tx.delete_file(tree, 1, 0).await.unwrap();
    tx.commit().await.unwrap();

    let paths = env.db.list_paths(tree).await.unwrap();
    let docs = paths.iter().find(|p| p.treepath_id == 2).unwrap();
    assert_eq!(docs.parent_id, Some(1));
    assert_eq!(docs.parentfile_id, Some(1));
}

#[tokio::test]
async fn test_delete_of_missing_slot_is_integrity_violation() {
    let env = TestEnv::new().await;
    let tree = env.tree_with_files("h3", &["a.mp3"]).await;

    let mut tx = env.db.begin_catalog().await.unwrap();
    let err = tx.delete_file(tree, 1, 4).await.unwrap_err();
    assert!(err.is_integrity_violation());
}

#[tokio::test]
async fn test_merge_interleaves_staged_and_surviving_rows() {
    let env = TestEnv::new().await;
    let mut tx = env.db.begin_catalog().await.unwrap();
    let tree = tx.resolve_or_create("h4").await.unwrap().tree_id;
    tx.insert_path(tree, 1, "old").await.unwrap();
    tx.insert_path(tree, 2, "old/sub").await.unwrap();
    tx.append_file(tree, file(1, 0, 0, "x0.txt")).await.unwrap();
    tx.append_file(tree, file(1, 1, 0, "x1.txt")).await.unwrap();
    tx.append_file(tree, file(1, 2, 2, "sub")).await.unwrap();
    tx.link_directory(tree, 2, Some((1, 2)), 0, 0).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = env.db.begin_catalog().await.unwrap();
    tx.rename_path(tree, 1, "new").await.unwrap();
    let staged = vec![file(1, 1, 0, "n1.txt"), file(1, 3, 0, "n3.txt")];
    tx.merge_staged_files(tree, 1, "new", staged).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        env.names(tree, 1).await,
        owned(&[
            (0, "x0.txt"),
            (1, "n1.txt"),
            (2, "x1.txt"),
            (3, "n3.txt"),
            (4, "sub"),
        ])
    );
    let sub = env
        .db
        .list_paths(tree)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.treepath_id == 2)
        .unwrap();
    assert_eq!(sub.parentfile_id, Some(4));

    let (_, tspath) = env.db.file_search_text(tree, 1, 0).await.unwrap().unwrap();
    assert_eq!(tspath, "new");
}

#[tokio::test]
async fn test_merge_rejects_slot_outside_range() {
    let env = TestEnv::new().await;
    let tree = env.tree_with_files("h5", &["a.mp3", "b.mp3"]).await;

    let mut tx = env.db.begin_catalog().await.unwrap();
    let staged = vec![file(1, 7, 0, "late.mp3")];
    let err = tx.merge_staged_files(tree, 1, "", staged).await.unwrap_err();
    assert!(err.is_integrity_violation());

    let mut tx = env.db.begin_catalog().await.unwrap();
    let staged = vec![file(1, 0, 0, "a2.mp3"), file(1, 0, 0, "a3.mp3")];
    let err = tx.merge_staged_files(tree, 1, "", staged).await.unwrap_err();
    assert!(err.is_integrity_violation());
}

#[tokio::test]
async fn test_batched_inserts_cross_flush_boundary() {
    let env = TestEnv::new().await;
    let count = INSERT_BATCH_ROWS * 2 + 3;
    let names: Vec<String> = (0..count).map(|i| format!("f{}.bin", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();

    let tree = env.tree_with_files("h6", &refs).await;

    let files = env.db.list_files(tree).await.unwrap();
    assert_eq!(files.len(), count);
    for (expected, row) in files.iter().enumerate() {
        assert_eq!(row.pathfile_id, expected as i64);
    }
    assert_eq!(files[0].file_type, Some(FileType::CdImage));
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let env = TestEnv::new().await;

    {
        let mut tx: CatalogTx = env.db.begin_catalog().await.unwrap();
        let tree = tx.resolve_or_create("h7").await.unwrap();
        tx.insert_path(tree.tree_id, 1, "gone").await.unwrap();
    }

    assert_eq!(env.db.count_trees().await.unwrap(), 0);
}

#[tokio::test]
async fn test_resolve_or_create_reuses_digest() {
    let env = TestEnv::new().await;

    let mut tx = env.db.begin_catalog().await.unwrap();
    let first = tx.resolve_or_create("same").await.unwrap();
    assert!(first.is_new());
    tx.set_tree_size(first.tree_id, 42).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = env.db.begin_catalog().await.unwrap();
    let second = tx.resolve_or_create("same").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(second.tree_id, first.tree_id);
    assert_eq!(second.size, Some(42));
    assert_eq!(env.db.count_trees().await.unwrap(), 1);
}

#[tokio::test]
async fn test_release_tree_keeps_referenced_trees() {
    let env = TestEnv::new().await;
    let share = env.add_share("alpha").await;
    let tree = env.tree_with_files("h8", &["a.mp3"]).await;

    let mut tx = env.db.begin_catalog().await.unwrap();
    tx.set_share_tree(share, Some(tree)).await.unwrap();
    assert!(!tx.release_tree(tree).await.unwrap());
    tx.commit().await.unwrap();
    assert!(env.db.get_tree(tree).await.unwrap().is_some());

    let mut tx = env.db.begin_catalog().await.unwrap();
    tx.set_share_tree(share, None).await.unwrap();
    assert!(tx.release_tree(tree).await.unwrap());
    tx.commit().await.unwrap();

    assert!(env.db.get_tree(tree).await.unwrap().is_none());
    assert!(env.db.list_files(tree).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_claims_let_one_through() {
    let env = TestEnv::new().await;
    let share = env.add_share("alpha").await;
    let other = env.db.clone();

    let (a, b) = tokio::join!(
        env.db.claim_share(share, 1_000, 99_000),
        other.claim_share(share, 1_000, 99_000)
    );

    let winners = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
    assert_eq!(winners, 1);
}
