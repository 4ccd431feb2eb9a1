//! End-to-end diff scenarios.

use canopy_castore::{MemoryObjectStore, ObjectStore};
use canopy_mount::testutil::{name, repo_path, TestMount};
use canopy_mount::{FsError, ScmStatusCollector};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn clean_working_copy_diffs_empty() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("a", "1")
        .add_file("d/x", "2")
        .commit("r0");

    let t = TestMount::new(store, r0.clone()).await;
    let status = t.mount.status(&r0, false).await.unwrap();
    assert!(status.is_clean(), "{:?}", status);
}

#[tokio::test]
async fn modified_created_and_removed_paths_are_reported() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("a", "1")
        .add_file("d/x", "2")
        .add_file("d/y", "3")
        .commit("r0");

    let t = TestMount::new(store, r0.clone()).await;
    t.write_file("a", b"changed").await;
    t.create_file("d/new", b"fresh").await;
    t.tree("d").await.unlink(&name("y")).await.unwrap();

    let status = t.mount.status(&r0, false).await.unwrap();
    assert_eq!(
        status.modified.iter().collect::<Vec<_>>(),
        vec![&repo_path("a")]
    );
    assert_eq!(
        status.added.iter().collect::<Vec<_>>(),
        vec![&repo_path("d/new")]
    );
    assert_eq!(
        status.removed.iter().collect::<Vec<_>>(),
        vec![&repo_path("d/y")]
    );
    assert!(status.errors.is_empty());
}

#[tokio::test]
async fn rename_shows_up_as_removed_plus_added() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/x", "1").commit("r0");

    let t = TestMount::new(store, r0.clone()).await;
    t.mount
        .rename(&repo_path("d"), &name("x"), &repo_path("d"), &name("y"))
        .await
        .unwrap();

    let status = t.mount.status(&r0, false).await.unwrap();
    assert!(status.removed.contains(&repo_path("d/x")));
    assert!(status.added.contains(&repo_path("d/y")));
    assert!(status.modified.is_empty());
}

#[tokio::test]
async fn gitignore_classifies_untracked_files() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file(".gitignore", "*.log\n")
        .add_file("src/main.rs", "fn main() {}\n")
        .commit("r0");

    let t = TestMount::new(store, r0.clone()).await;
    t.create_file("build.log", b"noise").await;
    t.create_file("src/notes.txt", b"keep me").await;

    let status = t.mount.status(&r0, false).await.unwrap();
    assert!(status.added.contains(&repo_path("src/notes.txt")));
    assert!(!status.added.contains(&repo_path("build.log")));
    assert!(status.ignored.is_empty());

    let status = t.mount.status(&r0, true).await.unwrap();
    assert!(status.ignored.contains(&repo_path("build.log")));
}

#[tokio::test]
async fn nested_gitignore_files_chain() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file(".gitignore", "*.tmp\n")
        .add_file("sub/.gitignore", "!keep.tmp\n")
        .add_file("sub/code.rs", "x\n")
        .commit("r0");

    let t = TestMount::new(store, r0.clone()).await;
    t.create_file("sub/scratch.tmp", b"1").await;
    t.create_file("sub/keep.tmp", b"2").await;

    let status = t.mount.status(&r0, false).await.unwrap();
    // The inner negation re-includes keep.tmp; the outer rule still hides
    // scratch.tmp.
    assert!(status.added.contains(&repo_path("sub/keep.tmp")));
    assert!(!status.added.contains(&repo_path("sub/scratch.tmp")));
}

#[tokio::test]
async fn diff_against_other_commit_stays_on_the_store_fast_path() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("d/x", "old")
        .add_file("d/deep/y", "same")
        .commit("r0");
    let r1 = store
        .commit_builder()
        .add_file("d/x", "new")
        .add_file("d/deep/y", "same")
        .add_file("n", "added in r1")
        .commit("r1");

    let t = TestMount::new(store.clone(), r0).await;
    let status = t.mount.status(&r1, false).await.unwrap();

    assert!(status.modified.contains(&repo_path("d/x")));
    // Present in the target, absent in the working copy.
    assert!(status.removed.contains(&repo_path("n")));
    assert!(!status.modified.contains(&repo_path("d/deep/y")));

    // The whole comparison ran against the store: nothing was loaded into
    // the overlay and the root is still a pure source-control tree.
    assert!(!t.mount.root().is_materialized());
    assert_eq!(t.overlay.entry_count(), 0);
}

#[tokio::test]
async fn cancelled_diff_reports_nothing() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "1").commit("r0");

    let t = TestMount::new(store, r0.clone()).await;
    t.write_file("a", b"changed").await;

    let collector = ScmStatusCollector::new();
    let token = CancellationToken::new();
    token.cancel();
    t.mount
        .diff(&r0, collector.clone(), false, false, token)
        .await
        .unwrap();
    assert!(collector.status().is_clean());
    assert!(collector.status().modified.is_empty());
}

#[tokio::test]
async fn out_of_date_parent_is_rejected_when_enforced() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "1").commit("r0");
    let r1 = store.commit_builder().add_file("a", "2").commit("r1");

    let t = TestMount::new(store, r0).await;
    let collector = ScmStatusCollector::new();
    let result = t
        .mount
        .diff(
            &r1,
            collector,
            false,
            true,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(FsError::OutOfDateParent { .. })));
}

#[tokio::test]
async fn executable_bit_flip_reports_modified() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("tool", "#!/bin/sh\n").commit("r0");

    let t = TestMount::new(store, r0.clone()).await;
    t.file("tool").await.set_mode(0o100755).await.unwrap();

    let status = t.mount.status(&r0, false).await.unwrap();
    assert!(status.modified.contains(&repo_path("tool")));
}

#[tokio::test]
async fn untracked_directory_lists_all_files_as_added() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "1").commit("r0");

    let t = TestMount::new(store, r0.clone()).await;
    let root = t.tree("").await;
    let d = root.mkdir(name("d")).await.unwrap();
    d.create_file(name("one"), false, "1".into()).await.unwrap();
    let sub = d.mkdir(name("sub")).await.unwrap();
    sub.create_file(name("two"), false, "2".into())
        .await
        .unwrap();

    let status = t.mount.status(&r0, false).await.unwrap();
    assert!(status.added.contains(&repo_path("d/one")));
    assert!(status.added.contains(&repo_path("d/sub/two")));
}

#[tokio::test]
async fn per_subtree_errors_do_not_abort_sibling_work() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("good/a", "1")
        .add_file("lost/b", "2")
        .commit("r0");
    let r1 = store
        .commit_builder()
        .add_file("good/a", "changed")
        .add_file("lost/b", "also changed")
        .commit("r1");

    let t = TestMount::new(store.clone(), r0).await;

    // Make one subtree of the target commit unfetchable, so its deferred
    // comparison fails while the sibling's proceeds.
    let r1_tree = store.get_root_tree(&r1).await.unwrap();
    let lost_id = r1_tree.get(&name("lost")).unwrap().id().clone();
    store.remove_tree(&lost_id);

    let collector = ScmStatusCollector::new();
    t.mount
        .diff(
            &r1,
            collector.clone(),
            false,
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let status = collector.status();
    assert!(status.modified.contains(&repo_path("good/a")));
    assert!(status.errors.contains_key(&repo_path("lost")));
}
