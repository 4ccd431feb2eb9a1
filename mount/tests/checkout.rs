//! End-to-end checkout scenarios over the in-memory backends.

use bytes::Bytes;

use canopy_castore::{MemoryObjectStore, ObjectStore};
use canopy_mount::testutil::{name, repo_path, TestMount};
use canopy_mount::{ChannelKind, CheckoutMode, ConflictType, FsError, MountConfig};

#[tokio::test]
async fn clean_checkout_swaps_entries_without_materializing() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("a", "hello")
        .add_file("b", "world")
        .commit("r0");
    let r1 = store
        .commit_builder()
        .add_file("a", "hello")
        .add_file("b", "worlds")
        .commit("r1");

    let t = TestMount::new(store.clone(), r0.clone()).await;
    let result = t
        .mount
        .checkout(r1.clone(), CheckoutMode::Normal)
        .await
        .unwrap();

    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);
    assert!(result.errors.is_empty());
    assert_eq!(t.read_file("b").await, Bytes::from("worlds"));
    assert_eq!(t.read_file("a").await, Bytes::from("hello"));

    // The root stayed equivalent to a source-control tree throughout.
    assert!(!t.mount.root().is_materialized());
    let r1_tree = store.get_root_tree(&r1).await.unwrap();
    assert_eq!(t.mount.root().source_id().as_ref(), Some(r1_tree.id()));

    // Journal: one root transition, no unclean paths.
    let range = t.mount.journal().accumulate_range(1);
    assert_eq!(range.snapshot_transitions, vec![(r0, r1.clone())]);
    assert!(range.unclean_paths.is_empty());

    // The changed entry was invalidated in the kernel.
    assert!(t
        .channel
        .invalidated_entries()
        .iter()
        .any(|(_, n)| n == &name("b")));

    assert_eq!(t.mount.working_copy_parent(), r1);
    assert_eq!(t.mount.checked_out_root(), r1);
}

#[tokio::test]
async fn repeated_checkout_is_a_no_op() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "hello").commit("r0");
    let r1 = store.commit_builder().add_file("a", "hi").commit("r1");

    let t = TestMount::new(store, r0).await;
    t.mount
        .checkout(r1.clone(), CheckoutMode::Normal)
        .await
        .unwrap();
    let seq_after_first = t.mount.journal().latest_seq();
    t.channel.clear();

    let result = t
        .mount
        .checkout(r1.clone(), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());
    assert!(result.errors.is_empty());
    // Same parent, no changes: nothing journaled, nothing invalidated.
    assert_eq!(t.mount.journal().latest_seq(), seq_after_first);
    assert!(t.channel.invalidated_entries().is_empty());
    assert!(t.channel.invalidated_dirs().is_empty());
}

#[tokio::test]
async fn modified_file_conflicts_without_blocking_the_transition() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("a", "hello")
        .add_file("b", "world")
        .commit("r0");
    let r1 = store
        .commit_builder()
        .add_file("a", "hello")
        .add_file("b", "worlds")
        .commit("r1");

    let t = TestMount::new(store, r0.clone()).await;
    t.mount
        .checkout(r1.clone(), CheckoutMode::Normal)
        .await
        .unwrap();
    t.write_file("a", b"local edits").await;

    let result = t
        .mount
        .checkout(r0.clone(), CheckoutMode::Normal)
        .await
        .unwrap();

    assert_eq!(result.conflict_types(), vec![ConflictType::ModifiedModified]);
    assert_eq!(result.conflicts[0].path, repo_path("a"));
    // The conflict is informational; the parent still moved.
    assert_eq!(t.mount.working_copy_parent(), r0);
    // The local contents survived, the clean file reverted.
    assert_eq!(t.read_file("a").await, Bytes::from("local edits"));
    assert_eq!(t.read_file("b").await, Bytes::from("world"));
    assert!(t.mount.root().is_materialized());

    // The pre-checkout dirty path was recorded for journal readers.
    let range = t.mount.journal().accumulate_range(1);
    assert!(range.unclean_paths.contains(&repo_path("a")));
}

#[tokio::test]
async fn force_checkout_reverts_modified_files_and_dematerializes() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("a", "hello")
        .add_file("b", "world")
        .commit("r0");
    let r1 = store
        .commit_builder()
        .add_file("a", "hello")
        .add_file("b", "worlds")
        .commit("r1");

    let t = TestMount::new(store.clone(), r0.clone()).await;
    t.mount
        .checkout(r1, CheckoutMode::Normal)
        .await
        .unwrap();
    t.write_file("a", b"local edits").await;

    let result = t
        .mount
        .checkout(r0.clone(), CheckoutMode::Force)
        .await
        .unwrap();

    // Same conflicts as the normal mode run, but overridden.
    assert_eq!(result.conflict_types(), vec![ConflictType::ModifiedModified]);
    assert_eq!(t.read_file("a").await, Bytes::from("hello"));
    assert!(!t.file("a").await.is_materialized());

    let r0_tree = store.get_root_tree(&r0).await.unwrap();
    assert_eq!(t.mount.root().source_id().as_ref(), Some(r0_tree.id()));
}

#[tokio::test]
async fn untracked_file_conflicts_with_incoming_file() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().commit("r0");
    let r1 = store.commit_builder().add_file("a", "remote").commit("r1");

    let t = TestMount::new(store, r0).await;
    t.create_file("a", b"local").await;

    let result = t
        .mount
        .checkout(r1.clone(), CheckoutMode::Normal)
        .await
        .unwrap();

    assert_eq!(result.conflict_types(), vec![ConflictType::UntrackedAdded]);
    assert_eq!(result.conflicts[0].path, repo_path("a"));
    assert_eq!(t.read_file("a").await, Bytes::from("local"));
    assert!(t.file("a").await.is_materialized());
    assert_eq!(t.mount.working_copy_parent(), r1);
}

#[tokio::test]
async fn untracked_file_is_replaced_on_force() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().commit("r0");
    let r1 = store.commit_builder().add_file("a", "remote").commit("r1");

    let t = TestMount::new(store, r0).await;
    t.create_file("a", b"local").await;

    let result = t
        .mount
        .checkout(r1, CheckoutMode::Force)
        .await
        .unwrap();
    assert_eq!(result.conflict_types(), vec![ConflictType::UntrackedAdded]);
    assert_eq!(t.read_file("a").await, Bytes::from("remote"));
    assert!(!t.file("a").await.is_materialized());
}

#[tokio::test]
async fn touched_then_restored_subtree_dematerializes_on_force_checkout() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("d/x", "1")
        .add_file("d/y", "2")
        .commit("r0");

    let t = TestMount::new(store.clone(), r0.clone()).await;
    t.write_file("d/x", b"temporary").await;
    t.write_file("d/x", b"1").await;
    assert!(t.mount.root().is_materialized());

    let result = t
        .mount
        .checkout(r0.clone(), CheckoutMode::Force)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);

    assert!(!t.file("d/x").await.is_materialized());
    assert!(!t.tree("d").await.is_materialized());
    assert!(!t.mount.root().is_materialized());
    let r0_tree = store.get_root_tree(&r0).await.unwrap();
    assert_eq!(t.mount.root().source_id().as_ref(), Some(r0_tree.id()));
}

#[tokio::test]
async fn checkout_adds_and_removes_directories() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "1").commit("r0");
    let r1 = store
        .commit_builder()
        .add_file("a", "1")
        .add_file("d/x", "2")
        .add_file("d/y", "3")
        .commit("r1");

    let t = TestMount::new(store, r0.clone()).await;
    let result = t
        .mount
        .checkout(r1, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(t.read_file("d/x").await, Bytes::from("2"));

    let result = t
        .mount
        .checkout(r0, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);
    assert!(matches!(
        t.mount.resolve_inode(&repo_path("d")).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn removal_of_directory_with_untracked_file_reports_not_empty() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/x", "1").commit("r0");
    let r1 = store.commit_builder().add_file("keep", "k").commit("r1");

    let t = TestMount::new(store, r0).await;
    t.create_file("d/untracked", b"mine").await;

    let result = t
        .mount
        .checkout(r1, CheckoutMode::Normal)
        .await
        .unwrap();

    assert!(result
        .conflicts
        .iter()
        .any(|c| c.ty == ConflictType::DirectoryNotEmpty && c.path == repo_path("d")));
    // The tracked file went away, the untracked one survived in place.
    assert!(matches!(
        t.mount.resolve_inode(&repo_path("d/x")).await,
        Err(FsError::NotFound(_))
    ));
    assert_eq!(t.read_file("d/untracked").await, Bytes::from("mine"));
}

#[tokio::test]
async fn force_removal_sweeps_untracked_files() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/x", "1").commit("r0");
    let r1 = store.commit_builder().add_file("keep", "k").commit("r1");

    let t = TestMount::new(store, r0).await;
    t.create_file("d/untracked", b"mine").await;

    let result = t
        .mount
        .checkout(r1, CheckoutMode::Force)
        .await
        .unwrap();
    assert!(!result
        .conflicts
        .iter()
        .any(|c| c.ty == ConflictType::DirectoryNotEmpty));
    assert!(matches!(
        t.mount.resolve_inode(&repo_path("d")).await,
        Err(FsError::NotFound(_))
    ));
    assert_eq!(t.read_file("keep").await, Bytes::from("k"));
}

#[tokio::test]
async fn locally_removed_file_conflicts_when_target_changes_it() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "one").commit("r0");
    let r1 = store.commit_builder().add_file("a", "two").commit("r1");

    let t = TestMount::new(store, r0).await;
    t.tree("").await.unlink(&name("a")).await.unwrap();

    let result = t
        .mount
        .checkout(r1, CheckoutMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.conflict_types(), vec![ConflictType::RemovedModified]);
    // The local removal wins.
    assert!(matches!(
        t.mount.resolve_inode(&repo_path("a")).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn dry_run_reports_conflicts_without_writing() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "hello").commit("r0");
    let r1 = store.commit_builder().add_file("a", "other").commit("r1");

    let t = TestMount::new(store, r0.clone()).await;
    t.write_file("a", b"local").await;
    let seq_before = t.mount.journal().latest_seq();
    t.channel.clear();

    let result = t
        .mount
        .checkout(r1, CheckoutMode::DryRun)
        .await
        .unwrap();

    assert_eq!(result.conflict_types(), vec![ConflictType::ModifiedModified]);
    assert_eq!(t.read_file("a").await, Bytes::from("local"));
    assert_eq!(t.mount.working_copy_parent(), r0);
    assert_eq!(t.mount.journal().latest_seq(), seq_before);
    assert!(t.channel.invalidated_entries().is_empty());
}

#[tokio::test]
async fn projected_channel_invalidation_failures_become_checkout_errors() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "one").commit("r0");
    let r1 = store.commit_builder().add_file("a", "two").commit("r1");

    let t = TestMount::with_config(
        store,
        r0,
        MountConfig::default(),
        ChannelKind::Projected,
    )
    .await;
    t.channel.fail_invalidations(true);

    let result = t
        .mount
        .checkout(r1, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(!result.errors.is_empty());
    assert!(matches!(result.errors[0].error, FsError::Channel(_)));
}

#[tokio::test]
async fn fuse_channel_invalidation_failures_are_only_logged() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "one").commit("r0");
    let r1 = store.commit_builder().add_file("a", "two").commit("r1");

    let t = TestMount::new(store, r0).await;
    t.channel.fail_invalidations(true);

    let result = t
        .mount
        .checkout(r1, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn reset_parent_moves_the_parent_without_touching_files() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "one").commit("r0");
    let r1 = store.commit_builder().add_file("a", "two").commit("r1");

    let t = TestMount::new(store, r0.clone()).await;
    t.mount.reset_parent(r1.clone()).unwrap();

    assert_eq!(t.mount.working_copy_parent(), r1);
    assert_eq!(t.mount.checked_out_root(), r0);
    assert_eq!(t.read_file("a").await, Bytes::from("one"));
    let range = t.mount.journal().accumulate_range(1);
    assert_eq!(range.snapshot_transitions, vec![(r0, r1)]);
}
