//! Inode tree behavior: loads, lookups, mutation operations, readdir,
//! unload and takeover snapshots.

use bytes::Bytes;

use canopy_castore::MemoryObjectStore;
use canopy_mount::inodes::lookup::resolve_path;
use canopy_mount::testutil::{name, repo_path, TestMount};
use canopy_mount::{
    readdir_offset_for, FsError, Inode, InodeOrTreeOrEntry, Mount, MountConfig, Overlay,
    ROOT_INO,
};

#[tokio::test]
async fn racing_loads_share_one_fetch_and_one_inode() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("d/x", "1")
        .commit("r0");

    let t = TestMount::new(store.clone(), r0).await;
    let fetches_before = t.store.tree_fetch_count();
    let root = t.mount.root().clone();

    let n = name("d");
    let (a, b) = tokio::join!(root.get_or_load_child(&n), root.get_or_load_child(&n),);
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.ino(), b.ino());
    assert!(std::sync::Arc::ptr_eq(
        a.as_tree().unwrap(),
        b.as_tree().unwrap()
    ));
    assert_eq!(t.store.tree_fetch_count() - fetches_before, 1);
}

#[tokio::test]
async fn read_only_lookup_allocates_no_inodes() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("d/sub/x", "payload")
        .commit("r0");

    let t = TestMount::new(store, r0).await;
    let resolved = resolve_path(t.mount.root(), &repo_path("d/sub/x"))
        .await
        .unwrap();
    assert!(matches!(resolved, InodeOrTreeOrEntry::Entry { .. }));

    let attr = t.mount.getattr(&repo_path("d/sub/x")).await.unwrap();
    assert_eq!(attr.size, "payload".len() as u64);
    assert!(!attr.is_dir);

    // The fast path must not have materialized or loaded anything.
    assert!(!t.mount.root().is_materialized());
    assert_eq!(t.overlay.entry_count(), 0);
}

#[tokio::test]
async fn write_materializes_file_and_every_ancestor() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/sub/x", "1").commit("r0");

    let t = TestMount::new(store, r0).await;
    t.write_file("d/sub/x", b"2").await;

    assert!(t.file("d/sub/x").await.is_materialized());
    assert!(t.tree("d/sub").await.is_materialized());
    assert!(t.tree("d").await.is_materialized());
    assert!(t.mount.root().is_materialized());
    assert_eq!(t.read_file("d/sub/x").await, Bytes::from("2"));

    // The journal saw the write.
    let range = t.mount.journal().accumulate_range(1);
    assert!(range.changed_paths.contains_key(&repo_path("d/sub/x")));
}

#[tokio::test]
async fn overlay_survives_a_remount() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "clean").commit("r0");

    let t = TestMount::new(store.clone(), r0.clone()).await;
    t.write_file("a", b"dirty").await;
    t.mount.shutdown().await.unwrap();

    let channel = canopy_mount::testutil::TestChannel::new(canopy_mount::ChannelKind::Fuse);
    let remount = Mount::new(
        store.clone(),
        t.overlay.clone(),
        channel,
        MountConfig::default(),
        r0,
    )
    .await
    .unwrap();

    assert!(remount.root().is_materialized());
    let file = match remount.resolve_inode(&repo_path("a")).await.unwrap() {
        Inode::File(file) => file,
        Inode::Tree(_) => panic!("a is a file"),
    };
    assert_eq!(file.read_all().await.unwrap(), Bytes::from("dirty"));
}

#[tokio::test]
async fn unlink_removes_entries_and_rejects_directories() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("a", "1")
        .add_file("d/x", "2")
        .commit("r0");

    let t = TestMount::new(store, r0).await;
    let root = t.tree("").await;

    root.unlink(&name("a")).await.unwrap();
    assert!(matches!(
        t.mount.resolve_inode(&repo_path("a")).await,
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        root.unlink(&name("d")).await,
        Err(FsError::IsADirectory(_))
    ));

    let range = t.mount.journal().accumulate_range(1);
    let info = range.changed_paths[&repo_path("a")];
    assert!(info.existed_before && !info.existed_after);
}

#[tokio::test]
async fn rmdir_requires_an_empty_directory() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/x", "1").commit("r0");

    let t = TestMount::new(store, r0).await;
    let root = t.tree("").await;

    assert!(matches!(
        root.rmdir(&name("d")).await,
        Err(FsError::NotEmpty(_))
    ));

    t.tree("d").await.unlink(&name("x")).await.unwrap();
    root.rmdir(&name("d")).await.unwrap();
    assert!(matches!(
        t.mount.resolve_inode(&repo_path("d")).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn rename_moves_the_loaded_inode_and_journals() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("d/x", "1")
        .add_file("e/existing", "2")
        .commit("r0");

    let t = TestMount::new(store, r0).await;
    let file = t.file("d/x").await;

    t.mount
        .rename(&repo_path("d"), &name("x"), &repo_path("e"), &name("moved"))
        .await
        .unwrap();

    // The loaded inode followed the rename.
    assert_eq!(file.path(), Some(repo_path("e/moved")));
    assert_eq!(t.read_file("e/moved").await, Bytes::from("1"));
    assert!(t.tree("d").await.is_materialized());
    assert!(t.tree("e").await.is_materialized());

    let range = t.mount.journal().accumulate_range(1);
    assert!(range
        .changed_paths
        .get(&repo_path("d/x"))
        .is_some_and(|info| !info.existed_after));
    assert!(range
        .changed_paths
        .get(&repo_path("e/moved"))
        .is_some_and(|info| info.existed_after));
}

#[tokio::test]
async fn rename_over_existing_file_records_a_replacement() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("a", "1")
        .add_file("b", "2")
        .commit("r0");

    let t = TestMount::new(store, r0).await;
    t.mount
        .rename(
            &repo_path(""),
            &name("a"),
            &repo_path(""),
            &name("b"),
        )
        .await
        .unwrap();

    assert_eq!(t.read_file("b").await, Bytes::from("1"));
    assert!(matches!(
        t.mount.resolve_inode(&repo_path("a")).await,
        Err(FsError::NotFound(_))
    ));

    let range = t.mount.journal().accumulate_range(1);
    let a = range.changed_paths[&repo_path("a")];
    assert!(a.existed_before && !a.existed_after);
    let b = range.changed_paths[&repo_path("b")];
    assert!(b.existed_after);
}

#[tokio::test]
async fn rename_into_nonempty_directory_fails() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("src/x", "1")
        .add_file("dst/keep", "2")
        .commit("r0");

    let t = TestMount::new(store, r0).await;
    let result = t
        .mount
        .rename(&repo_path(""), &name("src"), &repo_path(""), &name("dst"))
        .await;
    assert!(matches!(result, Err(FsError::NotEmpty(_))));
}

#[tokio::test]
async fn readdir_resumes_without_skips_or_duplicates() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("a", "1")
        .add_file("c", "2")
        .commit("r0");

    let t = TestMount::new(store, r0).await;
    let root = t.tree("").await;

    let full = root.readdir(0);
    assert_eq!(full[0].name, Bytes::from_static(b"."));
    assert_eq!(full[0].ino, ROOT_INO);
    assert_eq!(full[1].name, Bytes::from_static(b".."));
    let names: Vec<_> = full[2..].iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec![Bytes::from_static(b"a"), Bytes::from_static(b"c")]);

    // Resume after `a`, with an entry inserted in between meanwhile.
    let a_offset = full[2].offset;
    assert_eq!(a_offset, readdir_offset_for(full[2].ino));
    t.create_file("b", b"3").await;

    let resumed = root.readdir(a_offset);
    let names: Vec<_> = resumed.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
}

#[tokio::test]
async fn reserved_control_name_is_rejected_at_the_root() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/x", "1").commit("r0");

    let t = TestMount::new(store, r0).await;
    let root = t.tree("").await;

    assert!(matches!(
        root.mkdir(name(".canopy")).await,
        Err(FsError::PermissionDenied(_))
    ));
    assert!(matches!(
        root.create_file(name(".canopy"), false, Bytes::new()).await,
        Err(FsError::PermissionDenied(_))
    ));
    // Only the root reserves the name.
    t.tree("d").await.mkdir(name(".canopy")).await.unwrap();
}

#[tokio::test]
async fn symlinks_resolve_within_the_mount() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_file("real/target.txt", "payload")
        .add_symlink("link", "real/target.txt")
        .commit("r0");

    let t = TestMount::new(store, r0).await;
    let link = t.file("link").await;
    assert!(link.is_symlink());
    assert_eq!(
        link.readlink().await.unwrap(),
        Bytes::from("real/target.txt")
    );

    let resolved = t
        .mount
        .resolve_following_symlinks(&repo_path("link"))
        .await
        .unwrap();
    match resolved {
        Inode::File(file) => {
            assert_eq!(file.read_all().await.unwrap(), Bytes::from("payload"))
        }
        Inode::Tree(_) => panic!("expected a file"),
    }
}

#[tokio::test]
async fn symlink_cycles_are_detected() {
    let store = MemoryObjectStore::new();
    let r0 = store
        .commit_builder()
        .add_symlink("one", "two")
        .add_symlink("two", "one")
        .commit("r0");

    let t = TestMount::new(store, r0).await;
    let result = t
        .mount
        .resolve_following_symlinks(&repo_path("one"))
        .await;
    assert!(matches!(result, Err(FsError::TooManySymlinks(_))));
}

#[tokio::test]
async fn unloaded_inodes_reload_with_the_same_number() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/x", "1").commit("r0");

    let t = TestMount::new(store, r0).await;
    let ino_before = t.tree("d").await.ino();

    let unloaded = t.mount.unload_free_inodes().await;
    assert!(unloaded >= 1);

    assert_eq!(t.tree("d").await.ino(), ino_before);
}

#[tokio::test]
async fn shutdown_snapshot_round_trips_through_the_overlay() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/x", "1").commit("r0");

    let t = TestMount::new(store.clone(), r0.clone()).await;
    let d_ino = t.tree("d").await.ino();
    t.mount.unload_free_inodes().await;
    t.mount.shutdown().await.unwrap();

    let channel = canopy_mount::testutil::TestChannel::new(canopy_mount::ChannelKind::Fuse);
    let remount = Mount::new(
        store,
        t.overlay.clone(),
        channel,
        MountConfig::default(),
        r0,
    )
    .await
    .unwrap();

    // The snapshot carried the unloaded inode's number forward.
    let snapshot = t.overlay.load_snapshot().await.unwrap().unwrap();
    assert!(snapshot.unloaded.iter().any(|(ino, _, _)| *ino == d_ino));

    // The previous generation is stale.
    assert!(matches!(
        remount.check_generation(t.mount.generation()),
        Err(FsError::MountGenerationChanged { .. })
    ));
    remount.check_generation(remount.generation()).unwrap();
}

#[tokio::test]
async fn kernel_referenced_inodes_are_not_unloaded() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("d/x", "1").commit("r0");

    let t = TestMount::new(store, r0).await;
    let d = t.tree("d").await;
    d.kernel_ref();
    drop(d);

    assert_eq!(t.mount.unload_free_inodes().await, 0);

    t.tree("d").await.kernel_unref(1);
    assert_eq!(t.mount.unload_free_inodes().await, 1);
}

#[tokio::test]
async fn case_insensitive_mounts_resolve_either_casing() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("README", "docs").commit("r0");

    let config = MountConfig {
        case_sensitive: false,
        ..MountConfig::default()
    };
    let t = TestMount::with_config(store, r0, config, canopy_mount::ChannelKind::Fuse).await;

    let file = match t.mount.resolve_inode(&repo_path("readme")).await.unwrap() {
        Inode::File(file) => file,
        Inode::Tree(_) => panic!("expected a file"),
    };
    assert_eq!(file.read_all().await.unwrap(), Bytes::from("docs"));
}

#[tokio::test]
async fn pending_notification_wait_returns_when_idle() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "1").commit("r0");

    let t = TestMount::new(store, r0).await;
    t.write_file("a", b"2").await;
    t.mount
        .wait_for_pending_notifications(std::time::Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn journal_eviction_surfaces_as_truncation() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().add_file("a", "1").commit("r0");

    let config = MountConfig {
        // Small enough that a handful of writes evicts the oldest records.
        journal_memory_limit: 200,
        ..MountConfig::default()
    };
    let t = TestMount::with_config(store, r0, config, canopy_mount::ChannelKind::Fuse).await;
    for _ in 0..8 {
        t.write_file("a", b"churn").await;
    }

    assert!(matches!(
        t.mount.journal_delta_since(1),
        Err(FsError::JournalTruncated(1))
    ));
    let latest = t.mount.journal().latest_seq();
    let recent = t.mount.journal_delta_since(latest).unwrap();
    assert!(!recent.is_truncated);
}

#[tokio::test]
async fn journal_records_creation_kinds() {
    let store = MemoryObjectStore::new();
    let r0 = store.commit_builder().commit("r0");

    let t = TestMount::new(store, r0).await;
    t.tree("").await.mkdir(name("d")).await.unwrap();
    t.create_file("d/f", b"1").await;

    let range = t.mount.journal().accumulate_range(1);
    let d = range.changed_paths[&repo_path("d")];
    assert!(!d.existed_before && d.existed_after);
    let f = range.changed_paths[&repo_path("d/f")];
    assert!(!f.existed_before && f.existed_after);
    assert_eq!(range.to_seq, 2);

    // A range starting past the mkdir only sees the file creation.
    let tail = t.mount.journal().accumulate_range(2);
    assert_eq!(tail.changed_paths.len(), 1);
    assert!(tail.changed_paths.contains_key(&repo_path("d/f")));
}
