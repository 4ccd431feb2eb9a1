//! Shared harness for unit and integration tests: a mount wired to the
//! in-memory object store, overlay and a recording channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use canopy_castore::{MemoryObjectStore, PathComponent, RelativePathBuf, RootId};

use crate::channel::{Channel, ChannelKind};
use crate::errors::FsError;
use crate::inodes::{FileInode, Inode, InodeNumber, TreeInode};
use crate::mount::{Mount, MountConfig};
use crate::overlay::MemoryOverlay;

/// A [Channel] double that records every invalidation and can be told to
/// fail them.
pub struct TestChannel {
    kind: ChannelKind,
    invalidated_entries: Mutex<Vec<(InodeNumber, PathComponent)>>,
    invalidated_dirs: Mutex<Vec<InodeNumber>>,
    fail_invalidations: AtomicBool,
}

impl TestChannel {
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            invalidated_entries: Mutex::new(Vec::new()),
            invalidated_dirs: Mutex::new(Vec::new()),
            fail_invalidations: AtomicBool::new(false),
        })
    }

    pub fn fail_invalidations(&self, fail: bool) {
        self.fail_invalidations.store(fail, Ordering::SeqCst);
    }

    pub fn invalidated_entries(&self) -> Vec<(InodeNumber, PathComponent)> {
        self.invalidated_entries.lock().clone()
    }

    pub fn invalidated_dirs(&self) -> Vec<InodeNumber> {
        self.invalidated_dirs.lock().clone()
    }

    pub fn clear(&self) {
        self.invalidated_entries.lock().clear();
        self.invalidated_dirs.lock().clear();
    }
}

#[async_trait]
impl Channel for TestChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn invalidate_entry(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> Result<(), FsError> {
        if self.fail_invalidations.load(Ordering::SeqCst) {
            return Err(FsError::Channel("injected invalidation failure".to_string()));
        }
        self.invalidated_entries.lock().push((parent, name.clone()));
        Ok(())
    }

    async fn invalidate_dir(&self, ino: InodeNumber) -> Result<(), FsError> {
        if self.fail_invalidations.load(Ordering::SeqCst) {
            return Err(FsError::Channel("injected invalidation failure".to_string()));
        }
        self.invalidated_dirs.lock().push(ino);
        Ok(())
    }

    async fn flush_invalidations(&self) -> Result<(), FsError> {
        Ok(())
    }
}

/// Parses a test path literal.
pub fn repo_path(s: &str) -> RelativePathBuf {
    s.parse().expect("valid test path")
}

/// Parses a test path component literal.
pub fn name(s: &str) -> PathComponent {
    PathComponent::try_from(s).expect("valid test component")
}

/// A fully wired mount over in-memory backends.
pub struct TestMount {
    pub store: Arc<MemoryObjectStore>,
    pub overlay: Arc<MemoryOverlay>,
    pub channel: Arc<TestChannel>,
    pub mount: Mount,
}

impl TestMount {
    /// Mounts `root`, which must already exist in `store`.
    pub async fn new(store: Arc<MemoryObjectStore>, root: RootId) -> TestMount {
        Self::with_config(store, root, MountConfig::default(), ChannelKind::Fuse).await
    }

    pub async fn with_config(
        store: Arc<MemoryObjectStore>,
        root: RootId,
        config: MountConfig,
        channel_kind: ChannelKind,
    ) -> TestMount {
        let overlay = MemoryOverlay::new();
        let channel = TestChannel::new(channel_kind);
        let mount = Mount::new(
            store.clone(),
            overlay.clone(),
            channel.clone(),
            config,
            root,
        )
        .await
        .expect("mount succeeds");
        TestMount {
            store,
            overlay,
            channel,
            mount,
        }
    }

    pub async fn tree(&self, path: &str) -> Arc<TreeInode> {
        match self.mount.resolve_inode(&repo_path(path)).await {
            Ok(Inode::Tree(tree)) => tree,
            Ok(Inode::File(_)) => panic!("{} is a file", path),
            Err(error) => panic!("failed to resolve {}: {}", path, error),
        }
    }

    pub async fn file(&self, path: &str) -> Arc<FileInode> {
        match self.mount.resolve_inode(&repo_path(path)).await {
            Ok(Inode::File(file)) => file,
            Ok(Inode::Tree(_)) => panic!("{} is a directory", path),
            Err(error) => panic!("failed to resolve {}: {}", path, error),
        }
    }

    /// Overwrites a tracked file with new contents, materializing it.
    pub async fn write_file(&self, path: &str, contents: &[u8]) {
        let file = self.file(path).await;
        file.write(0, contents).await.expect("write succeeds");
        file.truncate(contents.len() as u64)
            .await
            .expect("truncate succeeds");
    }

    /// Creates a new file under an existing directory.
    pub async fn create_file(&self, path: &str, contents: &[u8]) {
        let path = repo_path(path);
        let parent = match path.parent() {
            Some(parent) => parent,
            None => panic!("cannot create the root"),
        };
        let parent = match self
            .mount
            .resolve_inode(&parent)
            .await
            .expect("parent resolves")
        {
            Inode::Tree(tree) => tree,
            Inode::File(_) => panic!("parent is a file"),
        };
        parent
            .create_file(
                path.file_name().expect("path has a name"),
                false,
                Bytes::copy_from_slice(contents),
            )
            .await
            .expect("create succeeds");
    }

    pub async fn read_file(&self, path: &str) -> Bytes {
        self.file(path).await.read_all().await.expect("read succeeds")
    }
}
