use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{DirContents, InodeMapSnapshot, Overlay};
use crate::errors::FsError;
use crate::inodes::{InodeNumber, ROOT_INO};

/// An in-memory [Overlay], used by every test and as the reference for the
/// trait's atomicity semantics: each map insert replaces the whole value.
pub struct MemoryOverlay {
    dirs: RwLock<HashMap<InodeNumber, DirContents>>,
    files: RwLock<HashMap<InodeNumber, Bytes>>,
    snapshot: RwLock<Option<InodeMapSnapshot>>,
    next_inode: AtomicU64,
}

impl MemoryOverlay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dirs: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(None),
            next_inode: AtomicU64::new(ROOT_INO.0 + 1),
        })
    }

    /// Test helper: how many inodes currently have overlay data.
    pub fn entry_count(&self) -> usize {
        self.dirs.read().len() + self.files.read().len()
    }
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn allocate_inode_number(&self) -> InodeNumber {
        InodeNumber(self.next_inode.fetch_add(1, Ordering::SeqCst))
    }

    async fn save_dir(&self, ino: InodeNumber, contents: DirContents) -> Result<(), FsError> {
        self.dirs.write().insert(ino, contents);
        Ok(())
    }

    async fn load_dir(&self, ino: InodeNumber) -> Result<Option<DirContents>, FsError> {
        Ok(self.dirs.read().get(&ino).cloned())
    }

    async fn write_file(&self, ino: InodeNumber, contents: Bytes) -> Result<(), FsError> {
        self.files.write().insert(ino, contents);
        Ok(())
    }

    async fn read_file(&self, ino: InodeNumber) -> Result<Option<Bytes>, FsError> {
        Ok(self.files.read().get(&ino).cloned())
    }

    async fn remove_overlay_data(&self, ino: InodeNumber) -> Result<(), FsError> {
        self.dirs.write().remove(&ino);
        self.files.write().remove(&ino);
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: InodeMapSnapshot) -> Result<(), FsError> {
        *self.snapshot.write() = Some(snapshot);
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<InodeMapSnapshot>, FsError> {
        Ok(self.snapshot.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::recursively_remove;
    use crate::overlay::OverlayDirEntry;
    use canopy_castore::{EntryType, PathComponent};

    #[tokio::test]
    async fn inode_numbers_are_monotonic() {
        let overlay = MemoryOverlay::new();
        let a = overlay.allocate_inode_number();
        let b = overlay.allocate_inode_number();
        assert!(b > a);
        assert!(a > ROOT_INO);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let overlay = MemoryOverlay::new();
        let ino = overlay.allocate_inode_number();
        overlay.write_file(ino, Bytes::from("data")).await.unwrap();
        overlay.remove_overlay_data(ino).await.unwrap();
        overlay.remove_overlay_data(ino).await.unwrap();
        assert_eq!(overlay.read_file(ino).await.unwrap(), None);
    }

    #[tokio::test]
    async fn recursive_remove_follows_dir_links() {
        let overlay = MemoryOverlay::new();
        let dir = overlay.allocate_inode_number();
        let child = overlay.allocate_inode_number();
        overlay
            .write_file(child, Bytes::from("child data"))
            .await
            .unwrap();
        overlay
            .save_dir(
                dir,
                DirContents {
                    source_id: None,
                    entries: vec![OverlayDirEntry {
                        name: PathComponent::try_from("f").unwrap(),
                        ino: child,
                        ty: EntryType::RegularFile,
                        mode: EntryType::RegularFile.initial_mode(),
                        source_id: None,
                    }],
                },
            )
            .await
            .unwrap();

        recursively_remove(&*overlay, dir).await.unwrap();
        assert_eq!(overlay.entry_count(), 0);
    }
}
