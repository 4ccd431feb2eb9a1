//! Persistent storage for materialized state.
//!
//! The overlay is the authoritative home of everything that has diverged
//! from source control: directory contents of materialized [TreeInode]s and
//! file bytes of materialized [FileInode]s, both keyed by inode number. It
//! also persists the inode-number allocator and a takeover snapshot written
//! on graceful shutdown.
//!
//! [TreeInode]: crate::inodes::TreeInode
//! [FileInode]: crate::inodes::FileInode

pub mod file_access;
pub mod memory;

pub use file_access::OverlayFileAccess;
pub use memory::MemoryOverlay;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use canopy_castore::{EntryType, ObjectId, PathComponent};

use crate::errors::FsError;
use crate::inodes::InodeNumber;

/// The persisted form of a single directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayDirEntry {
    pub name: PathComponent,
    pub ino: InodeNumber,
    pub ty: EntryType,
    pub mode: u32,
    /// The source-control object this entry still equals, or None if the
    /// entry itself is materialized.
    pub source_id: Option<ObjectId>,
}

/// The persisted form of a directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirContents {
    /// Set when the directory was saved in a dematerialized state purely to
    /// cache its inode-number assignments.
    pub source_id: Option<ObjectId>,
    pub entries: Vec<OverlayDirEntry>,
}

/// What the [crate::inodes::InodeMap] persists on graceful shutdown so a
/// later process can keep serving inode numbers the kernel still holds.
#[derive(Debug, Clone, PartialEq)]
pub struct InodeMapSnapshot {
    pub generation: u64,
    /// Unloaded-but-remembered inodes as `(ino, parent ino, name)`.
    pub unloaded: Vec<(InodeNumber, InodeNumber, PathComponent)>,
}

/// Persistent key-value storage from inode number to directory contents or
/// file bytes.
///
/// `save_dir` and `write_file` must be atomic at the single-key granularity:
/// a crashed writer leaves either the old or the new value, never a mix.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Returns the next inode number. The counter is persisted and never
    /// regresses across restarts.
    fn allocate_inode_number(&self) -> InodeNumber;

    async fn save_dir(&self, ino: InodeNumber, contents: DirContents) -> Result<(), FsError>;

    async fn load_dir(&self, ino: InodeNumber) -> Result<Option<DirContents>, FsError>;

    /// Replaces the full contents of an overlay file.
    async fn write_file(&self, ino: InodeNumber, contents: Bytes) -> Result<(), FsError>;

    async fn read_file(&self, ino: InodeNumber) -> Result<Option<Bytes>, FsError>;

    /// Removes any overlay data for the inode. Idempotent.
    async fn remove_overlay_data(&self, ino: InodeNumber) -> Result<(), FsError>;

    async fn save_snapshot(&self, snapshot: InodeMapSnapshot) -> Result<(), FsError>;

    async fn load_snapshot(&self) -> Result<Option<InodeMapSnapshot>, FsError>;
}

/// Removes an inode and everything reachable from it by following
/// [DirContents] links. Works on any [Overlay] implementation.
pub fn recursively_remove<'a>(
    overlay: &'a dyn Overlay,
    ino: InodeNumber,
) -> BoxFuture<'a, Result<(), FsError>> {
    async move {
        if let Some(contents) = overlay.load_dir(ino).await? {
            for entry in contents.entries {
                if entry.source_id.is_none() {
                    recursively_remove(overlay, entry.ino).await?;
                }
            }
        }
        overlay.remove_overlay_data(ino).await
    }
    .boxed()
}
