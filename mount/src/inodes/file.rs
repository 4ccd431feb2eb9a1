use std::sync::Arc;

use bytes::Bytes;
use futures::try_join;
use parking_lot::RwLock;
use tracing::instrument;

use canopy_castore::{EntryType, ObjectId, PathComponent, RelativePathBuf, TreeEntry};

use super::{path_from_location, FileAttr, InodeMetadata, InodeNumber, Location, TreeInode};
use crate::errors::FsError;
use crate::mount::MountCore;

/// A file or symlink in the working copy.
///
/// The inode starts out unmaterialized, a thin handle on a source-control
/// blob. The first write (or truncate, or mode change) copies the blob into
/// the overlay and flips the state; from then on the overlay holds the
/// authoritative bytes and the parent chain has been told to record the
/// divergence.
pub struct FileInode {
    ino: InodeNumber,
    core: Arc<MountCore>,
    is_symlink: bool,
    location: RwLock<Location>,
    state: RwLock<FileState>,
    metadata: RwLock<InodeMetadata>,
    /// Kernel lookup count; a referenced inode is never unloaded.
    kernel_refcount: std::sync::atomic::AtomicU64,
    /// Serializes the unmaterialized -> materialized transition.
    materialize_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
enum FileState {
    Unmaterialized(ObjectId),
    Materialized,
}

impl FileInode {
    /// A file still backed by a source-control blob.
    pub(crate) fn new_unmaterialized(
        core: Arc<MountCore>,
        ino: InodeNumber,
        parent: &Arc<TreeInode>,
        name: PathComponent,
        scm: &TreeEntry,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            core,
            is_symlink: scm.ty() == EntryType::Symlink,
            location: RwLock::new(Location::child(parent, name)),
            state: RwLock::new(FileState::Unmaterialized(scm.id().clone())),
            metadata: RwLock::new(InodeMetadata::new(scm.ty().initial_mode())),
            kernel_refcount: std::sync::atomic::AtomicU64::new(0),
            materialize_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// A file whose bytes already live in the overlay.
    pub(crate) fn new_materialized(
        core: Arc<MountCore>,
        ino: InodeNumber,
        parent: &Arc<TreeInode>,
        name: PathComponent,
        ty: EntryType,
        mode: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            core,
            is_symlink: ty == EntryType::Symlink,
            location: RwLock::new(Location::child(parent, name)),
            state: RwLock::new(FileState::Materialized),
            metadata: RwLock::new(InodeMetadata::new(mode)),
            kernel_refcount: std::sync::atomic::AtomicU64::new(0),
            materialize_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn is_symlink(&self) -> bool {
        self.is_symlink
    }

    pub fn is_materialized(&self) -> bool {
        matches!(&*self.state.read(), FileState::Materialized)
    }

    /// The blob this file still equals, if unmaterialized.
    pub fn source_id(&self) -> Option<ObjectId> {
        match &*self.state.read() {
            FileState::Unmaterialized(id) => Some(id.clone()),
            FileState::Materialized => None,
        }
    }

    pub fn path(&self) -> Option<RelativePathBuf> {
        path_from_location(&self.location)
    }

    pub(crate) fn location(&self) -> &RwLock<Location> {
        &self.location
    }

    /// Records a kernel reference to this inode (a successful lookup reply).
    pub fn kernel_ref(&self) {
        self.kernel_refcount
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Drops kernel references (a FORGET message).
    pub fn kernel_unref(&self, count: u64) {
        self.kernel_refcount
            .fetch_sub(count, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn kernel_referenced(&self) -> bool {
        self.kernel_refcount
            .load(std::sync::atomic::Ordering::SeqCst)
            != 0
    }

    pub async fn getattr(&self) -> Result<FileAttr, FsError> {
        let state = self.state.read().clone();
        let size = match state {
            FileState::Unmaterialized(id) => self.core.store.get_blob_size(&id).await?,
            FileState::Materialized => self.core.file_access.size(self.ino).await?,
        };
        let metadata = self.metadata.read().clone();
        Ok(FileAttr {
            ino: self.ino,
            mode: metadata.mode,
            size,
            mtime: metadata.mtime,
            is_dir: false,
        })
    }

    pub async fn read(&self, offset: u64, len: usize) -> Result<Bytes, FsError> {
        let state = self.state.read().clone();
        match state {
            FileState::Unmaterialized(id) => {
                let blob = self.core.store.get_blob(&id).await?;
                let start = (offset as usize).min(blob.len());
                let end = (start + len).min(blob.len());
                Ok(blob.slice(start..end))
            }
            FileState::Materialized => self.core.file_access.read(self.ino, offset, len).await,
        }
    }

    pub async fn read_all(&self) -> Result<Bytes, FsError> {
        let state = self.state.read().clone();
        match state {
            FileState::Unmaterialized(id) => Ok(self.core.store.get_blob(&id).await?),
            FileState::Materialized => self.core.file_access.read_all(self.ino).await,
        }
    }

    /// The target of a symlink.
    pub async fn readlink(&self) -> Result<Bytes, FsError> {
        if !self.is_symlink {
            return Err(FsError::InvalidArgument(format!(
                "inode {} is not a symlink",
                self.ino
            )));
        }
        self.read_all().await
    }

    #[instrument(skip(self, data), fields(ino = %self.ino, offset, len = data.len()))]
    pub async fn write(self: &Arc<Self>, offset: u64, data: &[u8]) -> Result<u64, FsError> {
        self.materialize().await?;
        let size = self.core.file_access.write(self.ino, offset, data).await?;
        self.metadata.write().touch();
        if let Some(path) = self.path() {
            self.core.journal.record_changed(path);
        }
        Ok(size)
    }

    pub async fn truncate(self: &Arc<Self>, size: u64) -> Result<(), FsError> {
        self.materialize().await?;
        self.core.file_access.truncate(self.ino, size).await?;
        self.metadata.write().touch();
        if let Some(path) = self.path() {
            self.core.journal.record_changed(path);
        }
        Ok(())
    }

    /// Changes the mode bits. This materializes the file: entry equality
    /// with a source-control object covers the mode, so a mode change is a
    /// divergence like any other.
    pub async fn set_mode(self: &Arc<Self>, mode: u32) -> Result<(), FsError> {
        self.materialize().await?;
        {
            let mut metadata = self.metadata.write();
            metadata.mode = mode;
            metadata.touch();
        }
        if let Some(path) = self.path() {
            self.core.journal.record_changed(path);
        }
        Ok(())
    }

    /// Whether this file's current contents and mode equal the given
    /// source-control entry.
    pub async fn is_same_as(&self, scm: &TreeEntry) -> Result<bool, FsError> {
        let executable = self.metadata.read().is_executable();
        let type_matches = match scm.ty() {
            EntryType::Tree => false,
            EntryType::Symlink => self.is_symlink,
            EntryType::RegularFile => !self.is_symlink && !executable,
            EntryType::ExecutableFile => !self.is_symlink && executable,
        };
        if !type_matches {
            return Ok(false);
        }

        let state = self.state.read().clone();
        match state {
            FileState::Unmaterialized(id) => {
                if &id == scm.id() {
                    return Ok(true);
                }
                if self.core.store.bijective_blob_ids() {
                    return Ok(false);
                }
                let (mine, theirs) = try_join!(
                    self.core.store.get_blob_digest(&id),
                    self.core.store.get_blob_digest(scm.id()),
                )?;
                Ok(mine == theirs)
            }
            FileState::Materialized => {
                let mine = self.core.file_access.digest(self.ino).await?;
                let theirs = self.core.store.get_blob_digest(scm.id()).await?;
                Ok(mine == theirs)
            }
        }
    }

    /// Re-points the file at a source-control blob, dropping any overlay
    /// state. Only checkout calls this, after conflict handling has decided
    /// the local state loses.
    pub(crate) async fn update_source(&self, scm: &TreeEntry) -> Result<(), FsError> {
        let _guard = self.materialize_lock.lock().await;
        let was_materialized = self.is_materialized();
        *self.state.write() = FileState::Unmaterialized(scm.id().clone());
        {
            let mut metadata = self.metadata.write();
            metadata.mode = scm.ty().initial_mode();
            metadata.touch();
        }
        if was_materialized {
            self.core.overlay.remove_overlay_data(self.ino).await?;
            self.core.file_access.forget(self.ino);
        }
        Ok(())
    }

    /// Copies the backing blob into the overlay and tells the parent chain.
    async fn materialize(self: &Arc<Self>) -> Result<(), FsError> {
        let _guard = self.materialize_lock.lock().await;
        let id = match &*self.state.read() {
            FileState::Materialized => return Ok(()),
            FileState::Unmaterialized(id) => id.clone(),
        };

        // Overlay data must exist before anyone can observe the entry as
        // materialized; a crash between the two leaves a recoverable state
        // where the parent still records the source object.
        let contents = self.core.store.get_blob(&id).await?;
        self.core.overlay.write_file(self.ino, contents).await?;
        *self.state.write() = FileState::Materialized;

        let (parent, name, unlinked) = {
            let location = self.location.read();
            (
                location.parent.as_ref().and_then(|p| p.upgrade()),
                location.name.clone(),
                location.unlinked,
            )
        };
        if !unlinked {
            if let (Some(parent), Some(name)) = (parent, name) {
                parent.child_materialized(&name).await?;
            }
        }
        Ok(())
    }
}
