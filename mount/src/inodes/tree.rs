use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, instrument};

use canopy_castore::{EntryType, ObjectId, PathComponent, RelativePathBuf, Tree, TreeEntry};

use super::{
    path_from_location, DirEntry, FileAttr, FileInode, Inode, InodeMetadata, InodeNumber,
    LoadDecision, Location, ROOT_INO,
};
use crate::channel::readdir_offset_for;
use crate::errors::FsError;
use crate::mount::MountCore;
use crate::overlay::{DirContents, OverlayDirEntry};

/// The name of the reserved control directory at the mount root.
pub const RESERVED_DIR_NAME: &[u8] = b".canopy";

/// The guarded state of a [TreeInode]: its children and whether the
/// directory still equals a source-control tree.
///
/// `source_id == Some(h)` means the entry set is byte-for-byte what
/// `ObjectStore::get_tree(h)` describes; `None` means the directory is
/// materialized and the overlay holds the authoritative copy.
pub(crate) struct TreeContents {
    pub entries: BTreeMap<PathComponent, DirEntry>,
    pub source_id: Option<ObjectId>,
    /// Bumped on every mutation. [TreeInode::save_overlay] uses it to skip
    /// persisting state an interleaved writer already persisted.
    pub seq: u64,
}

impl TreeContents {
    pub fn from_tree(core: &MountCore, tree: &Tree) -> Self {
        let entries = tree
            .entries()
            .map(|(name, entry)| {
                let ino = core.overlay.allocate_inode_number();
                (name.clone(), DirEntry::from_source(ino, entry))
            })
            .collect();
        Self {
            entries,
            source_id: Some(tree.id().clone()),
            seq: 0,
        }
    }

    pub fn from_overlay(contents: &DirContents) -> Self {
        let entries = contents
            .entries
            .iter()
            .map(|persisted| (persisted.name.clone(), DirEntry::from_overlay(persisted)))
            .collect();
        Self {
            entries,
            source_id: contents.source_id.clone(),
            seq: 0,
        }
    }

    pub fn empty_materialized() -> Self {
        Self {
            entries: BTreeMap::new(),
            source_id: None,
            seq: 1,
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.source_id.is_none()
    }

    pub fn bump(&mut self) {
        self.seq += 1;
    }

    pub fn to_dir_contents(&self) -> DirContents {
        DirContents {
            source_id: self.source_id.clone(),
            entries: self
                .entries
                .iter()
                .map(|(name, entry)| entry.to_overlay(name))
                .collect::<Vec<OverlayDirEntry>>(),
        }
    }
}

/// One readdir result row.
#[derive(Debug, Clone)]
pub struct DirListEntry {
    pub name: Bytes,
    pub ino: InodeNumber,
    pub is_dir: bool,
    /// The cookie to pass back to resume after this entry.
    pub offset: u64,
}

/// A directory in the working copy.
pub struct TreeInode {
    ino: InodeNumber,
    pub(crate) core: Arc<MountCore>,
    location: RwLock<Location>,
    pub(crate) contents: RwLock<TreeContents>,
    metadata: RwLock<InodeMetadata>,
    /// Kernel lookup count; inodes the kernel still references are not
    /// unloaded.
    kernel_refcount: AtomicU64,
    /// Sequence number of the last contents state persisted to the overlay.
    overlay_write: tokio::sync::Mutex<u64>,
}

impl TreeInode {
    pub(crate) fn new_root(core: Arc<MountCore>, contents: TreeContents) -> Arc<Self> {
        Arc::new(Self {
            ino: ROOT_INO,
            core,
            location: RwLock::new(Location::root()),
            contents: RwLock::new(contents),
            metadata: RwLock::new(InodeMetadata::new(EntryType::Tree.initial_mode())),
            kernel_refcount: AtomicU64::new(0),
            overlay_write: tokio::sync::Mutex::new(0),
        })
    }

    pub(crate) fn new_child(
        core: Arc<MountCore>,
        ino: InodeNumber,
        parent: &Arc<TreeInode>,
        name: PathComponent,
        contents: TreeContents,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            core,
            location: RwLock::new(Location::child(parent, name)),
            contents: RwLock::new(contents),
            metadata: RwLock::new(InodeMetadata::new(EntryType::Tree.initial_mode())),
            kernel_refcount: AtomicU64::new(0),
            overlay_write: tokio::sync::Mutex::new(0),
        })
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn path(&self) -> Option<RelativePathBuf> {
        path_from_location(&self.location)
    }

    pub(crate) fn location(&self) -> &RwLock<Location> {
        &self.location
    }

    pub fn is_materialized(&self) -> bool {
        self.contents.read().is_materialized()
    }

    pub fn source_id(&self) -> Option<ObjectId> {
        self.contents.read().source_id.clone()
    }

    pub fn entry_count(&self) -> usize {
        self.contents.read().entries.len()
    }

    pub fn getattr(&self) -> FileAttr {
        let metadata = self.metadata.read().clone();
        FileAttr {
            ino: self.ino,
            mode: metadata.mode,
            size: self.entry_count() as u64,
            mtime: metadata.mtime,
            is_dir: true,
        }
    }

    /// Records a kernel reference to this inode (a successful lookup reply).
    pub fn kernel_ref(&self) {
        self.kernel_refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops kernel references (a FORGET message).
    pub fn kernel_unref(&self, count: u64) {
        self.kernel_refcount.fetch_sub(count, Ordering::SeqCst);
    }

    fn kernel_referenced(&self) -> bool {
        self.kernel_refcount.load(Ordering::SeqCst) != 0
    }

    /// Resolves `name` to the key actually stored in the entries map,
    /// respecting the mount's case sensitivity.
    pub(crate) fn find_entry_key(
        &self,
        contents: &TreeContents,
        name: &PathComponent,
    ) -> Option<PathComponent> {
        if contents.entries.contains_key(name) {
            return Some(name.clone());
        }
        if !self.core.config.case_sensitive {
            return contents
                .entries
                .keys()
                .find(|key| key.as_bytes().eq_ignore_ascii_case(name.as_bytes()))
                .cloned();
        }
        None
    }

    fn describe_child(&self, name: &PathComponent) -> String {
        match self.path() {
            Some(path) => path.join(name).to_string(),
            None => format!("<unlinked>/{}", name),
        }
    }

    fn child_path(&self, name: &PathComponent) -> Option<RelativePathBuf> {
        self.path().map(|p| p.join(name))
    }

    fn check_reserved(&self, name: &PathComponent) -> Result<(), FsError> {
        if self.ino == ROOT_INO && name.as_bytes() == RESERVED_DIR_NAME {
            return Err(FsError::PermissionDenied(self.describe_child(name)));
        }
        Ok(())
    }

    /// Returns the loaded inode for a child, loading it if necessary.
    ///
    /// At most one load per inode number is in flight at a time; racing
    /// callers attach to the winner's load through the [super::InodeMap]
    /// and observe the identical result. No contents lock is held across
    /// the fetch.
    #[instrument(skip(self), fields(ino = %self.ino, name = %name))]
    pub async fn get_or_load_child(
        self: &Arc<Self>,
        name: &PathComponent,
    ) -> Result<Inode, FsError> {
        loop {
            let (key, ino) = {
                let contents = self.contents.read();
                let key = self
                    .find_entry_key(&contents, name)
                    .ok_or_else(|| FsError::not_found(self.describe_child(name)))?;
                let entry = &contents.entries[&key];
                if let Some(inode) = entry.inode() {
                    return Ok(inode.clone());
                }
                (key, entry.ino())
            };

            match self.core.inode_map.begin_load(ino) {
                LoadDecision::AlreadyLoaded(inode) => {
                    let mut contents = self.contents.write();
                    if let Some(entry) = contents.entries.get_mut(&key) {
                        if !entry.is_loaded() {
                            entry.set_inode(inode.clone());
                        }
                    }
                    return Ok(inode);
                }
                LoadDecision::Wait(rx) => match rx.await {
                    Ok(result) => return result,
                    // The loader was dropped without completing; retry.
                    Err(_) => continue,
                },
                LoadDecision::Start => {
                    return match self.load_child(&key, ino).await {
                        Ok(inode) => {
                            // Link the inode into the entry before waking
                            // waiters, so a lookup by name finds it through
                            // the entries map.
                            {
                                let mut contents = self.contents.write();
                                match contents.entries.get_mut(&key) {
                                    Some(entry) if entry.ino() == ino => {
                                        entry.set_inode(inode.clone())
                                    }
                                    // The entry was unlinked while loading.
                                    _ => inode.location().write().unlinked = true,
                                }
                            }
                            self.core.inode_map.complete_load(ino, inode.clone());
                            Ok(inode)
                        }
                        Err(error) => {
                            self.core.inode_map.fail_load(ino, error.clone());
                            Err(error)
                        }
                    };
                }
            }
        }
    }

    /// Performs the actual fetch for a child load. Must not be called with
    /// any contents lock held.
    async fn load_child(
        self: &Arc<Self>,
        name: &PathComponent,
        ino: InodeNumber,
    ) -> Result<Inode, FsError> {
        let (ty, mode, source_id) = {
            let contents = self.contents.read();
            let entry = contents
                .entries
                .get(name)
                .ok_or_else(|| FsError::not_found(self.describe_child(name)))?;
            (entry.ty(), entry.mode(), entry.source_id().cloned())
        };

        match (ty.is_tree(), source_id) {
            (true, Some(id)) => {
                let tree = self.core.store.get_tree(&id).await?;
                let contents = TreeContents::from_tree(&self.core, &tree);
                Ok(Inode::Tree(TreeInode::new_child(
                    self.core.clone(),
                    ino,
                    self,
                    name.clone(),
                    contents,
                )))
            }
            (true, None) => {
                let persisted = self.core.overlay.load_dir(ino).await?.ok_or_else(|| {
                    FsError::Bug(format!(
                        "materialized directory {} has no overlay data",
                        self.describe_child(name)
                    ))
                })?;
                Ok(Inode::Tree(TreeInode::new_child(
                    self.core.clone(),
                    ino,
                    self,
                    name.clone(),
                    TreeContents::from_overlay(&persisted),
                )))
            }
            (false, Some(id)) => Ok(Inode::File(FileInode::new_unmaterialized(
                self.core.clone(),
                ino,
                self,
                name.clone(),
                &TreeEntry::new(id, ty),
            ))),
            (false, None) => Ok(Inode::File(FileInode::new_materialized(
                self.core.clone(),
                ino,
                self,
                name.clone(),
                ty,
                mode,
            ))),
        }
    }

    /// Lists the directory starting from a resume cookie (see
    /// [readdir_offset_for] for the offset convention).
    pub fn readdir(&self, offset: u64) -> Vec<DirListEntry> {
        let mut out = Vec::new();
        if offset == 0 {
            out.push(DirListEntry {
                name: Bytes::from_static(b"."),
                ino: self.ino,
                is_dir: true,
                offset: 1,
            });
        }
        if offset <= 1 {
            let parent_ino = self
                .location
                .read()
                .parent
                .as_ref()
                .and_then(|p| p.upgrade())
                .map(|p| p.ino())
                .unwrap_or(self.ino);
            out.push(DirListEntry {
                name: Bytes::from_static(b".."),
                ino: parent_ino,
                is_dir: true,
                offset: 2,
            });
        }

        let contents = self.contents.read();
        let resume_after = if offset > 2 {
            Some(InodeNumber(offset - 2))
        } else {
            None
        };
        let mut emit = resume_after.is_none();
        let mut found_cookie = emit;
        for (name, entry) in &contents.entries {
            if emit {
                out.push(DirListEntry {
                    name: Bytes::copy_from_slice(name.as_bytes()),
                    ino: entry.ino(),
                    is_dir: entry.ty().is_tree(),
                    offset: readdir_offset_for(entry.ino()),
                });
            } else if Some(entry.ino()) == resume_after {
                emit = true;
                found_cookie = true;
            }
        }
        if !found_cookie {
            // The cookie entry was unlinked between calls. Restart the
            // listing: re-reporting a name is recoverable for the caller,
            // silently skipping the tail is not.
            for (name, entry) in &contents.entries {
                out.push(DirListEntry {
                    name: Bytes::copy_from_slice(name.as_bytes()),
                    ino: entry.ino(),
                    is_dir: entry.ty().is_tree(),
                    offset: readdir_offset_for(entry.ino()),
                });
            }
        }
        out
    }

    /// Creates a regular (or executable) file with the given initial
    /// contents.
    #[instrument(skip(self, contents), fields(ino = %self.ino, name = %name))]
    pub async fn create_file(
        self: &Arc<Self>,
        name: PathComponent,
        executable: bool,
        contents: Bytes,
    ) -> Result<Arc<FileInode>, FsError> {
        let ty = if executable {
            EntryType::ExecutableFile
        } else {
            EntryType::RegularFile
        };
        self.add_materialized_file(name, ty, contents).await
    }

    /// Creates a symlink pointing at `target`.
    pub async fn symlink(
        self: &Arc<Self>,
        name: PathComponent,
        target: Bytes,
    ) -> Result<Arc<FileInode>, FsError> {
        self.add_materialized_file(name, EntryType::Symlink, target).await
    }

    async fn add_materialized_file(
        self: &Arc<Self>,
        name: PathComponent,
        ty: EntryType,
        contents: Bytes,
    ) -> Result<Arc<FileInode>, FsError> {
        self.check_reserved(&name)?;
        let _rename = self.core.rename_lock.read().await;

        let ino = self.core.overlay.allocate_inode_number();
        // The overlay data exists before the entry becomes visible; if we
        // crash in between, the unreferenced blob is garbage, not
        // corruption.
        self.core.overlay.write_file(ino, contents).await?;

        let inode = {
            let mut guard = self.contents.write();
            if self.find_entry_key(&guard, &name).is_some() {
                drop(guard);
                self.core.overlay.remove_overlay_data(ino).await?;
                return Err(FsError::AlreadyExists(self.describe_child(&name)));
            }
            let file = FileInode::new_materialized(
                self.core.clone(),
                ino,
                self,
                name.clone(),
                ty,
                ty.initial_mode(),
            );
            let mut entry = DirEntry::materialized(ino, ty);
            entry.set_inode(Inode::File(file.clone()));
            guard.entries.insert(name.clone(), entry);
            guard.bump();
            file
        };
        self.core.inode_map.insert_loaded(&Inode::File(inode.clone()));
        self.mark_dirty_and_save().await?;

        if let Some(path) = self.child_path(&name) {
            self.core.journal.record_created(path);
        }
        Ok(inode)
    }

    /// Creates an empty subdirectory.
    #[instrument(skip(self), fields(ino = %self.ino, name = %name))]
    pub async fn mkdir(self: &Arc<Self>, name: PathComponent) -> Result<Arc<TreeInode>, FsError> {
        self.check_reserved(&name)?;
        let _rename = self.core.rename_lock.read().await;

        let ino = self.core.overlay.allocate_inode_number();
        self.core
            .overlay
            .save_dir(ino, DirContents::default())
            .await?;

        let inode = {
            let mut guard = self.contents.write();
            if self.find_entry_key(&guard, &name).is_some() {
                drop(guard);
                self.core.overlay.remove_overlay_data(ino).await?;
                return Err(FsError::AlreadyExists(self.describe_child(&name)));
            }
            let dir = TreeInode::new_child(
                self.core.clone(),
                ino,
                self,
                name.clone(),
                TreeContents::empty_materialized(),
            );
            let mut entry = DirEntry::materialized(ino, EntryType::Tree);
            entry.set_inode(Inode::Tree(dir.clone()));
            guard.entries.insert(name.clone(), entry);
            guard.bump();
            dir
        };
        self.core.inode_map.insert_loaded(&Inode::Tree(inode.clone()));
        self.mark_dirty_and_save().await?;

        if let Some(path) = self.child_path(&name) {
            self.core.journal.record_created(path);
        }
        Ok(inode)
    }

    /// Removes a non-directory child.
    #[instrument(skip(self), fields(ino = %self.ino, name = %name))]
    pub async fn unlink(self: &Arc<Self>, name: &PathComponent) -> Result<(), FsError> {
        self.check_reserved(name)?;
        let _rename = self.core.rename_lock.write().await;
        self.materialize().await?;

        let (child_ino, was_materialized) = {
            let mut guard = self.contents.write();
            let key = self
                .find_entry_key(&guard, name)
                .ok_or_else(|| FsError::not_found(self.describe_child(name)))?;
            if guard.entries[&key].ty().is_tree() {
                return Err(FsError::IsADirectory(self.describe_child(name)));
            }
            let entry = guard.entries.remove(&key).expect("key came from the map");
            if let Some(inode) = entry.inode() {
                inode.location().write().unlinked = true;
            }
            guard.bump();
            (entry.ino(), entry.is_materialized())
        };

        self.save_overlay().await?;
        if was_materialized {
            self.core.overlay.remove_overlay_data(child_ino).await?;
            self.core.file_access.forget(child_ino);
        }
        self.core.inode_map.forget(child_ino);
        if let Some(path) = self.child_path(name) {
            self.core.journal.record_removed(path);
        }
        Ok(())
    }

    /// Removes an empty subdirectory.
    ///
    /// The child's contents lock is held from the emptiness check through
    /// the removal from the parent, so a concurrent create into the child
    /// cannot slip in between.
    #[instrument(skip(self), fields(ino = %self.ino, name = %name))]
    pub async fn rmdir(self: &Arc<Self>, name: &PathComponent) -> Result<(), FsError> {
        self.check_reserved(name)?;
        let _rename = self.core.rename_lock.write().await;
        self.materialize().await?;

        let child = self.get_or_load_child(name).await?;
        let child_tree = child
            .as_tree()
            .ok_or_else(|| FsError::NotADirectory(self.describe_child(name)))?;

        let (child_ino, child_materialized) = {
            let mut guard = self.contents.write();
            let child_contents = child_tree.contents.write();
            if !child_contents.entries.is_empty() {
                return Err(FsError::NotEmpty(self.describe_child(name)));
            }
            let key = self
                .find_entry_key(&guard, name)
                .ok_or_else(|| FsError::not_found(self.describe_child(name)))?;
            let entry = guard.entries.remove(&key).expect("key came from the map");
            child_tree.location.write().unlinked = true;
            guard.bump();
            (entry.ino(), entry.is_materialized())
        };

        self.save_overlay().await?;
        if child_materialized {
            self.core.overlay.remove_overlay_data(child_ino).await?;
        }
        self.core.inode_map.forget(child_ino);
        if let Some(path) = self.child_path(name) {
            self.core.journal.record_removed(path);
        }
        Ok(())
    }

    /// Moves `src_name` under `src_parent` to `dst_name` under
    /// `dst_parent`, replacing a compatible destination entry if present.
    #[instrument(
        skip(src_parent, dst_parent),
        fields(src = %src_name, dst = %dst_name)
    )]
    pub async fn rename(
        src_parent: &Arc<TreeInode>,
        src_name: &PathComponent,
        dst_parent: &Arc<TreeInode>,
        dst_name: &PathComponent,
    ) -> Result<(), FsError> {
        src_parent.check_reserved(src_name)?;
        dst_parent.check_reserved(dst_name)?;
        if Arc::ptr_eq(src_parent, dst_parent) && src_name == dst_name {
            return Ok(());
        }
        let core = src_parent.core.clone();
        let _rename = core.rename_lock.write().await;

        src_parent.materialize().await?;
        dst_parent.materialize().await?;

        // The moved inode must be loaded so its location can be updated.
        let moved = src_parent.get_or_load_child(src_name).await?;
        if let Inode::Tree(moved_tree) = &moved {
            if Arc::ptr_eq(moved_tree, dst_parent) || is_ancestor_of(moved_tree, dst_parent) {
                return Err(FsError::InvalidArgument(
                    "cannot move a directory underneath itself".to_string(),
                ));
            }
        }
        // A directory destination must be loaded for the emptiness check.
        let dst_existing = match dst_parent.get_or_load_child(dst_name).await {
            Ok(inode) => Some(inode),
            Err(FsError::NotFound(_)) => None,
            Err(other) => return Err(other),
        };

        let src_path = src_parent.child_path(src_name);
        let dst_path = dst_parent.child_path(dst_name);

        let replaced = {
            let mut locks = TreeRenameLocks::acquire(src_parent, dst_parent);

            let src_key = src_parent
                .find_entry_key(locks.src(), src_name)
                .ok_or_else(|| FsError::not_found(src_parent.describe_child(src_name)))?;
            let moved_is_dir = locks.src().entries[&src_key].ty().is_tree();

            let dst_key = dst_parent.find_entry_key(locks.dst(), dst_name);
            let replaced = match dst_key {
                None => None,
                Some(dst_key) => {
                    let dst_is_dir = locks.dst().entries[&dst_key].ty().is_tree();
                    match (moved_is_dir, dst_is_dir) {
                        (true, false) => {
                            return Err(FsError::NotADirectory(
                                dst_parent.describe_child(dst_name),
                            ))
                        }
                        (false, true) => {
                            return Err(FsError::IsADirectory(
                                dst_parent.describe_child(dst_name),
                            ))
                        }
                        (_, true) => {
                            let dst_tree = dst_existing
                                .as_ref()
                                .and_then(|i| i.as_tree())
                                .ok_or_else(|| {
                                    FsError::Bug("directory entry loaded as file".to_string())
                                })?;
                            // Lock the doomed directory itself so nothing
                            // can be created inside it after the emptiness
                            // check.
                            let dst_tree_contents = dst_tree.contents.write();
                            if !dst_tree_contents.entries.is_empty() {
                                return Err(FsError::NotEmpty(
                                    dst_parent.describe_child(dst_name),
                                ));
                            }
                            let entry = locks.dst().entries.remove(&dst_key).unwrap();
                            dst_tree.location.write().unlinked = true;
                            Some(entry)
                        }
                        (_, false) => {
                            let entry = locks.dst().entries.remove(&dst_key).unwrap();
                            if let Some(inode) = entry.inode() {
                                inode.location().write().unlinked = true;
                            }
                            Some(entry)
                        }
                    }
                }
            };

            let mut entry = locks
                .src()
                .entries
                .remove(&src_key)
                .expect("key came from the map");
            entry.set_inode(moved.clone());
            locks.dst().entries.insert(dst_name.clone(), entry);
            locks.src().bump();
            locks.dst().bump();

            {
                let mut location = moved.location().write();
                location.parent = Some(Arc::downgrade(dst_parent));
                location.name = Some(dst_name.clone());
            }
            replaced
        };

        src_parent.save_overlay().await?;
        if !Arc::ptr_eq(src_parent, dst_parent) {
            dst_parent.save_overlay().await?;
        }

        if let Some(entry) = &replaced {
            if entry.is_materialized() {
                core.overlay.remove_overlay_data(entry.ino()).await?;
                core.file_access.forget(entry.ino());
            }
            core.inode_map.forget(entry.ino());
        }

        if let (Some(src), Some(dst)) = (src_path, dst_path) {
            if replaced.is_some() {
                core.journal.record_replaced(src, dst);
            } else {
                core.journal.record_renamed(src, dst);
            }
        }
        Ok(())
    }

    /// Materializes this directory and every ancestor up to the root.
    pub fn materialize(self: &Arc<Self>) -> BoxFuture<'_, Result<(), FsError>> {
        async move {
            let was_materialized = {
                let mut guard = self.contents.write();
                let was = guard.is_materialized();
                if !was {
                    guard.source_id = None;
                    guard.bump();
                }
                was
            };
            if was_materialized {
                // Upward closure: a materialized directory implies
                // materialized ancestors, so there is nothing left to do.
                return Ok(());
            }
            self.save_overlay().await?;
            self.notify_parent_materialized().await
        }
        .boxed()
    }

    /// Called by a child after it materialized itself (and persisted its
    /// own overlay state). Marks the child's entry dirty and propagates.
    pub(crate) fn child_materialized<'a>(
        self: &'a Arc<Self>,
        name: &'a PathComponent,
    ) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            let was_materialized = {
                let mut guard = self.contents.write();
                let key = self.find_entry_key(&guard, name);
                match key.and_then(|key| guard.entries.get_mut(&key)) {
                    Some(entry) => entry.mark_materialized(),
                    // The child was unlinked concurrently; nothing to
                    // record.
                    None => return Ok(()),
                }
                let was = guard.is_materialized();
                guard.source_id = None;
                guard.bump();
                was
            };
            self.save_overlay().await?;
            if !was_materialized {
                self.notify_parent_materialized().await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Checkout-internal variant of [TreeInode::child_materialized]: marks
    /// the entry without persisting, because the caller's own
    /// reconciliation pass persists this directory afterwards.
    pub(crate) fn child_entry_materialized(&self, name: &PathComponent) {
        let mut guard = self.contents.write();
        let key = self.find_entry_key(&guard, name);
        if let Some(entry) = key.and_then(|key| guard.entries.get_mut(&key)) {
            entry.mark_materialized();
            guard.source_id = None;
            guard.bump();
        }
    }

    /// Called during checkout reconciliation when a child directory proved
    /// equal to a source-control tree again.
    pub(crate) fn child_dematerialized(&self, name: &PathComponent, id: ObjectId) {
        let mut guard = self.contents.write();
        let key = self.find_entry_key(&guard, name);
        if let Some(entry) = key.and_then(|key| guard.entries.get_mut(&key)) {
            entry.set_source(&TreeEntry::new(id, EntryType::Tree));
            guard.bump();
        }
    }

    async fn notify_parent_materialized(&self) -> Result<(), FsError> {
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

    async fn mark_dirty_and_save(self: &Arc<Self>) -> Result<(), FsError> {
        let was_materialized = {
            let mut guard = self.contents.write();
            let was = guard.is_materialized();
            guard.source_id = None;
            guard.bump();
            was
        };
        self.save_overlay().await?;
        if !was_materialized {
            self.notify_parent_materialized().await?;
        }
        Ok(())
    }

    /// Persists the current contents to the overlay, unless a concurrent
    /// writer already persisted this or a newer state.
    pub(crate) async fn save_overlay(self: &Arc<Self>) -> Result<(), FsError> {
        let mut last_saved = self.overlay_write.lock().await;
        let (seq, snapshot) = {
            let guard = self.contents.read();
            (guard.seq, guard.to_dir_contents())
        };
        if seq <= *last_saved {
            return Ok(());
        }
        self.core.overlay.save_dir(self.ino, snapshot).await?;
        *last_saved = seq;
        Ok(())
    }

    /// Drops loaded child inodes that nothing references: not the kernel,
    /// not any caller, not a loaded grandchild. Returns how many inodes
    /// were unloaded.
    ///
    /// The unloaded entries stay in the map with their inode numbers, so a
    /// later lookup reloads the same number from the store or overlay.
    pub fn unload_free_children(self: &Arc<Self>) -> usize {
        let mut unloaded = 0;
        let mut guard = self.contents.write();
        let mut to_clear: Vec<PathComponent> = Vec::new();
        for (name, entry) in guard.entries.iter() {
            let Some(inode) = entry.inode().cloned() else {
                continue;
            };
            match &inode {
                Inode::Tree(tree) => {
                    unloaded += tree.unload_free_children();
                    let has_loaded_children = tree
                        .contents
                        .read()
                        .entries
                        .values()
                        .any(|e| e.is_loaded());
                    // Two strong references mean ours and the entry's.
                    if !has_loaded_children
                        && !tree.kernel_referenced()
                        && Arc::strong_count(tree) == 2
                    {
                        to_clear.push(name.clone());
                    }
                }
                Inode::File(file) => {
                    if !file.kernel_referenced() && Arc::strong_count(file) == 2 {
                        to_clear.push(name.clone());
                    }
                }
            }
        }
        for name in to_clear {
            if let Some(entry) = guard.entries.get_mut(&name) {
                debug!(ino = %entry.ino(), name = %name, "unloading inode");
                entry.clear_inode();
                self.core
                    .inode_map
                    .register_unloaded(entry.ino(), self.ino, name.clone());
                unloaded += 1;
            }
        }
        unloaded
    }
}

/// Pre-ordered contents-lock acquisition for rename: the ancestor parent
/// first when one parent contains the other, a single lock when they are
/// the same inode.
pub(crate) enum TreeRenameLocks<'a> {
    Same(RwLockWriteGuard<'a, TreeContents>),
    Distinct {
        src_is_first: bool,
        first: RwLockWriteGuard<'a, TreeContents>,
        second: RwLockWriteGuard<'a, TreeContents>,
    },
}

impl<'a> TreeRenameLocks<'a> {
    pub fn acquire(src: &'a Arc<TreeInode>, dst: &'a Arc<TreeInode>) -> Self {
        if Arc::ptr_eq(src, dst) {
            return TreeRenameLocks::Same(src.contents.write());
        }
        // Ancestors must be locked before descendants; unrelated parents
        // are ordered by inode number, which is stable and globally
        // consistent.
        let src_first = if is_ancestor_of(src, dst) {
            true
        } else if is_ancestor_of(dst, src) {
            false
        } else {
            src.ino() < dst.ino()
        };
        if src_first {
            let first = src.contents.write();
            let second = dst.contents.write();
            TreeRenameLocks::Distinct {
                src_is_first: true,
                first,
                second,
            }
        } else {
            let first = dst.contents.write();
            let second = src.contents.write();
            TreeRenameLocks::Distinct {
                src_is_first: false,
                first,
                second,
            }
        }
    }

    /// The source parent's contents. For a same-parent rename this is the
    /// same map as [TreeRenameLocks::dst].
    pub fn src(&mut self) -> &mut TreeContents {
        match self {
            TreeRenameLocks::Same(guard) => guard,
            TreeRenameLocks::Distinct {
                src_is_first: true,
                first,
                ..
            } => first,
            TreeRenameLocks::Distinct { second, .. } => second,
        }
    }

    /// The destination parent's contents.
    pub fn dst(&mut self) -> &mut TreeContents {
        match self {
            TreeRenameLocks::Same(guard) => guard,
            TreeRenameLocks::Distinct {
                src_is_first: true,
                second,
                ..
            } => second,
            TreeRenameLocks::Distinct { first, .. } => first,
        }
    }
}

/// Whether `a` is an ancestor of `b`, walking `b`'s parent chain. Only
/// meaningful while the rename lock is held.
fn is_ancestor_of(a: &Arc<TreeInode>, b: &Arc<TreeInode>) -> bool {
    let mut current = match b.location.read().parent.as_ref().and_then(|p| p.upgrade()) {
        Some(parent) => parent,
        None => return false,
    };
    loop {
        if Arc::ptr_eq(a, &current) {
            return true;
        }
        let parent = current
            .location
            .read()
            .parent
            .as_ref()
            .and_then(|p| p.upgrade());
        match parent {
            Some(parent) => current = parent,
            None => return false,
        }
    }
}
