use canopy_castore::{EntryType, ObjectId, TreeEntry};

use super::{Inode, InodeNumber};
use crate::overlay::OverlayDirEntry;

/// One child of a [TreeInode](super::TreeInode).
///
/// The entry either still equals a source-control object (`source_id` set)
/// or has diverged and lives in the overlay (`source_id` empty). The loaded
/// inode pointer, when present, is the owning reference that keeps the child
/// inode alive.
#[derive(Clone)]
pub struct DirEntry {
    ty: EntryType,
    mode: u32,
    ino: InodeNumber,
    source_id: Option<ObjectId>,
    inode: Option<Inode>,
}

impl DirEntry {
    /// An entry backed by a source-control object.
    pub fn from_source(ino: InodeNumber, entry: &TreeEntry) -> Self {
        Self {
            ty: entry.ty(),
            mode: entry.ty().initial_mode(),
            ino,
            source_id: Some(entry.id().clone()),
            inode: None,
        }
    }

    /// An entry whose contents live in the overlay.
    pub fn materialized(ino: InodeNumber, ty: EntryType) -> Self {
        Self {
            ty,
            mode: ty.initial_mode(),
            ino,
            source_id: None,
            inode: None,
        }
    }

    pub fn from_overlay(persisted: &OverlayDirEntry) -> Self {
        Self {
            ty: persisted.ty,
            mode: persisted.mode,
            ino: persisted.ino,
            source_id: persisted.source_id.clone(),
            inode: None,
        }
    }

    pub fn to_overlay(&self, name: &canopy_castore::PathComponent) -> OverlayDirEntry {
        OverlayDirEntry {
            name: name.clone(),
            ino: self.ino,
            ty: self.ty,
            mode: self.mode,
            source_id: self.source_id.clone(),
        }
    }

    pub fn ty(&self) -> EntryType {
        self.ty
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn source_id(&self) -> Option<&ObjectId> {
        self.source_id.as_ref()
    }

    pub fn is_materialized(&self) -> bool {
        self.source_id.is_none()
    }

    pub fn inode(&self) -> Option<&Inode> {
        self.inode.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.inode.is_some()
    }

    pub fn set_inode(&mut self, inode: Inode) {
        debug_assert_eq!(inode.ino(), self.ino);
        self.inode = Some(inode);
    }

    pub fn clear_inode(&mut self) {
        self.inode = None;
    }

    /// Marks the entry materialized; its contents now live in the overlay.
    pub fn mark_materialized(&mut self) {
        self.source_id = None;
    }

    /// Re-points the entry at a source-control object, keeping the inode
    /// number.
    pub fn set_source(&mut self, entry: &TreeEntry) {
        self.ty = entry.ty();
        self.mode = entry.ty().initial_mode();
        self.source_id = Some(entry.id().clone());
    }

    /// Whether this entry is trivially identical to the given source-control
    /// entry: unmaterialized, same object, same type. A false result does
    /// not imply the contents differ, only that a content comparison would
    /// be needed to know.
    pub fn matches_source(&self, scm: &TreeEntry) -> bool {
        self.ty == scm.ty() && self.source_id.as_ref() == Some(scm.id())
    }
}
