//! Read-only path resolution that avoids inode allocation.
//!
//! Stat-shaped queries land here: resolving a deep path through unloaded,
//! unmaterialized directories walks the source-control trees directly
//! instead of instantiating a [TreeInode] per component. Materializing an
//! inode just to stat it would create an overlay entry per ancestor and
//! poison later checkouts, so this fast path is the default for anything
//! that does not need a real inode.

use std::sync::Arc;

use canopy_castore::{EntryType, PathComponent, RelativePathBuf, Tree, TreeEntry};

use super::{FileAttr, Inode, InodeNumber, TreeInode};
use crate::errors::FsError;
use crate::mount::MountCore;

/// The result of a non-allocating lookup: a loaded inode when one already
/// existed, otherwise a view straight into source control.
pub enum InodeOrTreeOrEntry {
    Loaded(Inode),
    /// An unmaterialized directory that is not loaded. `ino` is known when
    /// the parent directory was loaded and had already assigned one.
    Tree {
        tree: Arc<Tree>,
        ino: Option<InodeNumber>,
    },
    /// An unmaterialized file or symlink entry.
    Entry {
        entry: TreeEntry,
        ino: Option<InodeNumber>,
    },
}

impl InodeOrTreeOrEntry {
    pub fn is_dir(&self) -> bool {
        match self {
            InodeOrTreeOrEntry::Loaded(inode) => inode.is_tree(),
            InodeOrTreeOrEntry::Tree { .. } => true,
            InodeOrTreeOrEntry::Entry { .. } => false,
        }
    }

    /// The loaded inode, if this lookup did not take the fast path.
    pub fn as_loaded(&self) -> Option<&Inode> {
        match self {
            InodeOrTreeOrEntry::Loaded(inode) => Some(inode),
            _ => None,
        }
    }

    /// Stat output. Entries without an assigned inode number report inode
    /// zero; the kernel-facing layer only ever stats through real inodes,
    /// so the sentinel stays internal.
    pub(crate) async fn getattr(&self, core: &MountCore) -> Result<FileAttr, FsError> {
        match self {
            InodeOrTreeOrEntry::Loaded(Inode::Tree(tree)) => Ok(tree.getattr()),
            InodeOrTreeOrEntry::Loaded(Inode::File(file)) => file.getattr().await,
            InodeOrTreeOrEntry::Tree { tree, ino } => Ok(FileAttr {
                ino: ino.unwrap_or(InodeNumber(0)),
                mode: EntryType::Tree.initial_mode(),
                size: tree.len() as u64,
                mtime: core.last_checkout_time(),
                is_dir: true,
            }),
            InodeOrTreeOrEntry::Entry { entry, ino } => {
                let size = core.store.get_blob_size(entry.id()).await?;
                Ok(FileAttr {
                    ino: ino.unwrap_or(InodeNumber(0)),
                    mode: entry.ty().initial_mode(),
                    size,
                    mtime: core.last_checkout_time(),
                    is_dir: false,
                })
            }
        }
    }
}

/// Resolves `path` from `root` without allocating inodes for unmaterialized
/// entries.
pub async fn resolve_path(
    root: &Arc<TreeInode>,
    path: &RelativePathBuf,
) -> Result<InodeOrTreeOrEntry, FsError> {
    let core = root.core.clone();
    let mut current = InodeOrTreeOrEntry::Loaded(Inode::Tree(root.clone()));
    let mut walked = RelativePathBuf::root();

    for component in path.components() {
        let name = PathComponent::new(component.to_vec())?;
        walked = walked.join(&name);

        current = match current {
            InodeOrTreeOrEntry::Loaded(Inode::Tree(tree_inode)) => {
                enum Next {
                    Inode(Inode),
                    FetchTree(canopy_castore::ObjectId, InodeNumber),
                    Entry(TreeEntry, InodeNumber),
                    /// Materialized but unloaded: the overlay must be
                    /// consulted, which means loading for real.
                    Load,
                }
                let next = {
                    let contents = tree_inode.contents.read();
                    let key = tree_inode
                        .find_entry_key(&contents, &name)
                        .ok_or_else(|| FsError::not_found(&walked))?;
                    let entry = &contents.entries[&key];
                    if let Some(inode) = entry.inode() {
                        Next::Inode(inode.clone())
                    } else if let Some(id) = entry.source_id() {
                        if entry.ty().is_tree() {
                            Next::FetchTree(id.clone(), entry.ino())
                        } else {
                            Next::Entry(TreeEntry::new(id.clone(), entry.ty()), entry.ino())
                        }
                    } else {
                        Next::Load
                    }
                };
                match next {
                    Next::Inode(inode) => InodeOrTreeOrEntry::Loaded(inode),
                    Next::FetchTree(id, ino) => InodeOrTreeOrEntry::Tree {
                        tree: core.store.get_tree(&id).await?,
                        ino: Some(ino),
                    },
                    Next::Entry(entry, ino) => InodeOrTreeOrEntry::Entry {
                        entry,
                        ino: Some(ino),
                    },
                    Next::Load => {
                        let inode = tree_inode.get_or_load_child(&name).await?;
                        InodeOrTreeOrEntry::Loaded(inode)
                    }
                }
            }
            InodeOrTreeOrEntry::Tree { tree, .. } => {
                let entry = tree
                    .get(&name)
                    .ok_or_else(|| FsError::not_found(&walked))?;
                if entry.ty().is_tree() {
                    InodeOrTreeOrEntry::Tree {
                        tree: core.store.get_tree(entry.id()).await?,
                        ino: None,
                    }
                } else {
                    InodeOrTreeOrEntry::Entry {
                        entry: entry.clone(),
                        ino: None,
                    }
                }
            }
            InodeOrTreeOrEntry::Loaded(Inode::File(_)) | InodeOrTreeOrEntry::Entry { .. } => {
                return Err(FsError::NotADirectory(walked.to_string()));
            }
        };
    }
    Ok(current)
}
