//! In-memory representation of the working copy: the inode tree, its load
//! lifecycle, and ownership discipline.
//!
//! Ownership goes strictly downward: a parent's entries map holds the only
//! long-lived strong reference to a loaded child, and children point back at
//! their parent through weak references used solely to reconstruct paths.
//! The [InodeMap] tracks every allocated inode number and coordinates
//! concurrent loads.

pub mod dir_entry;
pub mod file;
pub mod inode_map;
pub mod lookup;
pub mod tree;

pub use dir_entry::DirEntry;
pub use file::FileInode;
pub use inode_map::{InodeMap, LoadDecision};
pub use lookup::InodeOrTreeOrEntry;
pub use tree::TreeInode;

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use canopy_castore::{PathComponent, RelativePathBuf};
use parking_lot::RwLock;

/// A 64-bit inode number, unique within a mount for the lifetime of the
/// process and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeNumber(pub u64);

/// The root directory's inode number.
pub const ROOT_INO: InodeNumber = InodeNumber(1);

impl std::fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A loaded inode: either a directory or a file/symlink.
#[derive(Clone)]
pub enum Inode {
    Tree(Arc<TreeInode>),
    File(Arc<FileInode>),
}

impl Inode {
    pub fn ino(&self) -> InodeNumber {
        match self {
            Inode::Tree(t) => t.ino(),
            Inode::File(f) => f.ino(),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Inode::Tree(_))
    }

    pub fn as_tree(&self) -> Option<&Arc<TreeInode>> {
        match self {
            Inode::Tree(t) => Some(t),
            Inode::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileInode>> {
        match self {
            Inode::File(f) => Some(f),
            Inode::Tree(_) => None,
        }
    }

    pub fn downgrade(&self) -> InodeWeak {
        match self {
            Inode::Tree(t) => InodeWeak::Tree(Arc::downgrade(t)),
            Inode::File(f) => InodeWeak::File(Arc::downgrade(f)),
        }
    }

    /// The current path of this inode, or None if it has been unlinked.
    pub fn path(&self) -> Option<RelativePathBuf> {
        match self {
            Inode::Tree(t) => t.path(),
            Inode::File(f) => f.path(),
        }
    }

    pub(crate) fn location(&self) -> &RwLock<Location> {
        match self {
            Inode::Tree(t) => t.location(),
            Inode::File(f) => f.location(),
        }
    }
}

/// A non-owning handle to a loaded inode, stored in the [InodeMap].
#[derive(Clone)]
pub enum InodeWeak {
    Tree(Weak<TreeInode>),
    File(Weak<FileInode>),
}

impl InodeWeak {
    pub fn upgrade(&self) -> Option<Inode> {
        match self {
            InodeWeak::Tree(t) => t.upgrade().map(Inode::Tree),
            InodeWeak::File(f) => f.upgrade().map(Inode::File),
        }
    }
}

/// Where an inode currently sits in the hierarchy.
///
/// Updated only while the mount-wide rename lock is held exclusively, so
/// shared holders of that lock can walk parent chains and trust the result.
pub(crate) struct Location {
    pub parent: Option<Weak<TreeInode>>,
    pub name: Option<PathComponent>,
    pub unlinked: bool,
}

impl Location {
    pub fn root() -> Self {
        Self {
            parent: None,
            name: None,
            unlinked: false,
        }
    }

    pub fn child(parent: &Arc<TreeInode>, name: PathComponent) -> Self {
        Self {
            parent: Some(Arc::downgrade(parent)),
            name: Some(name),
            unlinked: false,
        }
    }
}

/// Reconstructs the path of an inode by walking its parent chain.
/// Returns None if the inode (or an ancestor) has been unlinked.
pub(crate) fn path_from_location(location: &RwLock<Location>) -> Option<RelativePathBuf> {
    let mut components = Vec::new();
    let mut next_parent;
    {
        let loc = location.read();
        if loc.unlinked {
            return None;
        }
        match (&loc.parent, &loc.name) {
            (None, _) => return Some(RelativePathBuf::root()),
            (Some(parent), Some(name)) => {
                components.push(name.clone());
                next_parent = parent.upgrade()?;
            }
            (Some(_), None) => return None,
        }
    }
    loop {
        let loc = next_parent.location().read();
        if loc.unlinked {
            return None;
        }
        match (&loc.parent, &loc.name) {
            (None, _) => break,
            (Some(parent), Some(name)) => {
                components.push(name.clone());
                let parent = parent.upgrade()?;
                drop(loc);
                next_parent = parent;
            }
            (Some(_), None) => return None,
        }
    }
    let mut path = RelativePathBuf::root();
    for name in components.iter().rev() {
        path = path.join(name);
    }
    Some(path)
}

/// Mutable per-inode attributes.
#[derive(Debug, Clone)]
pub struct InodeMetadata {
    pub mode: u32,
    pub mtime: SystemTime,
}

impl InodeMetadata {
    pub fn new(mode: u32) -> Self {
        Self {
            mode,
            mtime: SystemTime::now(),
        }
    }

    pub fn touch(&mut self) {
        self.mtime = SystemTime::now();
    }

    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// The stat-shaped view of an inode returned by getattr.
#[derive(Debug, Clone)]
pub struct FileAttr {
    pub ino: InodeNumber,
    pub mode: u32,
    pub size: u64,
    pub mtime: SystemTime,
    pub is_dir: bool,
}
