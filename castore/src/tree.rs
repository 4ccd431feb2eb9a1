use crate::{ObjectId, PathComponent, TreeError};

/// The kinds of entries a source-control tree can contain.
///
/// Missing from this list, deliberately: hardlinks and device nodes, which
/// source control does not track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Tree,
    RegularFile,
    ExecutableFile,
    Symlink,
}

impl EntryType {
    pub fn is_tree(&self) -> bool {
        matches!(self, EntryType::Tree)
    }

    /// The initial mode bits a fresh inode of this type receives.
    pub fn initial_mode(&self) -> u32 {
        match self {
            EntryType::Tree => 0o040755,
            EntryType::RegularFile => 0o100644,
            EntryType::ExecutableFile => 0o100755,
            EntryType::Symlink => 0o120777,
        }
    }
}

/// A single entry in a [Tree]: the content id of the referenced object and
/// its type. The name lives in the containing tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    id: ObjectId,
    ty: EntryType,
}

impl TreeEntry {
    pub fn new(id: ObjectId, ty: EntryType) -> Self {
        Self { id, ty }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn ty(&self) -> EntryType {
        self.ty
    }
}

/// An immutable source-control tree: an ordered list of named entries.
///
/// Entries are kept sorted byte-lexicographically by name. This is the same
/// order diff and checkout use to walk trees and inode contents in tandem,
/// so iteration order here is load-bearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    id: ObjectId,
    entries: Vec<(PathComponent, TreeEntry)>,
}

impl Tree {
    /// Assembles a tree from an already-sorted entry list.
    /// Unsorted or duplicated names are rejected rather than fixed up, since
    /// they indicate a corrupt object in the store.
    pub fn new(
        id: ObjectId,
        entries: Vec<(PathComponent, TreeEntry)>,
    ) -> Result<Self, TreeError> {
        for pair in entries.windows(2) {
            let (a, _) = &pair[0];
            let (b, _) = &pair[1];
            match a.cmp(b) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => {
                    return Err(TreeError::DuplicateName(b.to_string()))
                }
                std::cmp::Ordering::Greater => {
                    return Err(TreeError::WrongSorting(b.to_string()))
                }
            }
        }
        Ok(Self { id, entries })
    }

    /// The content id this tree is addressed by.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry by name.
    pub fn get(&self, name: &PathComponent) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|(n, _)| n.cmp(name))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Iterates over `(name, entry)` pairs in the canonical walk order.
    pub fn entries(&self) -> impl Iterator<Item = (&PathComponent, &TreeEntry)> {
        self.entries.iter().map(|(n, e)| (n, e))
    }
}
