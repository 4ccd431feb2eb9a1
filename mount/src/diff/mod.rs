//! The diff engine: computes the set of paths where the working copy
//! differs from a source-control tree.
//!
//! Traversal is breadth-within-directory, depth-first across directories.
//! Each directory classifies its entries under its contents lock, then
//! releases the lock and awaits the deferred child comparisons
//! concurrently, so no lock is ever held across a fetch. Unmaterialized
//! subtrees whose ids differ from the target are compared tree-to-tree in
//! the store without touching inodes at all; after a `reset_parent` to a
//! distant commit this is the difference between a metadata walk and
//! materializing half the repository.

pub mod gitignore;

pub use gitignore::{GitIgnore, IgnoreStack, MatchResult};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use canopy_castore::{
    ObjectId, ObjectStore, PathComponent, RelativePathBuf, Tree, TreeEntry,
};

use crate::errors::FsError;
use crate::inodes::TreeInode;

/// Receives one callback per differing path. Implementations must tolerate
/// concurrent invocation from sibling subtree walks.
pub trait DiffCallback: Send + Sync {
    /// Present in the working copy, absent in the tree.
    fn added(&self, path: &RelativePathBuf);
    /// Present in the tree, absent in the working copy.
    fn removed(&self, path: &RelativePathBuf);
    fn modified(&self, path: &RelativePathBuf);
    /// Untracked and matched by an ignore rule. Only reported when
    /// [DiffContext::list_ignored] is set.
    fn ignored(&self, path: &RelativePathBuf);
    /// A subtree failed; siblings keep going.
    fn error(&self, path: &RelativePathBuf, error: &FsError);
}

/// Everything a diff walk carries along.
pub struct DiffContext {
    pub callback: Arc<dyn DiffCallback>,
    pub store: Arc<dyn ObjectStore>,
    pub list_ignored: bool,
    pub token: CancellationToken,
}

impl DiffContext {
    pub fn new(callback: Arc<dyn DiffCallback>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            callback,
            store,
            list_ignored: false,
            token: CancellationToken::new(),
        }
    }

    fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A [DiffCallback] that collects results into sorted sets; the shape the
/// status surface and the checkout pre-pass both consume.
#[derive(Default)]
pub struct ScmStatusCollector {
    inner: Mutex<ScmStatus>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScmStatus {
    pub added: BTreeSet<RelativePathBuf>,
    pub removed: BTreeSet<RelativePathBuf>,
    pub modified: BTreeSet<RelativePathBuf>,
    pub ignored: BTreeSet<RelativePathBuf>,
    pub errors: BTreeMap<RelativePathBuf, String>,
}

impl ScmStatus {
    /// Every path that is added, removed or modified.
    pub fn all_changed(&self) -> BTreeSet<RelativePathBuf> {
        self.added
            .iter()
            .chain(self.removed.iter())
            .chain(self.modified.iter())
            .cloned()
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.errors.is_empty()
    }
}

impl ScmStatusCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self) -> ScmStatus {
        self.inner.lock().clone()
    }
}

impl DiffCallback for ScmStatusCollector {
    fn added(&self, path: &RelativePathBuf) {
        self.inner.lock().added.insert(path.clone());
    }

    fn removed(&self, path: &RelativePathBuf) {
        self.inner.lock().removed.insert(path.clone());
    }

    fn modified(&self, path: &RelativePathBuf) {
        self.inner.lock().modified.insert(path.clone());
    }

    fn ignored(&self, path: &RelativePathBuf) {
        self.inner.lock().ignored.insert(path.clone());
    }

    fn error(&self, path: &RelativePathBuf, error: &FsError) {
        self.inner
            .lock()
            .errors
            .insert(path.clone(), error.to_string());
    }
}

/// A child comparison queued while the parent's contents lock was held and
/// run after it was released.
enum DeferredDiffEntry {
    /// Both sides are trees and the local side is loaded or materialized:
    /// load the child inode and recurse. `to_id == None` means the local
    /// directory is untracked and everything under it is added.
    RecurseInode {
        parent: Arc<TreeInode>,
        name: PathComponent,
        path: RelativePathBuf,
        to_id: Option<ObjectId>,
        ignore_stack: Arc<IgnoreStack>,
        is_ignored: bool,
    },
    /// An unmaterialized local directory absent from the target: walk its
    /// source tree in the store, reporting everything as added.
    AddedScmTree {
        path: RelativePathBuf,
        id: ObjectId,
        ignore_stack: Arc<IgnoreStack>,
        is_ignored: bool,
    },
    /// A target directory absent from the working copy: walk it in the
    /// store, reporting everything as removed.
    RemovedScmTree { path: RelativePathBuf, id: ObjectId },
    /// Both sides are unmaterialized trees with different ids: a pure
    /// store-to-store comparison, no inode involvement.
    ScmVsScm {
        path: RelativePathBuf,
        from_id: ObjectId,
        to_id: ObjectId,
    },
    /// A materialized file vs a source-control entry: load the (cheap)
    /// file inode and compare fingerprints.
    FileInodeCompare {
        parent: Arc<TreeInode>,
        name: PathComponent,
        path: RelativePathBuf,
        theirs: TreeEntry,
    },
    /// Two blobs with different non-bijective ids: fetch both fingerprints.
    FileDigestCompare {
        path: RelativePathBuf,
        mine: ObjectId,
        theirs: ObjectId,
    },
}

impl DeferredDiffEntry {
    fn path(&self) -> RelativePathBuf {
        match self {
            DeferredDiffEntry::RecurseInode { path, .. }
            | DeferredDiffEntry::AddedScmTree { path, .. }
            | DeferredDiffEntry::RemovedScmTree { path, .. }
            | DeferredDiffEntry::ScmVsScm { path, .. }
            | DeferredDiffEntry::FileInodeCompare { path, .. }
            | DeferredDiffEntry::FileDigestCompare { path, .. } => path.clone(),
        }
    }

    async fn run(self, ctx: &DiffContext) -> Result<(), FsError> {
        if ctx.cancelled() {
            return Ok(());
        }
        match self {
            DeferredDiffEntry::RecurseInode {
                parent,
                name,
                path,
                to_id,
                ignore_stack,
                is_ignored,
            } => {
                let child = parent.get_or_load_child(&name).await?;
                let tree = child.as_tree().ok_or_else(|| {
                    FsError::Bug(format!("directory entry {} loaded as file", path))
                })?;
                let to_tree = match to_id {
                    Some(id) => Some(ctx.store.get_tree(&id).await?),
                    None => None,
                };
                tree.diff(ctx, path, to_tree, ignore_stack, is_ignored).await
            }
            DeferredDiffEntry::AddedScmTree {
                path,
                id,
                ignore_stack,
                is_ignored,
            } => {
                let tree = ctx.store.get_tree(&id).await?;
                scm_tree_added(ctx, path, tree, ignore_stack, is_ignored).await
            }
            DeferredDiffEntry::RemovedScmTree { path, id } => {
                let tree = ctx.store.get_tree(&id).await?;
                scm_tree_removed(ctx, path, tree).await
            }
            DeferredDiffEntry::ScmVsScm {
                path,
                from_id,
                to_id,
            } => {
                let (from, to) = futures::try_join!(
                    ctx.store.get_tree(&from_id),
                    ctx.store.get_tree(&to_id),
                )?;
                diff_trees(ctx, path, from, to).await
            }
            DeferredDiffEntry::FileInodeCompare {
                parent,
                name,
                path,
                theirs,
            } => {
                let child = parent.get_or_load_child(&name).await?;
                let file = child.as_file().ok_or_else(|| {
                    FsError::Bug(format!("file entry {} loaded as directory", path))
                })?;
                if !file.is_same_as(&theirs).await? {
                    ctx.callback.modified(&path);
                }
                Ok(())
            }
            DeferredDiffEntry::FileDigestCompare { path, mine, theirs } => {
                let (mine, theirs) = futures::try_join!(
                    ctx.store.get_blob_digest(&mine),
                    ctx.store.get_blob_digest(&theirs),
                )?;
                if mine != theirs {
                    ctx.callback.modified(&path);
                }
                Ok(())
            }
        }
    }
}

enum ImmediateDiff {
    Added(RelativePathBuf),
    Removed(RelativePathBuf),
    Modified(RelativePathBuf),
    Ignored(RelativePathBuf),
}

impl TreeInode {
    /// Diffs this directory against `to_tree` (None means "everything here
    /// is untracked"), reporting results through the context's callback.
    pub(crate) fn diff<'a>(
        self: &'a Arc<Self>,
        ctx: &'a DiffContext,
        path: RelativePathBuf,
        to_tree: Option<Arc<Tree>>,
        ignore_stack: Arc<IgnoreStack>,
        is_ignored: bool,
    ) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            if ctx.cancelled() {
                return Ok(());
            }

            // Unmaterialized and already equal to the target: nothing below
            // here can differ.
            let gitignore_source = {
                let contents = self.contents.read();
                if let Some(to) = &to_tree {
                    if !contents.is_materialized()
                        && contents.source_id.as_ref() == Some(to.id())
                    {
                        return Ok(());
                    }
                }
                contents
                    .entries
                    .get(&gitignore_name())
                    .filter(|entry| !entry.ty().is_tree())
                    .map(|entry| (entry.ino(), entry.source_id().cloned()))
            };

            let ignore_stack = match gitignore_source {
                None => ignore_stack,
                Some((ino, source_id)) => {
                    let contents = match source_id {
                        Some(id) => ctx.store.get_blob(&id).await.map_err(FsError::from),
                        None => self.core.file_access.read_all(ino).await,
                    };
                    match contents {
                        Ok(bytes) => {
                            ignore_stack.push(path.clone(), GitIgnore::parse(&bytes))
                        }
                        Err(error) => {
                            // An unreadable ignore file turns into "no
                            // rules here", not a failed diff.
                            warn!(path = %path, %error, "failed to load .gitignore");
                            ignore_stack
                        }
                    }
                }
            };

            let mut immediate: Vec<ImmediateDiff> = Vec::new();
            let mut deferred: Vec<DeferredDiffEntry> = Vec::new();
            {
                let contents = self.contents.read();
                let to_entries: Vec<(&PathComponent, &TreeEntry)> = to_tree
                    .as_ref()
                    .map(|t| t.entries().collect())
                    .unwrap_or_default();
                let inode_entries: Vec<_> = contents.entries.iter().collect();

                let mut i = 0;
                let mut j = 0;
                while i < inode_entries.len() || j < to_entries.len() {
                    let order = match (inode_entries.get(i), to_entries.get(j)) {
                        (Some((mine, _)), Some((theirs, _))) => mine.cmp(theirs),
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (None, None) => unreachable!(),
                    };
                    match order {
                        std::cmp::Ordering::Less => {
                            let (name, entry) = inode_entries[i];
                            self.classify_untracked(
                                ctx,
                                &path,
                                name,
                                entry,
                                &ignore_stack,
                                is_ignored,
                                &mut immediate,
                                &mut deferred,
                            );
                            i += 1;
                        }
                        std::cmp::Ordering::Greater => {
                            let (name, theirs) = to_entries[j];
                            classify_removed(&path, name, theirs, &mut immediate, &mut deferred);
                            j += 1;
                        }
                        std::cmp::Ordering::Equal => {
                            let (name, entry) = inode_entries[i];
                            let (_, theirs) = to_entries[j];
                            self.classify_both(
                                ctx,
                                &path,
                                name,
                                entry,
                                theirs,
                                &ignore_stack,
                                is_ignored,
                                &mut immediate,
                                &mut deferred,
                            );
                            i += 1;
                            j += 1;
                        }
                    }
                }
            }

            for event in immediate {
                match event {
                    ImmediateDiff::Added(p) => ctx.callback.added(&p),
                    ImmediateDiff::Removed(p) => ctx.callback.removed(&p),
                    ImmediateDiff::Modified(p) => ctx.callback.modified(&p),
                    ImmediateDiff::Ignored(p) => ctx.callback.ignored(&p),
                }
            }

            // Child comparisons run concurrently; one failing subtree is an
            // error callback, not a failed diff.
            futures::future::join_all(deferred.into_iter().map(|entry| {
                let entry_path = entry.path();
                async move {
                    if let Err(error) = entry.run(ctx).await {
                        ctx.callback.error(&entry_path, &error);
                    }
                }
            }))
            .await;
            Ok(())
        }
        .boxed()
    }

    /// A name present in the working copy but not in the target tree.
    #[allow(clippy::too_many_arguments)]
    fn classify_untracked(
        self: &Arc<Self>,
        ctx: &DiffContext,
        dir_path: &RelativePathBuf,
        name: &PathComponent,
        entry: &crate::inodes::DirEntry,
        ignore_stack: &Arc<IgnoreStack>,
        parent_ignored: bool,
        immediate: &mut Vec<ImmediateDiff>,
        deferred: &mut Vec<DeferredDiffEntry>,
    ) {
        let path = dir_path.join(name);
        let is_dir = entry.ty().is_tree();
        let entry_ignored = parent_ignored || ignore_stack.is_ignored(&path, is_dir);

        if is_dir {
            if entry_ignored && !ctx.list_ignored {
                return;
            }
            match (entry.inode(), entry.source_id()) {
                (None, Some(id)) => deferred.push(DeferredDiffEntry::AddedScmTree {
                    path,
                    id: id.clone(),
                    ignore_stack: ignore_stack.clone(),
                    is_ignored: entry_ignored,
                }),
                _ => deferred.push(DeferredDiffEntry::RecurseInode {
                    parent: self.clone(),
                    name: name.clone(),
                    path,
                    to_id: None,
                    ignore_stack: ignore_stack.clone(),
                    is_ignored: entry_ignored,
                }),
            }
        } else if entry_ignored {
            if ctx.list_ignored {
                immediate.push(ImmediateDiff::Ignored(path));
            }
        } else {
            immediate.push(ImmediateDiff::Added(path));
        }
    }

    /// A name present on both sides.
    #[allow(clippy::too_many_arguments)]
    fn classify_both(
        self: &Arc<Self>,
        ctx: &DiffContext,
        dir_path: &RelativePathBuf,
        name: &PathComponent,
        entry: &crate::inodes::DirEntry,
        theirs: &TreeEntry,
        ignore_stack: &Arc<IgnoreStack>,
        parent_ignored: bool,
        immediate: &mut Vec<ImmediateDiff>,
        deferred: &mut Vec<DeferredDiffEntry>,
    ) {
        let path = dir_path.join(name);
        match (entry.ty().is_tree(), theirs.ty().is_tree()) {
            (true, true) => {
                if !entry.is_loaded() {
                    match entry.source_id() {
                        Some(id) if id == theirs.id() => {}
                        Some(id) => deferred.push(DeferredDiffEntry::ScmVsScm {
                            path,
                            from_id: id.clone(),
                            to_id: theirs.id().clone(),
                        }),
                        None => deferred.push(DeferredDiffEntry::RecurseInode {
                            parent: self.clone(),
                            name: name.clone(),
                            path: path.clone(),
                            to_id: Some(theirs.id().clone()),
                            ignore_stack: ignore_stack.clone(),
                            is_ignored: parent_ignored
                                || ignore_stack.is_ignored(&path, true),
                        }),
                    }
                } else {
                    deferred.push(DeferredDiffEntry::RecurseInode {
                        parent: self.clone(),
                        name: name.clone(),
                        path: path.clone(),
                        to_id: Some(theirs.id().clone()),
                        ignore_stack: ignore_stack.clone(),
                        is_ignored: parent_ignored || ignore_stack.is_ignored(&path, true),
                    });
                }
            }
            (false, false) => {
                if entry.is_materialized() || entry.is_loaded() {
                    deferred.push(DeferredDiffEntry::FileInodeCompare {
                        parent: self.clone(),
                        name: name.clone(),
                        path,
                        theirs: theirs.clone(),
                    });
                } else {
                    let mine = entry.source_id().expect("unmaterialized entry has an id");
                    if entry.ty() != theirs.ty() {
                        immediate.push(ImmediateDiff::Modified(path));
                    } else if mine == theirs.id() {
                        // Identical object, identical type.
                    } else if ctx.store.bijective_blob_ids() {
                        immediate.push(ImmediateDiff::Modified(path));
                    } else {
                        deferred.push(DeferredDiffEntry::FileDigestCompare {
                            path,
                            mine: mine.clone(),
                            theirs: theirs.id().clone(),
                        });
                    }
                }
            }
            // Type flip: the target side disappears, the local side is
            // untracked content at the same name.
            _ => {
                classify_removed(dir_path, name, theirs, immediate, deferred);
                self.classify_untracked(
                    ctx,
                    dir_path,
                    name,
                    entry,
                    ignore_stack,
                    parent_ignored,
                    immediate,
                    deferred,
                );
            }
        }
    }
}

/// A name present only in the target tree.
fn classify_removed(
    dir_path: &RelativePathBuf,
    name: &PathComponent,
    theirs: &TreeEntry,
    immediate: &mut Vec<ImmediateDiff>,
    deferred: &mut Vec<DeferredDiffEntry>,
) {
    let path = dir_path.join(name);
    if theirs.ty().is_tree() {
        deferred.push(DeferredDiffEntry::RemovedScmTree {
            path,
            id: theirs.id().clone(),
        });
    } else {
        immediate.push(ImmediateDiff::Removed(path));
    }
}

fn gitignore_name() -> PathComponent {
    PathComponent::try_from(".gitignore").expect("valid component")
}

/// Store-to-store comparison of two trees; neither side has inode state.
fn diff_trees<'a>(
    ctx: &'a DiffContext,
    path: RelativePathBuf,
    from: Arc<Tree>,
    to: Arc<Tree>,
) -> BoxFuture<'a, Result<(), FsError>> {
    async move {
        if ctx.cancelled() {
            return Ok(());
        }
        let mut deferred: Vec<DeferredDiffEntry> = Vec::new();
        let mut immediate: Vec<ImmediateDiff> = Vec::new();

        let from_entries: Vec<_> = from.entries().collect();
        let to_entries: Vec<_> = to.entries().collect();
        let mut i = 0;
        let mut j = 0;
        while i < from_entries.len() || j < to_entries.len() {
            let order = match (from_entries.get(i), to_entries.get(j)) {
                (Some((mine, _)), Some((theirs, _))) => mine.cmp(theirs),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => unreachable!(),
            };
            match order {
                std::cmp::Ordering::Less => {
                    let (name, mine) = from_entries[i];
                    let child = path.join(name);
                    if mine.ty().is_tree() {
                        deferred.push(DeferredDiffEntry::AddedScmTree {
                            path: child,
                            id: mine.id().clone(),
                            ignore_stack: IgnoreStack::empty(),
                            is_ignored: false,
                        });
                    } else {
                        immediate.push(ImmediateDiff::Added(child));
                    }
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    let (name, theirs) = to_entries[j];
                    classify_removed(&path, name, theirs, &mut immediate, &mut deferred);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    let (name, mine) = from_entries[i];
                    let (_, theirs) = to_entries[j];
                    let child = path.join(name);
                    match (mine.ty().is_tree(), theirs.ty().is_tree()) {
                        (true, true) => {
                            if mine.id() != theirs.id() {
                                deferred.push(DeferredDiffEntry::ScmVsScm {
                                    path: child,
                                    from_id: mine.id().clone(),
                                    to_id: theirs.id().clone(),
                                });
                            }
                        }
                        (false, false) => {
                            if mine.ty() != theirs.ty() {
                                immediate.push(ImmediateDiff::Modified(child));
                            } else if mine.id() == theirs.id() {
                                // Unchanged.
                            } else if ctx.store.bijective_blob_ids() {
                                immediate.push(ImmediateDiff::Modified(child));
                            } else {
                                deferred.push(DeferredDiffEntry::FileDigestCompare {
                                    path: child,
                                    mine: mine.id().clone(),
                                    theirs: theirs.id().clone(),
                                });
                            }
                        }
                        (mine_is_dir, _) => {
                            classify_removed(
                                &path,
                                name,
                                theirs,
                                &mut immediate,
                                &mut deferred,
                            );
                            if mine_is_dir {
                                deferred.push(DeferredDiffEntry::AddedScmTree {
                                    path: child,
                                    id: mine.id().clone(),
                                    ignore_stack: IgnoreStack::empty(),
                                    is_ignored: false,
                                });
                            } else {
                                immediate.push(ImmediateDiff::Added(child));
                            }
                        }
                    }
                    i += 1;
                    j += 1;
                }
            }
        }

        for event in immediate {
            match event {
                ImmediateDiff::Added(p) => ctx.callback.added(&p),
                ImmediateDiff::Removed(p) => ctx.callback.removed(&p),
                ImmediateDiff::Modified(p) => ctx.callback.modified(&p),
                ImmediateDiff::Ignored(p) => ctx.callback.ignored(&p),
            }
        }

        for entry in deferred {
            let entry_path = entry.path();
            if let Err(error) = entry.run(ctx).await {
                ctx.callback.error(&entry_path, &error);
            }
        }
        Ok(())
    }
    .boxed()
}

/// Reports every file under an unmaterialized tree as added (or ignored).
fn scm_tree_added<'a>(
    ctx: &'a DiffContext,
    path: RelativePathBuf,
    tree: Arc<Tree>,
    ignore_stack: Arc<IgnoreStack>,
    is_ignored: bool,
) -> BoxFuture<'a, Result<(), FsError>> {
    async move {
        if ctx.cancelled() {
            return Ok(());
        }
        for (name, entry) in tree.entries() {
            let child = path.join(name);
            if entry.ty().is_tree() {
                let entry_ignored = is_ignored || ignore_stack.is_ignored(&child, true);
                if entry_ignored && !ctx.list_ignored {
                    continue;
                }
                let subtree = ctx.store.get_tree(entry.id()).await?;
                scm_tree_added(ctx, child, subtree, ignore_stack.clone(), entry_ignored)
                    .await?;
            } else {
                let entry_ignored = is_ignored || ignore_stack.is_ignored(&child, false);
                if entry_ignored {
                    if ctx.list_ignored {
                        ctx.callback.ignored(&child);
                    }
                } else {
                    ctx.callback.added(&child);
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Reports every file under a target-side tree as removed.
fn scm_tree_removed<'a>(
    ctx: &'a DiffContext,
    path: RelativePathBuf,
    tree: Arc<Tree>,
) -> BoxFuture<'a, Result<(), FsError>> {
    async move {
        if ctx.cancelled() {
            return Ok(());
        }
        for (name, entry) in tree.entries() {
            let child = path.join(name);
            if entry.ty().is_tree() {
                let subtree = ctx.store.get_tree(entry.id()).await?;
                scm_tree_removed(ctx, child, subtree).await?;
            } else {
                ctx.callback.removed(&child);
            }
        }
        Ok(())
    }
    .boxed()
}
