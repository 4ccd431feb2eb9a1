//! The checkout engine: transitions the working copy between two
//! source-control roots, preserving local changes where possible and
//! reporting conflicts where not.
//!
//! Each directory plans its work under its contents lock (a list of
//! [CheckoutAction]s for entries that need loaded inodes or fetched trees,
//! plus in-place updates for unloaded unmodified entries), releases the
//! lock, runs the actions concurrently, and finally reconciles itself:
//! either it dematerializes against the target tree or it records that it
//! has diverged. Unloading free inodes beforehand makes the in-place swap
//! the common path, which is what lets a checkout across a large repository
//! avoid loading it.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{instrument, warn};

use canopy_castore::{EntryType, PathComponent, RelativePathBuf, Tree, TreeEntry};

use crate::errors::FsError;
use crate::inodes::{DirEntry, FileInode, Inode, InodeNumber, TreeInode};
use crate::mount::MountCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Detect conflicts without writing anything.
    DryRun,
    /// Apply the transition; conflicts suppress the destructive change at
    /// their path.
    Normal,
    /// Apply the transition; conflicts are recorded but overridden.
    Force,
}

/// The conflict taxonomy. Names read as `<local state>_<target action>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConflictType {
    UntrackedAdded,
    ModifiedModified,
    ModifiedRemoved,
    RemovedModified,
    /// Informational: the file was already gone locally and the target
    /// removes it too.
    MissingRemoved,
    DirectoryNotEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: RelativePathBuf,
    pub ty: ConflictType,
}

#[derive(Debug, Clone)]
pub struct CheckoutError {
    pub path: RelativePathBuf,
    pub error: FsError,
}

/// What a checkout returns: every conflict and every per-entry error, in
/// path order. The overall operation completes even when entries fail.
#[derive(Debug, Default)]
pub struct CheckoutResult {
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<CheckoutError>,
}

impl CheckoutResult {
    pub fn conflict_types(&self) -> Vec<ConflictType> {
        self.conflicts.iter().map(|c| c.ty).collect()
    }
}

/// Shared state for one checkout operation.
pub(crate) struct CheckoutContext {
    mode: CheckoutMode,
    core: Arc<MountCore>,
    conflicts: Mutex<Vec<Conflict>>,
    errors: Mutex<Vec<CheckoutError>>,
}

impl CheckoutContext {
    pub fn new(core: Arc<MountCore>, mode: CheckoutMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            core,
            conflicts: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        })
    }

    /// Whether this checkout writes changes.
    pub fn apply(&self) -> bool {
        self.mode != CheckoutMode::DryRun
    }

    pub fn force(&self) -> bool {
        self.mode == CheckoutMode::Force
    }

    pub fn add_conflict(&self, ty: ConflictType, path: RelativePathBuf) {
        self.conflicts.lock().push(Conflict { path, ty });
    }

    pub fn add_error(&self, path: RelativePathBuf, error: FsError) {
        self.errors.lock().push(CheckoutError { path, error });
    }

    /// Asks the kernel to drop its caches for one entry. On transports
    /// where invalidation also rewrites on-disk state, a failure is
    /// recorded as a checkout error; elsewhere it is logged.
    pub async fn invalidate_entry(
        &self,
        parent: crate::inodes::InodeNumber,
        name: &PathComponent,
        path: RelativePathBuf,
    ) {
        if !self.apply() {
            return;
        }
        if let Err(error) = self.core.channel.invalidate_entry(parent, name).await {
            if self.core.channel.kind().invalidation_failure_is_fatal() {
                self.add_error(path, error);
            } else {
                warn!(path = %path, %error, "entry invalidation failed");
            }
        }
    }

    pub async fn invalidate_dir(&self, ino: crate::inodes::InodeNumber, path: RelativePathBuf) {
        if !self.apply() {
            return;
        }
        if let Err(error) = self.core.channel.invalidate_dir(ino).await {
            if self.core.channel.kind().invalidation_failure_is_fatal() {
                self.add_error(path, error);
            } else {
                warn!(path = %path, %error, "directory invalidation failed");
            }
        }
    }

    pub async fn flush_invalidations(&self) {
        if !self.apply() {
            return;
        }
        if let Err(error) = self.core.channel.flush_invalidations().await {
            if self.core.channel.kind().invalidation_failure_is_fatal() {
                self.add_error(RelativePathBuf::root(), error);
            } else {
                warn!(%error, "invalidation flush failed");
            }
        }
    }

    /// Drains the recorded conflicts and errors into the caller-facing
    /// result, sorted by path for determinism.
    pub fn into_result(&self) -> CheckoutResult {
        let mut conflicts = std::mem::take(&mut *self.conflicts.lock());
        let mut errors = std::mem::take(&mut *self.errors.lock());
        conflicts.sort_by(|a, b| a.path.cmp(&b.path).then(a.ty.cmp(&b.ty)));
        errors.sort_by(|a, b| a.path.cmp(&b.path));
        CheckoutResult { conflicts, errors }
    }
}

/// What one applied action asks its parent to invalidate.
pub(crate) struct ActionOutcome {
    invalidate: Option<PathComponent>,
    list_modified: bool,
}

impl ActionOutcome {
    fn none() -> Self {
        Self {
            invalidate: None,
            list_modified: false,
        }
    }

    fn entry(name: PathComponent) -> Self {
        Self {
            invalidate: Some(name),
            list_modified: false,
        }
    }

    fn entry_and_list(name: PathComponent) -> Self {
        Self {
            invalidate: Some(name),
            list_modified: true,
        }
    }
}

/// An entry whose processing needs a loaded inode or a fetched tree, built
/// under the parent's contents lock and run after it is released.
pub(crate) struct CheckoutAction {
    name: PathComponent,
    from: Option<TreeEntry>,
    to: Option<TreeEntry>,
}

impl CheckoutAction {
    async fn run(
        self,
        ctx: Arc<CheckoutContext>,
        parent: Arc<TreeInode>,
    ) -> Result<ActionOutcome, (RelativePathBuf, FsError)> {
        let path = parent.path().unwrap_or_default().join(&self.name);
        let result = async {
            let child = parent.get_or_load_child(&self.name).await?;
            match child {
                Inode::Tree(tree) => {
                    parent
                        .checkout_update_tree(&ctx, &self.name, tree, self.from, self.to, &path)
                        .await
                }
                Inode::File(file) => {
                    parent
                        .checkout_update_file(&ctx, &self.name, file, self.from, self.to, &path)
                        .await
                }
            }
        }
        .await;
        result.map_err(|error| (path, error))
    }
}

#[derive(Default)]
struct CheckoutPlan {
    actions: Vec<CheckoutAction>,
    invalidations: Vec<PathComponent>,
    list_modified: bool,
    forget: Vec<InodeNumber>,
}

impl TreeInode {
    /// Applies the `from_tree` -> `to_tree` transition to this directory
    /// and everything below it. `to_tree == None` removes the subtree's
    /// tracked contents.
    pub(crate) fn checkout(
        self: Arc<Self>,
        ctx: Arc<CheckoutContext>,
        from_tree: Option<Arc<Tree>>,
        to_tree: Option<Arc<Tree>>,
    ) -> BoxFuture<'static, Result<(), FsError>> {
        async move {
            if self.can_short_circuit(&ctx, from_tree.as_deref(), to_tree.as_deref()) {
                return Ok(());
            }

            let dir_path = self.path().unwrap_or_default();
            let mut plan = CheckoutPlan::default();
            {
                let mut contents = self.contents.write();
                self.compute_checkout_actions(
                    &ctx,
                    &mut contents,
                    &dir_path,
                    from_tree.as_deref(),
                    to_tree.as_deref(),
                    &mut plan,
                );
            }
            for ino in plan.forget.drain(..) {
                self.core.inode_map.forget(ino);
            }

            // Run the per-entry actions concurrently; the contents lock is
            // not held while they fetch and recurse.
            let outcomes = futures::future::join_all(plan.actions.into_iter().map(|action| {
                action.run(ctx.clone(), self.clone())
            }))
            .await;

            let mut invalidations = plan.invalidations;
            let mut list_modified = plan.list_modified;
            for outcome in outcomes {
                match outcome {
                    Ok(outcome) => {
                        if let Some(name) = outcome.invalidate {
                            invalidations.push(name);
                        }
                        list_modified |= outcome.list_modified;
                    }
                    Err((path, error)) => ctx.add_error(path, error),
                }
            }

            for name in invalidations {
                let path = dir_path.join(&name);
                ctx.invalidate_entry(self.ino(), &name, path).await;
            }
            if list_modified {
                ctx.invalidate_dir(self.ino(), dir_path.clone()).await;
            }

            if ctx.apply() {
                self.save_overlay_post_checkout(from_tree.as_deref(), to_tree.as_deref())
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// An unmaterialized directory already at the destination needs no
    /// work, provided it is also where the transition expects it to start
    /// (or the caller forces).
    fn can_short_circuit(
        &self,
        ctx: &CheckoutContext,
        from_tree: Option<&Tree>,
        to_tree: Option<&Tree>,
    ) -> bool {
        let contents = self.contents.read();
        if contents.is_materialized() {
            return false;
        }
        let Some(to) = to_tree else { return false };
        if contents.source_id.as_ref() != Some(to.id()) {
            return false;
        }
        match from_tree {
            None => true,
            Some(from) => contents.source_id.as_ref() == Some(from.id()) || ctx.force(),
        }
    }

    /// Walks the from/to entry lists in tandem and classifies every name:
    /// direct mutations for unloaded unmodified entries, conflicts for
    /// entries that cannot be reconciled without inspection, actions for
    /// everything needing a loaded inode. Runs entirely under the contents
    /// write lock, with no suspension.
    fn compute_checkout_actions(
        &self,
        ctx: &CheckoutContext,
        contents: &mut crate::inodes::tree::TreeContents,
        dir_path: &RelativePathBuf,
        from_tree: Option<&Tree>,
        to_tree: Option<&Tree>,
        plan: &mut CheckoutPlan,
    ) {
        let from_entries: Vec<(&PathComponent, &TreeEntry)> = from_tree
            .map(|t| t.entries().collect())
            .unwrap_or_default();
        let to_entries: Vec<(&PathComponent, &TreeEntry)> =
            to_tree.map(|t| t.entries().collect()).unwrap_or_default();

        let mut i = 0;
        let mut j = 0;
        while i < from_entries.len() || j < to_entries.len() {
            let order = match (from_entries.get(i), to_entries.get(j)) {
                (Some((f, _)), Some((t, _))) => f.cmp(t),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => unreachable!(),
            };
            match order {
                std::cmp::Ordering::Less => {
                    let (name, from_entry) = from_entries[i];
                    self.process_checkout_entry(
                        ctx,
                        contents,
                        dir_path,
                        name,
                        Some(from_entry),
                        None,
                        plan,
                    );
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    let (name, to_entry) = to_entries[j];
                    self.process_checkout_entry(
                        ctx,
                        contents,
                        dir_path,
                        name,
                        None,
                        Some(to_entry),
                        plan,
                    );
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    let (name, from_entry) = from_entries[i];
                    let (_, to_entry) = to_entries[j];
                    self.process_checkout_entry(
                        ctx,
                        contents,
                        dir_path,
                        name,
                        Some(from_entry),
                        Some(to_entry),
                        plan,
                    );
                    i += 1;
                    j += 1;
                }
            }
        }

        // When the target drops this directory entirely, force mode also
        // sweeps out untracked leftovers so the removal can complete.
        if to_tree.is_none() && ctx.force() {
            let tracked: BTreeSet<&PathComponent> =
                from_entries.iter().map(|(name, _)| *name).collect();
            let untracked: Vec<PathComponent> = contents
                .entries
                .keys()
                .filter(|name| !tracked.contains(name))
                .cloned()
                .collect();
            for name in untracked {
                plan.actions.push(CheckoutAction {
                    name,
                    from: None,
                    to: None,
                });
            }
        }
    }

    fn process_checkout_entry(
        &self,
        ctx: &CheckoutContext,
        contents: &mut crate::inodes::tree::TreeContents,
        dir_path: &RelativePathBuf,
        name: &PathComponent,
        from: Option<&TreeEntry>,
        to: Option<&TreeEntry>,
        plan: &mut CheckoutPlan,
    ) {
        let path = dir_path.join(name);
        if !contents.entries.contains_key(name) {
            // The working copy has no entry at this name.
            match (from, to) {
                (None, Some(to_entry)) => {
                    if ctx.apply() {
                        let ino = self.core.overlay.allocate_inode_number();
                        contents
                            .entries
                            .insert(name.clone(), DirEntry::from_source(ino, to_entry));
                        contents.bump();
                        plan.invalidations.push(name.clone());
                        plan.list_modified = true;
                    }
                }
                (Some(_), None) => {
                    ctx.add_conflict(ConflictType::MissingRemoved, path);
                }
                (Some(from_entry), Some(to_entry)) => {
                    if from_entry != to_entry {
                        // Locally removed, changed in the target. The local
                        // removal wins unless forced.
                        ctx.add_conflict(ConflictType::RemovedModified, path);
                        if ctx.force() && ctx.apply() {
                            let ino = self.core.overlay.allocate_inode_number();
                            contents
                                .entries
                                .insert(name.clone(), DirEntry::from_source(ino, to_entry));
                            contents.bump();
                            plan.invalidations.push(name.clone());
                            plan.list_modified = true;
                        }
                    }
                }
                (None, None) => {}
            }
            return;
        }
        let entry = contents.entries.get_mut(name).expect("presence just checked");

        match (from, to) {
            (None, Some(to_entry)) => {
                if entry.ty().is_tree() && to_entry.ty().is_tree() {
                    // An untracked local directory meeting a new tracked
                    // tree: merge, reporting per-file conflicts inside.
                    plan.actions.push(CheckoutAction {
                        name: name.clone(),
                        from: None,
                        to: Some(to_entry.clone()),
                    });
                } else {
                    ctx.add_conflict(ConflictType::UntrackedAdded, path);
                    if ctx.force() {
                        plan.actions.push(CheckoutAction {
                            name: name.clone(),
                            from: None,
                            to: Some(to_entry.clone()),
                        });
                    }
                }
            }
            (Some(from_entry), None) => {
                if !entry.is_loaded() && entry.matches_source(from_entry) {
                    // Unmodified and unloaded: drop the entry without
                    // loading anything.
                    if ctx.apply() {
                        let removed = contents.entries.remove(name).expect("entry exists");
                        plan.forget.push(removed.ino());
                        contents.bump();
                        plan.invalidations.push(name.clone());
                        plan.list_modified = true;
                    }
                } else if !entry.is_loaded() && !entry.is_materialized() {
                    // Points at some other source object (a previous
                    // reset-parent): diverged from `from`.
                    ctx.add_conflict(ConflictType::ModifiedRemoved, path);
                    if ctx.force() && ctx.apply() {
                        let removed = contents.entries.remove(name).expect("entry exists");
                        plan.forget.push(removed.ino());
                        contents.bump();
                        plan.invalidations.push(name.clone());
                        plan.list_modified = true;
                    }
                } else {
                    plan.actions.push(CheckoutAction {
                        name: name.clone(),
                        from: Some(from_entry.clone()),
                        to: None,
                    });
                }
            }
            (Some(from_entry), Some(to_entry)) => {
                if !entry.is_loaded() && !entry.is_materialized() {
                    if entry.matches_source(to_entry) {
                        // Already at the destination.
                    } else if entry.matches_source(from_entry) {
                        if ctx.apply() {
                            if entry.ty().is_tree() == to_entry.ty().is_tree() {
                                // The in-place swap: an unmodified,
                                // unloaded entry moves to the new object by
                                // pointer update, subtree included.
                                entry.set_source(to_entry);
                            } else {
                                let removed =
                                    contents.entries.remove(name).expect("entry exists");
                                plan.forget.push(removed.ino());
                                let ino = self.core.overlay.allocate_inode_number();
                                contents
                                    .entries
                                    .insert(name.clone(), DirEntry::from_source(ino, to_entry));
                                plan.list_modified = true;
                            }
                            contents.bump();
                            plan.invalidations.push(name.clone());
                        }
                    } else {
                        // Matches neither endpoint; load and compare.
                        plan.actions.push(CheckoutAction {
                            name: name.clone(),
                            from: Some(from_entry.clone()),
                            to: Some(to_entry.clone()),
                        });
                    }
                } else {
                    plan.actions.push(CheckoutAction {
                        name: name.clone(),
                        from: Some(from_entry.clone()),
                        to: Some(to_entry.clone()),
                    });
                }
            }
            (None, None) => {
                // Only the force-removal sweep produces this, and it
                // handles entries directly.
            }
        }
    }

    /// Handles an action whose loaded inode turned out to be a directory.
    async fn checkout_update_tree(
        self: &Arc<Self>,
        ctx: &Arc<CheckoutContext>,
        name: &PathComponent,
        child: Arc<TreeInode>,
        from: Option<TreeEntry>,
        to: Option<TreeEntry>,
        path: &RelativePathBuf,
    ) -> Result<ActionOutcome, FsError> {
        let from_is_tree = from.as_ref().map(|e| e.ty().is_tree()).unwrap_or(false);
        let to_is_tree = to.as_ref().map(|e| e.ty().is_tree()).unwrap_or(false);

        if to_is_tree {
            let to_entry = to.expect("to_is_tree");
            if from.is_some() && !from_is_tree {
                // The transition starts from a file, but the user has a
                // directory here.
                ctx.add_conflict(ConflictType::ModifiedModified, path.clone());
                if !ctx.force() {
                    return Ok(ActionOutcome::none());
                }
                child.clone().checkout(ctx.clone(), None, None).await?;
                return self.finish_replace_dir(ctx, name, child, Some(to_entry), path).await;
            }
            let from_sub = match &from {
                Some(entry) if from_is_tree => {
                    Some(self.core.store.get_tree(entry.id()).await?)
                }
                _ => None,
            };
            let to_sub = self.core.store.get_tree(to_entry.id()).await?;
            child.checkout(ctx.clone(), from_sub, Some(to_sub)).await?;
            // The child handled its own invalidation and reconciliation.
            return Ok(ActionOutcome::none());
        }

        // The target replaces this directory with a file, or removes it.
        if from.is_none() && !ctx.force() {
            // Untracked directory; the conflict was recorded upstream.
            return Ok(ActionOutcome::none());
        }
        if from.is_some() && !from_is_tree {
            // The transition starts from a file but the user has a
            // directory: local divergence.
            ctx.add_conflict(
                if to.is_some() {
                    ConflictType::ModifiedModified
                } else {
                    ConflictType::ModifiedRemoved
                },
                path.clone(),
            );
            if !ctx.force() {
                return Ok(ActionOutcome::none());
            }
        }
        let from_sub = match &from {
            Some(entry) if from_is_tree => Some(self.core.store.get_tree(entry.id()).await?),
            _ => None,
        };
        child.clone().checkout(ctx.clone(), from_sub, None).await?;
        self.finish_replace_dir(ctx, name, child, to, path).await
    }

    /// After a subtree removal recursed, drops the (now hopefully empty)
    /// directory entry and installs the replacement, if any.
    async fn finish_replace_dir(
        self: &Arc<Self>,
        ctx: &Arc<CheckoutContext>,
        name: &PathComponent,
        child: Arc<TreeInode>,
        to: Option<TreeEntry>,
        path: &RelativePathBuf,
    ) -> Result<ActionOutcome, FsError> {
        if !ctx.apply() {
            // Nothing was actually removed in a dry run; predict the
            // outcome instead: a subtree with local state would refuse.
            if child.is_materialized() {
                ctx.add_conflict(ConflictType::DirectoryNotEmpty, path.clone());
            }
            return Ok(ActionOutcome::none());
        }

        let removed = {
            let mut contents = self.contents.write();
            let child_contents = child.contents.write();
            if child_contents.entries.is_empty() {
                if let Some(entry) = contents.entries.remove(name) {
                    child.location().write().unlinked = true;
                    contents.bump();
                    Some(entry)
                } else {
                    None
                }
            } else {
                None
            }
        };

        let Some(removed_entry) = removed else {
            ctx.add_conflict(ConflictType::DirectoryNotEmpty, path.clone());
            return Ok(ActionOutcome::none());
        };

        self.core
            .overlay
            .remove_overlay_data(removed_entry.ino())
            .await?;
        self.core.inode_map.forget(removed_entry.ino());

        if let Some(to_entry) = to {
            let ino = self.core.overlay.allocate_inode_number();
            let mut contents = self.contents.write();
            contents
                .entries
                .insert(name.clone(), DirEntry::from_source(ino, &to_entry));
            contents.bump();
        }
        Ok(ActionOutcome::entry_and_list(name.clone()))
    }

    /// Handles an action whose loaded inode turned out to be a file.
    async fn checkout_update_file(
        self: &Arc<Self>,
        ctx: &Arc<CheckoutContext>,
        name: &PathComponent,
        file: Arc<FileInode>,
        from: Option<TreeEntry>,
        to: Option<TreeEntry>,
        path: &RelativePathBuf,
    ) -> Result<ActionOutcome, FsError> {
        let from_entry = match from {
            Some(entry) => entry,
            None => {
                // Untracked local file (or the force-removal sweep). The
                // UNTRACKED_ADDED conflict was recorded during planning;
                // only force reaches this far.
                if !ctx.force() || !ctx.apply() {
                    return Ok(ActionOutcome::none());
                }
                return match to {
                    Some(to_entry) => self.apply_file_update(name, &file, &to_entry).await,
                    None => self.remove_file_entry(name, &file).await,
                };
            }
        };

        let unmodified = file.is_same_as(&from_entry).await?;
        match to {
            Some(to_entry) => {
                if !unmodified {
                    ctx.add_conflict(ConflictType::ModifiedModified, path.clone());
                    if !ctx.force() {
                        return Ok(ActionOutcome::none());
                    }
                }
                if !ctx.apply() {
                    return Ok(ActionOutcome::none());
                }
                if file.source_id().as_ref() == Some(to_entry.id()) {
                    // Already the target object.
                    return Ok(ActionOutcome::none());
                }
                self.apply_file_update(name, &file, &to_entry).await
            }
            None => {
                if !unmodified {
                    ctx.add_conflict(ConflictType::ModifiedRemoved, path.clone());
                    if !ctx.force() {
                        return Ok(ActionOutcome::none());
                    }
                }
                if !ctx.apply() {
                    return Ok(ActionOutcome::none());
                }
                self.remove_file_entry(name, &file).await
            }
        }
    }

    /// Points a loaded file (and its entry) at the target object.
    async fn apply_file_update(
        self: &Arc<Self>,
        name: &PathComponent,
        file: &Arc<FileInode>,
        to_entry: &TreeEntry,
    ) -> Result<ActionOutcome, FsError> {
        // A symlink cannot become a regular file in place (or vice versa);
        // the loaded inode's shape is fixed, so the entry is replaced
        // outright and the target loads fresh on next lookup.
        let wants_symlink = to_entry.ty() == EntryType::Symlink;
        if file.is_symlink() != wants_symlink {
            let outcome = self.remove_file_entry(name, file).await?;
            let ino = self.core.overlay.allocate_inode_number();
            let mut contents = self.contents.write();
            contents
                .entries
                .insert(name.clone(), DirEntry::from_source(ino, to_entry));
            contents.bump();
            return Ok(outcome);
        }

        file.update_source(to_entry).await?;
        {
            let mut contents = self.contents.write();
            if let Some(entry) = contents.entries.get_mut(name) {
                entry.set_source(to_entry);
                contents.bump();
            }
        }
        Ok(ActionOutcome::entry(name.clone()))
    }

    async fn remove_file_entry(
        self: &Arc<Self>,
        name: &PathComponent,
        file: &Arc<FileInode>,
    ) -> Result<ActionOutcome, FsError> {
        let removed = {
            let mut contents = self.contents.write();
            match contents.entries.remove(name) {
                Some(entry) => {
                    file.location().write().unlinked = true;
                    contents.bump();
                    Some(entry)
                }
                None => None,
            }
        };
        if let Some(entry) = removed {
            if entry.is_materialized() {
                self.core.overlay.remove_overlay_data(entry.ino()).await?;
                self.core.file_access.forget(entry.ino());
            }
            self.core.inode_map.forget(entry.ino());
        }
        Ok(ActionOutcome::entry_and_list(name.clone()))
    }

    /// Post-checkout reconciliation: dematerialize against the target tree
    /// when every entry matches it, otherwise record the divergence, and
    /// persist either way (the entries map may carry fresh inode number
    /// assignments even when dematerialized).
    #[instrument(skip_all, fields(ino = %self.ino()))]
    async fn save_overlay_post_checkout(
        self: &Arc<Self>,
        from_tree: Option<&Tree>,
        to_tree: Option<&Tree>,
    ) -> Result<(), FsError> {
        enum Reconciled {
            Dematerialized(canopy_castore::ObjectId),
            BecameMaterialized,
            Unchanged,
        }

        let reconciled = {
            let mut contents = self.contents.write();
            let matches_to = to_tree
                .map(|to| contents_match_tree(&contents, to))
                .unwrap_or(false);

            if matches_to {
                let to = to_tree.expect("matches_to");
                if contents.source_id.as_ref() == Some(to.id()) {
                    Reconciled::Unchanged
                } else {
                    contents.source_id = Some(to.id().clone());
                    contents.bump();
                    Reconciled::Dematerialized(to.id().clone())
                }
            } else {
                // Keep an existing equality claim only if it names the
                // transition's starting point and is still true; anything
                // else means this directory has genuinely diverged.
                let still_clean = match (&contents.source_id, from_tree) {
                    (Some(current), Some(from)) => {
                        from.id() == current && contents_match_tree(&contents, from)
                    }
                    _ => false,
                };
                if contents.source_id.is_none() || still_clean {
                    Reconciled::Unchanged
                } else {
                    contents.source_id = None;
                    contents.bump();
                    Reconciled::BecameMaterialized
                }
            }
        };

        self.save_overlay().await?;

        let (parent, name) = {
            let location = self.location().read();
            (
                location.parent.as_ref().and_then(|p| p.upgrade()),
                location.name.clone(),
            )
        };
        if let (Some(parent), Some(name)) = (parent, name) {
            match reconciled {
                Reconciled::Dematerialized(id) => {
                    parent.child_dematerialized(&name, id);
                }
                Reconciled::BecameMaterialized => {
                    parent.child_entry_materialized(&name);
                }
                Reconciled::Unchanged => {}
            }
        }
        Ok(())
    }
}

/// Whether a directory's entry set is exactly the given source-control
/// tree: same names, every entry unmaterialized and pointing at the same
/// object with the same type.
fn contents_match_tree(contents: &crate::inodes::tree::TreeContents, tree: &Tree) -> bool {
    contents.entries.len() == tree.len()
        && contents.entries.iter().all(|(name, entry)| {
            tree.get(name)
                .map(|scm| entry.matches_source(scm))
                .unwrap_or(false)
        })
}
