//! Mount orchestration: ties the inode tree to its object store, overlay,
//! journal and kernel channel, and drives the whole-mount operations
//! (checkout, diff, shutdown).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::try_join;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use canopy_castore::{ObjectStore, PathComponent, RelativePathBuf, RootId};

use crate::channel::Channel;
use crate::checkout::{CheckoutContext, CheckoutMode, CheckoutResult};
use crate::diff::{DiffCallback, DiffContext, IgnoreStack, ScmStatus, ScmStatusCollector};
use crate::errors::FsError;
use crate::inodes::lookup::resolve_path;
use crate::inodes::tree::TreeContents;
use crate::inodes::{FileAttr, Inode, InodeMap, TreeInode, ROOT_INO};
use crate::journal::Journal;
use crate::overlay::{Overlay, OverlayFileAccess};

/// How many symlinks a single path resolution will follow before giving up.
const MAX_SYMLINK_DEPTH: usize = 40;

#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Whether entry names are compared case-sensitively. The walk order of
    /// diff and checkout is byte-lexicographic either way.
    pub case_sensitive: bool,
    pub journal_memory_limit: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            journal_memory_limit: crate::journal::DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// Everything an inode needs from its mount. Passed explicitly down the
/// tree instead of living in process globals.
pub(crate) struct MountCore {
    pub store: Arc<dyn ObjectStore>,
    pub overlay: Arc<dyn Overlay>,
    pub channel: Arc<dyn Channel>,
    pub journal: Journal,
    pub inode_map: InodeMap,
    pub file_access: OverlayFileAccess,
    /// Held exclusively by operations that move or remove inodes, shared
    /// by walks that need every loaded inode's path to stay put.
    pub rename_lock: tokio::sync::RwLock<()>,
    pub config: MountConfig,
    pub generation: u64,
    last_checkout: parking_lot::RwLock<SystemTime>,
}

impl MountCore {
    /// Timestamp reported for unmaterialized entries, which have no
    /// modification history of their own.
    pub fn last_checkout_time(&self) -> SystemTime {
        *self.last_checkout.read()
    }

    fn touch_checkout_time(&self) {
        *self.last_checkout.write() = SystemTime::now();
    }
}

struct ParentState {
    checked_out_root: RootId,
    working_copy_parent: RootId,
    checkout_in_progress: bool,
}

/// A mounted working copy.
pub struct Mount {
    core: Arc<MountCore>,
    root: Arc<TreeInode>,
    parent_state: parking_lot::RwLock<ParentState>,
}

impl Mount {
    /// Mounts a working copy at `initial_root`. If the overlay already has
    /// state for the root directory (an earlier mount materialized it), the
    /// overlay wins; otherwise the root tree comes from the store.
    #[instrument(skip(store, overlay, channel, config), fields(root = %initial_root))]
    pub async fn new(
        store: Arc<dyn ObjectStore>,
        overlay: Arc<dyn Overlay>,
        channel: Arc<dyn Channel>,
        config: MountConfig,
        initial_root: RootId,
    ) -> Result<Mount, FsError> {
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        let core = Arc::new(MountCore {
            store: store.clone(),
            overlay: overlay.clone(),
            channel,
            journal: Journal::new(config.journal_memory_limit),
            inode_map: InodeMap::new(),
            file_access: OverlayFileAccess::new(overlay.clone()),
            rename_lock: tokio::sync::RwLock::new(()),
            config,
            generation,
            last_checkout: parking_lot::RwLock::new(SystemTime::now()),
        });

        let contents = match overlay.load_dir(ROOT_INO).await? {
            Some(persisted) => TreeContents::from_overlay(&persisted),
            None => {
                let tree = store.get_root_tree(&initial_root).await?;
                TreeContents::from_tree(&core, &tree)
            }
        };
        let root = TreeInode::new_root(core.clone(), contents);
        core.inode_map.insert_loaded(&Inode::Tree(root.clone()));

        // Re-register inode numbers a previous process handed to the
        // kernel and then shut down with.
        if let Some(snapshot) = overlay.load_snapshot().await? {
            info!(
                unloaded = snapshot.unloaded.len(),
                "restoring inode map snapshot"
            );
            for (ino, parent, name) in snapshot.unloaded {
                core.inode_map.register_unloaded(ino, parent, name);
            }
        }

        Ok(Mount {
            core,
            root,
            parent_state: parking_lot::RwLock::new(ParentState {
                checked_out_root: initial_root.clone(),
                working_copy_parent: initial_root,
                checkout_in_progress: false,
            }),
        })
    }

    pub fn root(&self) -> &Arc<TreeInode> {
        &self.root
    }

    pub fn journal(&self) -> &Journal {
        &self.core.journal
    }

    /// Strict variant of [Journal::accumulate_range]: a range reaching back
    /// into evicted history fails instead of returning a partial summary,
    /// forcing the caller to fall back to a full diff.
    pub fn journal_delta_since(
        &self,
        from_seq: u64,
    ) -> Result<crate::journal::JournalDeltaRange, FsError> {
        let range = self.core.journal.accumulate_range(from_seq);
        if range.is_truncated {
            return Err(FsError::JournalTruncated(from_seq));
        }
        Ok(range)
    }

    pub fn generation(&self) -> u64 {
        self.core.generation
    }

    /// Fails with [FsError::MountGenerationChanged] when a caller resumes a
    /// conversation that belongs to a previous mount of this working copy.
    pub fn check_generation(&self, expected: u64) -> Result<(), FsError> {
        if expected != self.core.generation {
            return Err(FsError::MountGenerationChanged {
                expected,
                found: self.core.generation,
            });
        }
        Ok(())
    }

    pub fn working_copy_parent(&self) -> RootId {
        self.parent_state.read().working_copy_parent.clone()
    }

    pub fn checked_out_root(&self) -> RootId {
        self.parent_state.read().checked_out_root.clone()
    }

    /// Moves the working-copy parent without touching any file state.
    /// A subsequent diff against the new parent walks source-control trees
    /// for everything unmaterialized instead of loading inodes.
    pub fn reset_parent(&self, new_parent: RootId) -> Result<(), FsError> {
        let old = {
            let mut state = self.parent_state.write();
            if state.checkout_in_progress {
                return Err(FsError::CheckoutInProgress);
            }
            let old = state.working_copy_parent.clone();
            state.working_copy_parent = new_parent.clone();
            old
        };
        if old != new_parent {
            self.core.journal.record_root_changed(old, new_parent);
        }
        Ok(())
    }

    /// Transitions the working copy to `target`. Returns all conflicts and
    /// per-entry errors; the operation itself only fails on whole-mount
    /// problems (another checkout in flight, unreachable roots).
    #[instrument(skip(self), fields(target = %target, mode = ?mode))]
    pub async fn checkout(
        &self,
        target: RootId,
        mode: CheckoutMode,
    ) -> Result<CheckoutResult, FsError> {
        let from_root = {
            let mut state = self.parent_state.write();
            if state.checkout_in_progress {
                return Err(FsError::CheckoutInProgress);
            }
            state.checkout_in_progress = true;
            state.working_copy_parent.clone()
        };

        let result = self.checkout_locked(&from_root, &target, mode).await;

        self.parent_state.write().checkout_in_progress = false;
        result
    }

    async fn checkout_locked(
        &self,
        from_root: &RootId,
        target: &RootId,
        mode: CheckoutMode,
    ) -> Result<CheckoutResult, FsError> {
        let (from_tree, to_tree) = try_join!(
            self.core.store.get_root_tree(from_root),
            self.core.store.get_root_tree(target),
        )?;

        // Record which paths were already dirty, so a journal reader that
        // crosses the root transition still sees them as changed. Without
        // this, a post-checkout diff against the new parent would miss
        // them.
        let unclean_paths: BTreeSet<RelativePathBuf> = if mode != CheckoutMode::DryRun {
            let collector = ScmStatusCollector::new();
            let ctx = DiffContext::new(collector.clone(), self.core.store.clone());
            {
                let _rename = self.core.rename_lock.read().await;
                self.root
                    .diff(
                        &ctx,
                        RelativePathBuf::root(),
                        Some(from_tree.clone()),
                        IgnoreStack::empty(),
                        false,
                    )
                    .await?;
            }
            collector.status().all_changed()
        } else {
            BTreeSet::new()
        };

        let _rename = self.core.rename_lock.write().await;
        if mode != CheckoutMode::DryRun {
            // Unloading everything the kernel does not hold makes the
            // in-place entry swap the common path below.
            let unloaded = self.root.unload_free_children();
            tracing::debug!(unloaded, "unloaded free inodes before checkout");
        }

        let ctx = CheckoutContext::new(self.core.clone(), mode);
        self.root
            .clone()
            .checkout(ctx.clone(), Some(from_tree), Some(to_tree))
            .await?;

        ctx.flush_invalidations().await;

        if mode != CheckoutMode::DryRun {
            self.core.touch_checkout_time();
            if from_root != target {
                self.core
                    .journal
                    .record_root_changed(from_root.clone(), target.clone());
            }
            if !unclean_paths.is_empty() {
                self.core.journal.record_unclean_paths(
                    from_root.clone(),
                    target.clone(),
                    unclean_paths,
                );
            }
            let mut state = self.parent_state.write();
            state.working_copy_parent = target.clone();
            state.checked_out_root = target.clone();
        }

        Ok(ctx.into_result())
    }

    /// Diffs the working copy against `target`, reporting through
    /// `callback`. When `enforce_parent` is set, a target that is not the
    /// current working-copy parent fails with [FsError::OutOfDateParent]
    /// instead of producing a surprising all-different listing.
    #[instrument(skip(self, callback, token), fields(target = %target))]
    pub async fn diff(
        &self,
        target: &RootId,
        callback: Arc<dyn DiffCallback>,
        list_ignored: bool,
        enforce_parent: bool,
        token: CancellationToken,
    ) -> Result<(), FsError> {
        {
            let state = self.parent_state.read();
            if state.checkout_in_progress {
                return Err(FsError::CheckoutInProgress);
            }
            if enforce_parent && &state.working_copy_parent != target {
                return Err(FsError::OutOfDateParent {
                    expected: target.to_string(),
                    actual: state.working_copy_parent.to_string(),
                });
            }
        }
        let tree = self.core.store.get_root_tree(target).await?;
        let ctx = DiffContext {
            callback,
            store: self.core.store.clone(),
            list_ignored,
            token,
        };
        let _rename = self.core.rename_lock.read().await;
        self.root
            .diff(
                &ctx,
                RelativePathBuf::root(),
                Some(tree),
                IgnoreStack::empty(),
                false,
            )
            .await
    }

    /// Convenience wrapper over [Mount::diff] that collects into an
    /// [ScmStatus].
    pub async fn status(&self, target: &RootId, list_ignored: bool) -> Result<ScmStatus, FsError> {
        let collector = ScmStatusCollector::new();
        self.diff(
            target,
            collector.clone(),
            list_ignored,
            false,
            CancellationToken::new(),
        )
        .await?;
        Ok(collector.status())
    }

    /// Resolves a path to a loaded inode, loading every component.
    pub async fn resolve_inode(&self, path: &RelativePathBuf) -> Result<Inode, FsError> {
        let mut current = Inode::Tree(self.root.clone());
        for component in path.components() {
            let name = PathComponent::new(component.to_vec())?;
            let tree = match current.as_tree() {
                Some(tree) => tree.clone(),
                None => return Err(FsError::NotADirectory(path.to_string())),
            };
            current = tree.get_or_load_child(&name).await?;
        }
        Ok(current)
    }

    /// Stats a path without allocating inodes for unmaterialized entries.
    pub async fn getattr(&self, path: &RelativePathBuf) -> Result<FileAttr, FsError> {
        let resolved = resolve_path(&self.root, path).await?;
        resolved.getattr(&self.core).await
    }

    /// Resolves a path, following symlinks inside the mount, with a cap on
    /// chain length.
    pub async fn resolve_following_symlinks(
        &self,
        path: &RelativePathBuf,
    ) -> Result<Inode, FsError> {
        let mut path = path.clone();
        for _ in 0..MAX_SYMLINK_DEPTH {
            let resolved = self.resolve_inode(&path).await?;
            let target = match &resolved {
                Inode::File(file) if file.is_symlink() => file.readlink().await?,
                _ => return Ok(resolved),
            };

            let target = std::str::from_utf8(&target)
                .map_err(|_| FsError::InvalidArgument("non-utf8 symlink target".to_string()))?;
            if target.starts_with('/') {
                return Err(FsError::InvalidArgument(format!(
                    "symlink target {} leaves the mount",
                    target
                )));
            }
            let mut resolved_path = path.parent().unwrap_or_default();
            for component in target.split('/') {
                match component {
                    "" | "." => {}
                    ".." => {
                        resolved_path = resolved_path.parent().ok_or_else(|| {
                            FsError::InvalidArgument(format!(
                                "symlink target {} leaves the mount",
                                target
                            ))
                        })?;
                    }
                    name => {
                        resolved_path = resolved_path.join(&PathComponent::try_from(name)?);
                    }
                }
            }
            path = resolved_path;
        }
        Err(FsError::TooManySymlinks(path.to_string()))
    }

    /// Drops loaded inodes nothing references. Returns the count.
    pub async fn unload_free_inodes(&self) -> usize {
        let _rename = self.core.rename_lock.write().await;
        self.root.unload_free_children()
    }

    /// Waits until in-flight overlay IO and pending kernel invalidations
    /// have drained. On timeout the wait fails but the underlying work
    /// keeps running.
    pub async fn wait_for_pending_notifications(
        &self,
        timeout: Duration,
    ) -> Result<(), FsError> {
        let core = self.core.clone();
        let pending = tokio::spawn(async move {
            core.file_access.wait_for_pending_io().await;
            core.channel.flush_invalidations().await
        });
        match tokio::time::timeout(timeout, pending).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(FsError::Bug(format!(
                "notification wait task failed: {}",
                join_error
            ))),
            Err(_) => Err(FsError::Io(format!(
                "timed out after {:?} waiting for pending notifications",
                timeout
            ))),
        }
    }

    /// Graceful shutdown: drain IO and persist the inode-map snapshot so a
    /// takeover can keep serving kernel-held inode numbers.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), FsError> {
        self.core.file_access.wait_for_pending_io().await;
        let snapshot = self.core.inode_map.snapshot(self.core.generation);
        self.core.overlay.save_snapshot(snapshot).await?;
        Ok(())
    }

    /// Renames across arbitrary directories of this mount.
    pub async fn rename(
        &self,
        src_dir: &RelativePathBuf,
        src_name: &PathComponent,
        dst_dir: &RelativePathBuf,
        dst_name: &PathComponent,
    ) -> Result<(), FsError> {
        let src_parent = self.resolve_tree(src_dir).await?;
        let dst_parent = self.resolve_tree(dst_dir).await?;
        TreeInode::rename(&src_parent, src_name, &dst_parent, dst_name).await
    }

    async fn resolve_tree(&self, path: &RelativePathBuf) -> Result<Arc<TreeInode>, FsError> {
        match self.resolve_inode(path).await? {
            Inode::Tree(tree) => Ok(tree),
            Inode::File(_) => Err(FsError::NotADirectory(path.to_string())),
        }
    }

}
