use std::collections::HashMap;

use canopy_castore::PathComponent;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::{Inode, InodeNumber, InodeWeak};
use crate::errors::FsError;
use crate::overlay::InodeMapSnapshot;

/// Per-mount coordinator for every allocated inode number.
///
/// The map enforces at-most-one concurrent load per inode number: the first
/// caller to ask wins and performs the fetch, everyone else attaches a
/// one-shot promise to the existing in-flight load. Promises are fulfilled
/// only after the loader has linked the new inode into its parent's entries
/// map, so a second lookup by name always finds the inode through the
/// parent rather than through an orphan.
///
/// Lock order: this lock is leaf-level. It is fine to take it while holding
/// a tree's contents lock; never the other way around.
pub struct InodeMap {
    inner: Mutex<HashMap<InodeNumber, MapEntry>>,
}

enum MapEntry {
    Loaded(InodeWeak),
    Loading(Vec<oneshot::Sender<Result<Inode, FsError>>>),
    Unloaded { parent: InodeNumber, name: PathComponent },
}

/// What a caller that wants a child loaded should do next.
pub enum LoadDecision {
    /// The inode is already loaded; use it.
    AlreadyLoaded(Inode),
    /// The caller owns the load and must call `complete_load` or
    /// `fail_load` exactly once.
    Start,
    /// Another caller owns the load; await the receiver.
    Wait(oneshot::Receiver<Result<Inode, FsError>>),
}

impl InodeMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Decides whether the caller should start loading the given inode.
    pub fn begin_load(&self, ino: InodeNumber) -> LoadDecision {
        let mut inner = self.inner.lock();
        match inner.get_mut(&ino) {
            Some(MapEntry::Loaded(weak)) => match weak.upgrade() {
                Some(inode) => LoadDecision::AlreadyLoaded(inode),
                None => {
                    // The inode was dropped since; treat as unloaded.
                    inner.insert(ino, MapEntry::Loading(Vec::new()));
                    LoadDecision::Start
                }
            },
            Some(MapEntry::Loading(waiters)) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                LoadDecision::Wait(rx)
            }
            Some(MapEntry::Unloaded { .. }) | None => {
                inner.insert(ino, MapEntry::Loading(Vec::new()));
                LoadDecision::Start
            }
        }
    }

    /// Records a finished load and fulfills every waiter with the same
    /// inode. The caller must already have linked the inode into its
    /// parent's entries map.
    pub fn complete_load(&self, ino: InodeNumber, inode: Inode) {
        let waiters = {
            let mut inner = self.inner.lock();
            let waiters = match inner.insert(ino, MapEntry::Loaded(inode.downgrade())) {
                Some(MapEntry::Loading(waiters)) => waiters,
                _ => Vec::new(),
            };
            waiters
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(inode.clone()));
        }
    }

    /// Fails every waiter with the same error and forgets the load so a
    /// later attempt can retry.
    pub fn fail_load(&self, ino: InodeNumber, error: FsError) {
        let waiters = {
            let mut inner = self.inner.lock();
            match inner.remove(&ino) {
                Some(MapEntry::Loading(waiters)) => waiters,
                Some(other) => {
                    inner.insert(ino, other);
                    Vec::new()
                }
                None => Vec::new(),
            }
        };
        debug!(ino = %ino, %error, waiters = waiters.len(), "inode load failed");
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Registers an inode that was constructed directly (create, mkdir),
    /// without going through a load.
    pub fn insert_loaded(&self, inode: &Inode) {
        self.inner
            .lock()
            .insert(inode.ino(), MapEntry::Loaded(inode.downgrade()));
    }

    /// Resolves an inode number to its loaded inode, if any.
    pub fn lookup(&self, ino: InodeNumber) -> Option<Inode> {
        let mut inner = self.inner.lock();
        match inner.get(&ino) {
            Some(MapEntry::Loaded(weak)) => match weak.upgrade() {
                Some(inode) => Some(inode),
                None => {
                    inner.remove(&ino);
                    None
                }
            },
            _ => None,
        }
    }

    /// Remembers an inode that was unloaded while the kernel may still hold
    /// a reference to its number.
    pub fn register_unloaded(
        &self,
        ino: InodeNumber,
        parent: InodeNumber,
        name: PathComponent,
    ) {
        self.inner
            .lock()
            .insert(ino, MapEntry::Unloaded { parent, name });
    }

    /// Forgets an inode entirely (unlink, or kernel refcount reaching
    /// zero).
    pub fn forget(&self, ino: InodeNumber) {
        self.inner.lock().remove(&ino);
    }

    /// Whether a load is currently in flight for the inode. Test-visible so
    /// the load-race property can be asserted.
    pub fn is_loading(&self, ino: InodeNumber) -> bool {
        matches!(self.inner.lock().get(&ino), Some(MapEntry::Loading(_)))
    }

    /// The takeover snapshot persisted on graceful shutdown.
    pub fn snapshot(&self, generation: u64) -> InodeMapSnapshot {
        let inner = self.inner.lock();
        let mut unloaded: Vec<_> = inner
            .iter()
            .filter_map(|(ino, entry)| match entry {
                MapEntry::Unloaded { parent, name } => {
                    Some((*ino, *parent, name.clone()))
                }
                _ => None,
            })
            .collect();
        unloaded.sort_by_key(|(ino, _, _)| *ino);
        InodeMapSnapshot {
            generation,
            unloaded,
        }
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_loader_waits() {
        let map = InodeMap::new();
        let ino = InodeNumber(7);

        assert!(matches!(map.begin_load(ino), LoadDecision::Start));
        assert!(matches!(map.begin_load(ino), LoadDecision::Wait(_)));
        assert!(map.is_loading(ino));
    }

    #[tokio::test]
    async fn failure_reaches_all_waiters_and_allows_retry() {
        let map = InodeMap::new();
        let ino = InodeNumber(7);

        assert!(matches!(map.begin_load(ino), LoadDecision::Start));
        let rx_a = match map.begin_load(ino) {
            LoadDecision::Wait(rx) => rx,
            _ => panic!("expected wait"),
        };
        let rx_b = match map.begin_load(ino) {
            LoadDecision::Wait(rx) => rx,
            _ => panic!("expected wait"),
        };

        map.fail_load(ino, FsError::NotFound("gone".to_string()));
        for rx in [rx_a, rx_b] {
            match rx.await.unwrap() {
                Err(FsError::NotFound(path)) => assert_eq!(path, "gone"),
                Err(other) => panic!("unexpected error: {}", other),
                Ok(_) => panic!("expected the load failure"),
            }
        }

        // A later attempt may retry.
        assert!(matches!(map.begin_load(ino), LoadDecision::Start));
    }
}
