use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::instrument;

use canopy_castore::ContentDigest;

use crate::errors::FsError;
use crate::inodes::InodeNumber;
use crate::overlay::Overlay;

/// Serializes access to the overlay data of materialized files and caches
/// their content fingerprints.
///
/// Every read-modify-write goes through the per-inode lock so concurrent
/// writes to the same file are serialized, and through the IO gate so
/// shutdown can wait for in-flight work to drain.
pub struct OverlayFileAccess {
    overlay: Arc<dyn Overlay>,
    files: Mutex<HashMap<InodeNumber, Arc<FileEntry>>>,
    io_gate: IoGate,
}

#[derive(Default)]
struct FileEntry {
    lock: tokio::sync::Mutex<()>,
    digest_cache: Mutex<Option<ContentDigest>>,
}

impl OverlayFileAccess {
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self {
            overlay,
            files: Mutex::new(HashMap::new()),
            io_gate: IoGate::default(),
        }
    }

    fn entry(&self, ino: InodeNumber) -> Arc<FileEntry> {
        self.files.lock().entry(ino).or_default().clone()
    }

    pub async fn read_all(&self, ino: InodeNumber) -> Result<Bytes, FsError> {
        let _io = self.io_gate.enter();
        self.overlay.read_file(ino).await?.ok_or_else(|| {
            FsError::Bug(format!("materialized file {} has no overlay data", ino))
        })
    }

    pub async fn read(&self, ino: InodeNumber, offset: u64, len: usize) -> Result<Bytes, FsError> {
        let contents = self.read_all(ino).await?;
        let start = (offset as usize).min(contents.len());
        let end = (start + len).min(contents.len());
        Ok(contents.slice(start..end))
    }

    pub async fn size(&self, ino: InodeNumber) -> Result<u64, FsError> {
        Ok(self.read_all(ino).await?.len() as u64)
    }

    /// Writes at an offset, zero-filling any gap, and returns the new size.
    #[instrument(skip(self, data), fields(ino = %ino, len = data.len()))]
    pub async fn write(
        &self,
        ino: InodeNumber,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, FsError> {
        let entry = self.entry(ino);
        let _file = entry.lock.lock().await;
        let _io = self.io_gate.enter();

        let old = self.overlay.read_file(ino).await?.unwrap_or_default();
        let offset = offset as usize;
        let mut buf = Vec::with_capacity(old.len().max(offset + data.len()));
        buf.extend_from_slice(&old);
        if buf.len() < offset {
            buf.resize(offset, 0);
        }
        let end = offset + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);

        let new_size = buf.len() as u64;
        self.overlay.write_file(ino, buf.into()).await?;
        *entry.digest_cache.lock() = None;
        Ok(new_size)
    }

    pub async fn truncate(&self, ino: InodeNumber, size: u64) -> Result<(), FsError> {
        let entry = self.entry(ino);
        let _file = entry.lock.lock().await;
        let _io = self.io_gate.enter();

        let old = self.overlay.read_file(ino).await?.unwrap_or_default();
        let mut buf = old.to_vec();
        buf.resize(size as usize, 0);
        self.overlay.write_file(ino, buf.into()).await?;
        *entry.digest_cache.lock() = None;
        Ok(())
    }

    /// The content fingerprint of a materialized file, cached until the next
    /// write.
    pub async fn digest(&self, ino: InodeNumber) -> Result<ContentDigest, FsError> {
        let entry = self.entry(ino);
        if let Some(digest) = entry.digest_cache.lock().clone() {
            return Ok(digest);
        }
        let contents = self.read_all(ino).await?;
        let digest = ContentDigest::compute(&contents);
        *entry.digest_cache.lock() = Some(digest.clone());
        Ok(digest)
    }

    /// Drops bookkeeping for a file whose overlay data is gone.
    pub fn forget(&self, ino: InodeNumber) {
        self.files.lock().remove(&ino);
    }

    /// Waits until no file IO is in flight. New IO started after this call
    /// is not waited for.
    pub async fn wait_for_pending_io(&self) {
        self.io_gate.drain().await;
    }
}

/// Counts in-flight IO operations so shutdown can wait for them.
#[derive(Default)]
struct IoGate {
    inflight: AtomicU64,
    drained: Notify,
}

impl IoGate {
    fn enter(&self) -> IoGuard<'_> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        IoGuard { gate: self }
    }

    async fn drain(&self) {
        loop {
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct IoGuard<'a> {
    gate: &'a IoGate,
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        if self.gate.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gate.drained.notify_waiters();
        }
    }
}
