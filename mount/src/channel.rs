//! The contract between the inode core and the kernel filesystem transport.
//!
//! The core never talks to the kernel directly; it only asks the channel to
//! drop cached state after the core changed something behind the kernel's
//! back (checkout, primarily). How expensive and how fallible that is
//! depends on the transport.

use async_trait::async_trait;

use canopy_castore::PathComponent;

use crate::errors::FsError;
use crate::inodes::InodeNumber;

/// Which kernel transport is behind the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Fuse,
    Nfs,
    /// ProjectedFS. Entry invalidation also removes on-disk placeholders
    /// here, so a failure means the working copy is visibly wrong and must
    /// be surfaced to the caller rather than logged.
    Projected,
}

impl ChannelKind {
    /// Whether a failed entry invalidation is fatal for the operation that
    /// caused it.
    pub fn invalidation_failure_is_fatal(&self) -> bool {
        matches!(self, ChannelKind::Projected)
    }
}

/// Invalidation interface to the kernel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Drops the kernel's positive and negative dentry caches for a single
    /// name under the given directory.
    async fn invalidate_entry(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> Result<(), FsError>;

    /// Drops any cached directory listing for the given directory.
    async fn invalidate_dir(&self, ino: InodeNumber) -> Result<(), FsError>;

    /// Waits until all previously issued invalidations have been observed by
    /// the kernel.
    async fn flush_invalidations(&self) -> Result<(), FsError>;
}

/// Computes the readdir offset cookie for an entry.
///
/// Offset 0 is start-of-directory, 1 is after `.`, 2 is after `..`, and
/// `2 + ino` is after the entry with that inode number. Keying resumption on
/// the inode number rather than a list position means entries inserted or
/// removed between calls do not shift later entries into or out of the
/// window.
pub fn readdir_offset_for(ino: InodeNumber) -> u64 {
    2 + ino.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projected_invalidation_failures_are_fatal() {
        assert!(ChannelKind::Projected.invalidation_failure_is_fatal());
        assert!(!ChannelKind::Fuse.invalidation_failure_is_fatal());
        assert!(!ChannelKind::Nfs.invalidation_failure_is_fatal());
    }
}
