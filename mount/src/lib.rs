//! The inode core of the canopy virtual filesystem: the in-memory working
//! copy, the checkout and diff engines, the materialization/overlay
//! discipline, and the journal.
//!
//! The kernel transport, the remote object store and the overlay's
//! persistence are all consumed through small traits ([channel::Channel],
//! [canopy_castore::ObjectStore], [overlay::Overlay]); in-memory doubles
//! for each live alongside the traits and back the test suite.

pub mod channel;
pub mod checkout;
pub mod diff;
mod errors;
pub mod inodes;
pub mod journal;
mod mount;
pub mod overlay;
pub mod testutil;

pub use channel::{readdir_offset_for, Channel, ChannelKind};
pub use checkout::{CheckoutMode, CheckoutResult, Conflict, ConflictType};
pub use diff::{DiffCallback, IgnoreStack, ScmStatus, ScmStatusCollector};
pub use errors::FsError;
pub use inodes::{
    FileAttr, FileInode, Inode, InodeNumber, InodeOrTreeOrEntry, TreeInode, ROOT_INO,
};
pub use journal::{Journal, JournalDeltaRange, JournalRecord, PathChangeInfo};
pub use mount::{Mount, MountConfig};
pub use overlay::{DirContents, MemoryOverlay, Overlay, OverlayFileAccess};
