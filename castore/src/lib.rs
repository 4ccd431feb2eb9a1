//! The immutable source-control data model for canopy: content addresses,
//! trees, blobs and the [ObjectStore] abstraction the working copy fetches
//! them through.
//!
//! Everything in this crate is read-only. Mutable working-copy state lives
//! in the `canopy-mount` crate, which layers inodes, an overlay and a
//! journal on top of these types.

mod digests;
mod errors;
pub mod fixtures;
pub mod objectstore;
mod path;
mod tree;

pub use digests::{ContentDigest, ObjectId, RootId, CONTENT_DIGEST_LEN};
pub use errors::{Error, PathComponentError, TreeError};
pub use objectstore::{MemoryObjectStore, ObjectStore};
pub use path::{PathComponent, RelativePathBuf};
pub use tree::{EntryType, Tree, TreeEntry};
