mod memory;

pub use self::memory::{CommitBuilder, MemoryObjectStore};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{ContentDigest, Error, ObjectId, RootId, Tree};

/// The read-only, content-addressed store the working copy fetches
/// source-control objects from.
///
/// Implementations are expected to be remote and slow: every method except
/// the root-id conversions is a suspension point, and callers must not hold
/// inode locks across them. Returned trees carry their entries in the
/// canonical sorted order (see [Tree::new]); the diff and checkout walks
/// rely on that.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches a tree by its content id.
    async fn get_tree(&self, id: &ObjectId) -> Result<Arc<Tree>, Error>;

    /// Fetches a blob's contents by its content id.
    async fn get_blob(&self, id: &ObjectId) -> Result<Bytes, Error>;

    /// Fetches the content fingerprint of a blob, without necessarily
    /// fetching its contents.
    async fn get_blob_digest(&self, id: &ObjectId) -> Result<ContentDigest, Error>;

    /// Fetches a blob's size in bytes, without fetching its contents.
    async fn get_blob_size(&self, id: &ObjectId) -> Result<u64, Error>;

    /// Resolves a commit root to its root tree.
    async fn get_root_tree(&self, root: &RootId) -> Result<Arc<Tree>, Error>;

    /// Parses a string rendering of a root id, as produced by
    /// [ObjectStore::render_root_id].
    fn parse_root_id(&self, s: &str) -> Result<RootId, Error>;

    /// Renders a root id for display and for journal records.
    fn render_root_id(&self, root: &RootId) -> String;

    /// Whether blob ids are bijective with blob contents. When true, the
    /// diff engine may treat id inequality as content inequality and skip
    /// fetching content fingerprints entirely.
    fn bijective_blob_ids(&self) -> bool {
        false
    }
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn get_tree(&self, id: &ObjectId) -> Result<Arc<Tree>, Error> {
        (**self).get_tree(id).await
    }

    async fn get_blob(&self, id: &ObjectId) -> Result<Bytes, Error> {
        (**self).get_blob(id).await
    }

    async fn get_blob_digest(&self, id: &ObjectId) -> Result<ContentDigest, Error> {
        (**self).get_blob_digest(id).await
    }

    async fn get_blob_size(&self, id: &ObjectId) -> Result<u64, Error> {
        (**self).get_blob_size(id).await
    }

    async fn get_root_tree(&self, root: &RootId) -> Result<Arc<Tree>, Error> {
        (**self).get_root_tree(root).await
    }

    fn parse_root_id(&self, s: &str) -> Result<RootId, Error> {
        (**self).parse_root_id(s)
    }

    fn render_root_id(&self, root: &RootId) -> String {
        (**self).render_root_id(root)
    }

    fn bijective_blob_ids(&self) -> bool {
        (**self).bijective_blob_ids()
    }
}
