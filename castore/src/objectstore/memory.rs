use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use crate::{
    ContentDigest, EntryType, Error, ObjectId, ObjectStore, PathComponent, RelativePathBuf,
    RootId, Tree, TreeEntry,
};

/// An in-memory, content-addressed object store.
///
/// Blob and tree ids are the blake3 digest of their contents (for trees, of
/// a canonical serialization), so blob ids are bijective by construction.
/// Tests that need the non-bijective behavior of real id schemes can insert
/// blobs under arbitrary ids with [MemoryObjectStore::put_blob_with_id].
#[derive(Default)]
pub struct MemoryObjectStore {
    trees: RwLock<HashMap<ObjectId, Arc<Tree>>>,
    blobs: RwLock<HashMap<ObjectId, Bytes>>,
    roots: RwLock<HashMap<RootId, ObjectId>>,
    non_bijective: std::sync::atomic::AtomicBool,
    tree_fetches: std::sync::atomic::AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks the store as having non-bijective blob ids, forcing the diff
    /// engine down the fingerprint-comparison path.
    pub fn set_non_bijective(&self) {
        self.non_bijective
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// How many tree fetches have been served. Tests use this to prove a
    /// racing load hit the store exactly once.
    pub fn tree_fetch_count(&self) -> u64 {
        self.tree_fetches.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Test helper: drops a stored tree, simulating a hole in the store.
    pub fn remove_tree(&self, id: &ObjectId) {
        self.trees.write().remove(id);
    }

    /// Stores a blob and returns its content id.
    pub fn put_blob(&self, contents: impl Into<Bytes>) -> ObjectId {
        let contents = contents.into();
        let id = ObjectId::from_bytes(blake3::hash(&contents).as_bytes().to_vec());
        self.blobs.write().insert(id.clone(), contents);
        id
    }

    /// Stores a blob under a caller-chosen id.
    pub fn put_blob_with_id(&self, id: ObjectId, contents: impl Into<Bytes>) {
        self.blobs.write().insert(id, contents.into());
    }

    /// Stores a tree assembled from the given sorted entries and returns its
    /// content id.
    pub fn put_tree(
        &self,
        entries: Vec<(PathComponent, TreeEntry)>,
    ) -> Result<ObjectId, Error> {
        let id = Self::tree_id(&entries);
        let tree = Tree::new(id.clone(), entries)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        self.trees.write().insert(id.clone(), Arc::new(tree));
        Ok(id)
    }

    /// Associates a commit root with a root tree.
    pub fn put_root(&self, root: RootId, tree_id: ObjectId) {
        self.roots.write().insert(root, tree_id);
    }

    /// Starts building a commit from a flat path -> contents map.
    pub fn commit_builder(self: &Arc<Self>) -> CommitBuilder {
        CommitBuilder {
            store: self.clone(),
            files: BTreeMap::new(),
        }
    }

    fn tree_id(entries: &[(PathComponent, TreeEntry)]) -> ObjectId {
        // Canonical serialization: (name NUL type id-len id)*. The id is the
        // digest of that byte string.
        let mut buf = Vec::new();
        for (name, entry) in entries {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            buf.push(match entry.ty() {
                EntryType::Tree => b't',
                EntryType::RegularFile => b'f',
                EntryType::ExecutableFile => b'x',
                EntryType::Symlink => b'l',
            });
            buf.push(entry.id().as_slice().len() as u8);
            buf.extend_from_slice(entry.id().as_slice());
        }
        ObjectId::from_bytes(blake3::hash(&buf).as_bytes().to_vec())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    #[instrument(skip(self), fields(tree.id = %id))]
    async fn get_tree(&self, id: &ObjectId) -> Result<Arc<Tree>, Error> {
        self.tree_fetches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.trees
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(id.clone()))
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn get_blob(&self, id: &ObjectId) -> Result<Bytes, Error> {
        self.blobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(id.clone()))
    }

    async fn get_blob_digest(&self, id: &ObjectId) -> Result<ContentDigest, Error> {
        let blob = self.get_blob(id).await?;
        Ok(ContentDigest::compute(&blob))
    }

    async fn get_blob_size(&self, id: &ObjectId) -> Result<u64, Error> {
        let blob = self.get_blob(id).await?;
        Ok(blob.len() as u64)
    }

    #[instrument(skip(self), fields(root = %root))]
    async fn get_root_tree(&self, root: &RootId) -> Result<Arc<Tree>, Error> {
        let tree_id = self
            .roots
            .read()
            .get(root)
            .cloned()
            .ok_or_else(|| Error::RootNotFound(root.to_string()))?;
        self.get_tree(&tree_id).await
    }

    fn parse_root_id(&self, s: &str) -> Result<RootId, Error> {
        if s.is_empty() {
            return Err(Error::InvalidRequest("empty root id".to_string()));
        }
        Ok(RootId::from_bytes(s.as_bytes().to_vec()))
    }

    fn render_root_id(&self, root: &RootId) -> String {
        root.to_string()
    }

    fn bijective_blob_ids(&self) -> bool {
        !self
            .non_bijective
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Assembles nested trees from a flat set of file paths, bottom-up, and
/// registers the result under a commit root. Only used by tests and
/// fixtures.
pub struct CommitBuilder {
    store: Arc<MemoryObjectStore>,
    files: BTreeMap<RelativePathBuf, (Bytes, EntryType)>,
}

impl CommitBuilder {
    pub fn add_file(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        let path: RelativePathBuf = path.parse().expect("invalid fixture path");
        self.files
            .insert(path, (contents.into(), EntryType::RegularFile));
        self
    }

    pub fn add_executable(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        let path: RelativePathBuf = path.parse().expect("invalid fixture path");
        self.files
            .insert(path, (contents.into(), EntryType::ExecutableFile));
        self
    }

    pub fn add_symlink(mut self, path: &str, target: impl Into<Bytes>) -> Self {
        let path: RelativePathBuf = path.parse().expect("invalid fixture path");
        self.files
            .insert(path, (target.into(), EntryType::Symlink));
        self
    }

    /// Builds all trees and registers the root under the given name.
    pub fn commit(self, root: &str) -> RootId {
        let root_id = RootId::from_bytes(root.as_bytes().to_vec());
        let tree_id = self.build_tree(&RelativePathBuf::root());
        self.store.put_root(root_id.clone(), tree_id);
        root_id
    }

    fn build_tree(&self, dir: &RelativePathBuf) -> ObjectId {
        let depth = dir.components().count();
        let mut entries: Vec<(PathComponent, TreeEntry)> = Vec::new();
        let mut subdirs: BTreeMap<PathComponent, ()> = BTreeMap::new();

        for (path, (contents, ty)) in &self.files {
            if !path_starts_with(path, dir) {
                continue;
            }
            let components: Vec<_> = path.components().collect();
            let rel = &components[depth..];
            match rel.len() {
                0 => unreachable!("directory registered as file"),
                1 => {
                    let name = PathComponent::new(rel[0].to_vec()).unwrap();
                    let id = self.store.put_blob(contents.clone());
                    entries.push((name, TreeEntry::new(id, *ty)));
                }
                _ => {
                    subdirs.insert(PathComponent::new(rel[0].to_vec()).unwrap(), ());
                }
            }
        }

        for (name, ()) in subdirs {
            let sub_id = self.build_tree(&dir.join(&name));
            entries.push((name, TreeEntry::new(sub_id, EntryType::Tree)));
        }

        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        self.store.put_tree(entries).expect("fixture tree is valid")
    }
}

fn path_starts_with(path: &RelativePathBuf, dir: &RelativePathBuf) -> bool {
    if dir.is_root() {
        return true;
    }
    let mut path_components = path.components();
    for dir_component in dir.components() {
        if path_components.next() != Some(dir_component) {
            return false;
        }
    }
    // The path must be strictly below the directory.
    path_components.next().is_some()
}
