use bytes::Bytes;
use data_encoding::HEXLOWER;

/// An opaque content address for a source-control object (a tree or a blob).
///
/// Different backing stores use different id schemes and lengths, so this is
/// a variable-length byte string. Two objects with the same id are assumed to
/// have the same contents; the reverse only holds when the store advertises
/// [crate::ObjectStore::bijective_blob_ids].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(Bytes);

impl ObjectId {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl From<&[u8]> for ObjectId {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec().into())
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", HEXLOWER.encode(&self.0))
    }
}

/// An opaque identifier of a commit root.
///
/// Only the [crate::ObjectStore] knows how to turn one of these into a root
/// [crate::Tree]; the working copy treats it as a token it records and hands
/// back.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(Bytes);

impl RootId {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Display for RootId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Root ids are frequently printable commit hashes; fall back to hex
        // when they are not.
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{}", s),
            _ => write!(f, "{}", HEXLOWER.encode(&self.0)),
        }
    }
}

impl std::fmt::Debug for RootId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RootId({})", self)
    }
}

pub const CONTENT_DIGEST_LEN: usize = blake3::OUT_LEN;

/// A fixed-length blake3 fingerprint of blob contents.
///
/// Unlike [ObjectId], equal contents always produce equal digests, so this is
/// what diff and checkout compare when they need to know whether two blobs
/// are really the same bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; CONTENT_DIGEST_LEN]);

impl ContentDigest {
    /// Computes the digest of the given contents.
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8; CONTENT_DIGEST_LEN]> for ContentDigest {
    fn from(value: &[u8; CONTENT_DIGEST_LEN]) -> Self {
        Self(*value)
    }
}

impl TryFrom<&[u8]> for ContentDigest {
    type Error = crate::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; CONTENT_DIGEST_LEN] = value
            .try_into()
            .map_err(|_| crate::Error::InvalidRequest(format!("invalid digest length: {}", value.len())))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentDigest({})", self)
    }
}
