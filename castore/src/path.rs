//! Path types for the canopy data model.
//!
//! These are always relative to the mount root and platform-independent,
//! which distinguishes them from the ones in the standard library. Names are
//! byte strings: source control imposes no encoding, only a small set of
//! forbidden bytes.

use bstr::{BStr, ByteSlice};
use bytes::Bytes;

use crate::PathComponentError;

/// The longest name a single directory entry may have, matching NAME_MAX on
/// the platforms the kernel channel serves.
pub const MAX_COMPONENT_LEN: usize = 255;

/// A single validated path component: non-empty, no `/` or NUL, not `.` or
/// `..`, and at most [MAX_COMPONENT_LEN] bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathComponent(Bytes);

impl PathComponent {
    pub fn new(name: impl Into<Bytes>) -> Result<Self, PathComponentError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PathComponentError::Empty);
        }
        if name.len() > MAX_COMPONENT_LEN {
            return Err(PathComponentError::TooLong(name.len(), MAX_COMPONENT_LEN));
        }
        if &name[..] == b"." || &name[..] == b".." || name.contains(&0x00) || name.contains(&b'/')
        {
            return Err(PathComponentError::InvalidName(
                name.as_bstr().to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bstr(&self) -> &BStr {
        self.0.as_bstr()
    }
}

impl TryFrom<&str> for PathComponent {
    type Error = PathComponentError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes().to_vec())
    }
}

impl std::fmt::Display for PathComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self.0.as_bstr(), f)
    }
}

impl std::fmt::Debug for PathComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.0.as_bstr(), f)
    }
}

/// An owned relative path: zero or more [PathComponent]s joined by `/`.
/// The empty path refers to the mount root.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativePathBuf {
    inner: Vec<u8>,
}

impl RelativePathBuf {
    /// The mount root.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }

    /// Appends a component, returning the extended path.
    pub fn join(&self, name: &PathComponent) -> RelativePathBuf {
        let mut inner = self.inner.clone();
        if !inner.is_empty() {
            inner.push(b'/');
        }
        inner.extend_from_slice(name.as_bytes());
        RelativePathBuf { inner }
    }

    /// The path with the final component removed, or None for the root.
    pub fn parent(&self) -> Option<RelativePathBuf> {
        if self.inner.is_empty() {
            return None;
        }
        match self.inner.rfind_byte(b'/') {
            Some(pos) => Some(RelativePathBuf {
                inner: self.inner[..pos].to_vec(),
            }),
            None => Some(RelativePathBuf::root()),
        }
    }

    /// The final component, or None for the root.
    pub fn file_name(&self) -> Option<PathComponent> {
        if self.inner.is_empty() {
            return None;
        }
        let start = self.inner.rfind_byte(b'/').map(|p| p + 1).unwrap_or(0);
        // Components were validated on the way in.
        Some(PathComponent(Bytes::copy_from_slice(&self.inner[start..])))
    }

    /// Iterates over the components of the path. Empty for the root.
    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        let mut iter = self.inner.split_str(b"/");
        if self.inner.is_empty() {
            let _ = iter.next();
        }
        iter
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// The remainder of this path below `base`, or None if `base` is not a
    /// prefix. Stripping the root returns the path unchanged.
    pub fn strip_prefix(&self, base: &RelativePathBuf) -> Option<RelativePathBuf> {
        if base.is_root() {
            return Some(self.clone());
        }
        if self.inner == base.inner {
            return Some(RelativePathBuf::root());
        }
        let prefix_len = base.inner.len();
        if self.inner.len() > prefix_len
            && self.inner.starts_with(&base.inner)
            && self.inner[prefix_len] == b'/'
        {
            return Some(RelativePathBuf {
                inner: self.inner[prefix_len + 1..].to_vec(),
            });
        }
        None
    }
}

impl std::str::FromStr for RelativePathBuf {
    type Err = PathComponentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut path = RelativePathBuf::root();
        if s.is_empty() {
            return Ok(path);
        }
        for component in s.split('/') {
            path = path.join(&PathComponent::try_from(component)?);
        }
        Ok(path)
    }
}

impl std::fmt::Display for RelativePathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self.inner.as_bstr(), f)
    }
}

impl std::fmt::Debug for RelativePathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.inner.as_bstr(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"".to_vec())]
    #[case::dot(b".".to_vec())]
    #[case::dotdot(b"..".to_vec())]
    #[case::slash(b"a/b".to_vec())]
    #[case::nul(b"a\0b".to_vec())]
    fn rejects_invalid_components(#[case] name: Vec<u8>) {
        assert!(PathComponent::new(name).is_err());
    }

    #[test]
    fn rejects_overlong_component() {
        let name = vec![b'a'; MAX_COMPONENT_LEN + 1];
        assert_eq!(
            PathComponent::new(name),
            Err(PathComponentError::TooLong(256, 255))
        );
    }

    #[test]
    fn join_and_parent_round_trip() {
        let path: RelativePathBuf = "a/b/c".parse().unwrap();
        assert_eq!(path.to_string(), "a/b/c");
        assert_eq!(path.file_name().unwrap().to_string(), "c");
        assert_eq!(path.parent().unwrap().to_string(), "a/b");
        assert_eq!(
            path.parent().unwrap().parent().unwrap().to_string(),
            "a"
        );

        let root = RelativePathBuf::root();
        assert!(root.is_root());
        assert!(root.parent().is_none());
        assert!(root.file_name().is_none());
        assert_eq!(root.components().count(), 0);
    }

    #[test]
    fn strip_prefix_respects_component_boundaries() {
        let path: RelativePathBuf = "a/bc/d".parse().unwrap();
        let base: RelativePathBuf = "a/bc".parse().unwrap();
        let partial: RelativePathBuf = "a/b".parse().unwrap();
        assert_eq!(path.strip_prefix(&base).unwrap().to_string(), "d");
        assert_eq!(path.strip_prefix(&partial), None);
        assert_eq!(
            path.strip_prefix(&RelativePathBuf::root()).unwrap(),
            path
        );
        assert!(base.strip_prefix(&base).unwrap().is_root());
    }

    #[test]
    fn components_iterates_in_order() {
        let path: RelativePathBuf = "src/lib.rs".parse().unwrap();
        let components: Vec<_> = path.components().collect();
        assert_eq!(components, vec![&b"src"[..], &b"lib.rs"[..]]);
    }
}
