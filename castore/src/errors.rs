use thiserror::Error;

use crate::ObjectId;

/// Errors related to communication with the object store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),

    /// The store has no object with the given id. This is a distinct variant
    /// because the working copy treats a missing object very differently from
    /// a transport failure: a missing object under an unmaterialized inode is
    /// a corrupt mount, not something to retry.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("unknown commit root {0}")]
    RootNotFound(String),
}

/// Errors constructing a [crate::PathComponent].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PathComponentError {
    #[error("path component cannot be empty")]
    Empty,
    #[error("invalid path component: {0:?}")]
    InvalidName(String),
    #[error("path component of {0} bytes exceeds the {1} byte limit")]
    TooLong(usize, usize),
}

/// Errors populating a [crate::Tree].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    #[error("{0:?} is a duplicate name")]
    DuplicateName(String),
    #[error("entries are not sorted at {0:?}")]
    WrongSorting(String),
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::ObjectNotFound(_) | Error::RootNotFound(_) => {
                Self::new(std::io::ErrorKind::NotFound, value.to_string())
            }
            Error::StorageError(msg) => Self::new(std::io::ErrorKind::Other, msg),
        }
    }
}
