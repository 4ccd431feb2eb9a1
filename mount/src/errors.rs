use thiserror::Error;

use canopy_castore::PathComponentError;

/// The error taxonomy of the inode core.
///
/// Every variant is cloneable so a single load failure can be delivered to
/// every waiter attached to the same in-flight load.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FsError {
    #[error("{0}: no such file or directory")]
    NotFound(String),

    #[error("{0}: not a directory")]
    NotADirectory(String),

    #[error("{0}: is a directory")]
    IsADirectory(String),

    #[error("{0}: file exists")]
    AlreadyExists(String),

    #[error("{0}: directory not empty")]
    NotEmpty(String),

    #[error("{0}: file name too long")]
    NameTooLong(String),

    #[error("{0}: permission denied")]
    PermissionDenied(String),

    #[error("{0}: too many levels of symbolic links")]
    TooManySymlinks(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("a checkout operation is already in progress")]
    CheckoutInProgress,

    #[error("working copy parent is out of date: expected {expected}, actual {actual}")]
    OutOfDateParent { expected: String, actual: String },

    #[error("journal entries before sequence {0} have been truncated")]
    JournalTruncated(u64),

    #[error("mount generation changed: expected {expected}, found {found}")]
    MountGenerationChanged { expected: u64, found: u64 },

    #[error(transparent)]
    Store(#[from] canopy_castore::Error),

    #[error("overlay error: {0}")]
    Overlay(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("i/o error: {0}")]
    Io(String),

    /// An internal invariant was violated. Fatal for the operation that hit
    /// it, never for the process.
    #[error("bug: {0}")]
    Bug(String),
}

impl FsError {
    pub fn not_found(path: impl std::fmt::Display) -> Self {
        FsError::NotFound(path.to_string())
    }

    pub fn is_bug(&self) -> bool {
        matches!(self, FsError::Bug(_))
    }
}

impl From<PathComponentError> for FsError {
    fn from(value: PathComponentError) -> Self {
        match &value {
            PathComponentError::TooLong(..) => FsError::NameTooLong(value.to_string()),
            _ => FsError::InvalidArgument(value.to_string()),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(value: std::io::Error) -> Self {
        FsError::Io(value.to_string())
    }
}
