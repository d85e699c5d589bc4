//! Error taxonomy for the virtual filesystem driver.
//!
//! Every node operation and driver entry point reports failure through
//! [`VfsError`]. The protocol boundary only ever sees POSIX codes:
//! [`VfsError::to_errno`] yields the positive `libc` value consumed by
//! fuser replies, [`VfsError::status`] the negative status code.

use std::io;
use thiserror::Error;
use tracing::warn;

/// `ENOATTR` is only spelled that way on macOS; Linux reports `ENODATA`.
#[cfg(target_os = "macos")]
pub const ENOATTR: i32 = libc::ENOATTR;
/// `ENOATTR` is only spelled that way on macOS; Linux reports `ENODATA`.
#[cfg(not(target_os = "macos"))]
pub const ENOATTR: i32 = libc::ENODATA;

/// Errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum VfsError {
    /// A path component does not exist.
    #[error("No such file or directory")]
    NotFound,

    /// The entry already exists.
    #[error("File exists")]
    Exists,

    /// A directory was required.
    #[error("Not a directory")]
    NotDir,

    /// A non-directory was required.
    #[error("Is a directory")]
    IsDir,

    /// Traversal hit the prohibited node (rename into own subtree).
    #[error("Too many levels of symbolic links")]
    Loop,

    /// Permission or owner-mask check failed.
    #[error("Permission denied")]
    Access,

    /// Mutation attempted on a read-only node.
    #[error("Read-only file system")]
    ReadOnly,

    /// Disallowed attribute mutation.
    #[error("Operation not permitted")]
    PermissionDenied,

    /// Operation not overridden by the node implementation.
    #[error("Function not implemented")]
    NotImplemented,

    /// Mount point already in use.
    #[error("Device or resource busy")]
    Busy,

    /// Unknown handle, wrong handle kind, or unmount of a non-mounted path.
    #[error("Invalid argument")]
    Invalid,

    /// Directory removal while children remain.
    #[error("Directory not empty")]
    NotEmpty,

    /// Unknown extended attribute.
    #[error("No such attribute")]
    NoAttr,

    /// Attribute or name listing exhausted the caller's buffer.
    #[error("Result too large")]
    Range,

    /// Rename between two unrelated node implementations.
    #[error("Invalid cross-device link")]
    CrossDevice,

    /// Write or resize past the largest size the store can hold.
    #[error("File too large")]
    FileTooLarge,

    /// Backing store failure.
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl VfsError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            VfsError::NotFound => libc::ENOENT,
            VfsError::Exists => libc::EEXIST,
            VfsError::NotDir => libc::ENOTDIR,
            VfsError::IsDir => libc::EISDIR,
            VfsError::Loop => libc::ELOOP,
            VfsError::Access => libc::EACCES,
            VfsError::ReadOnly => libc::EROFS,
            VfsError::PermissionDenied => libc::EPERM,
            VfsError::NotImplemented => libc::ENOSYS,
            VfsError::Busy => libc::EBUSY,
            VfsError::Invalid => libc::EINVAL,
            VfsError::NotEmpty => libc::ENOTEMPTY,
            VfsError::NoAttr => ENOATTR,
            VfsError::Range => libc::ERANGE,
            VfsError::CrossDevice => libc::EXDEV,
            VfsError::FileTooLarge => libc::EFBIG,
            VfsError::Io(_) => libc::EIO,
        }
    }

    /// Negative POSIX status code, as returned by path-level protocol calls.
    #[inline]
    pub fn status(&self) -> i32 {
        -self.to_errno()
    }
}

/// Result type for filesystem operations.
pub type VfsResult<T> = Result<T, VfsError>;

/// Collapses a result into a protocol status code (0 on success).
pub fn status_of<T>(result: &VfsResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

impl From<io::Error> for VfsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => VfsError::NotFound,
            io::ErrorKind::PermissionDenied => VfsError::Access,
            io::ErrorKind::AlreadyExists => VfsError::Exists,
            io::ErrorKind::Unsupported => VfsError::NotImplemented,
            io::ErrorKind::InvalidInput => VfsError::Invalid,
            io::ErrorKind::FileTooLarge => VfsError::FileTooLarge,
            _ => {
                warn!(error = %e, "Unmapped backing store error, reporting EIO");
                VfsError::Io(e)
            }
        }
    }
}
