//! Errors of the FUSE frontend and their errno mapping.

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use vnodefs_core::VfsError;

/// Errors raised while bridging kernel requests or mounting.
#[derive(Debug, Error)]
pub enum FuseError {
    /// The driver refused the operation.
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// The kernel referenced an inode the table does not know, or whose
    /// path has been unlinked.
    #[error("Invalid inode: {0}")]
    InvalidInode(u64),

    /// A name that is not valid UTF-8 or contains a separator.
    #[error("Invalid file name")]
    InvalidName,

    /// Rename flags (`RENAME_NOREPLACE`, `RENAME_EXCHANGE`) the driver
    /// cannot honour.
    #[error("Unsupported rename flags: {0:#x}")]
    UnsupportedFlags(u32),

    /// The mountpoint does not exist or is not a directory.
    #[error("Mountpoint is not a directory: {}", .0.display())]
    BadMountpoint(PathBuf),

    /// Mount syscall or session failure.
    #[error("Mount failed: {0}")]
    Mount(#[from] io::Error),
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Vfs(e) => e.to_errno(),
            FuseError::InvalidInode(_) => libc::ENOENT,
            FuseError::InvalidName | FuseError::UnsupportedFlags(_) => libc::EINVAL,
            FuseError::BadMountpoint(_) => libc::ENOTDIR,
            FuseError::Mount(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result type for bridge operations.
pub type FuseResult<T> = Result<T, FuseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FuseError::Vfs(VfsError::NotEmpty).to_errno(), libc::ENOTEMPTY);
        assert_eq!(FuseError::InvalidInode(7).to_errno(), libc::ENOENT);
        assert_eq!(FuseError::InvalidName.to_errno(), libc::EINVAL);
        assert_eq!(FuseError::UnsupportedFlags(1).to_errno(), libc::EINVAL);
        assert_eq!(
            FuseError::Mount(io::Error::from_raw_os_error(libc::EPERM)).to_errno(),
            libc::EPERM
        );
        assert_eq!(FuseError::Mount(io::Error::other("x")).to_errno(), libc::EIO);
    }

    #[test]
    fn test_vfs_error_display_is_transparent() {
        let e = FuseError::from(VfsError::Busy);
        assert_eq!(e.to_string(), VfsError::Busy.to_string());
    }
}
