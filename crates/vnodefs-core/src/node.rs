//! Node capability contracts.
//!
//! A filesystem tree is built from [`Node`] trait objects. A node may
//! additionally expose the [`Dir`] or [`File`] capability; the driver asks
//! for them explicitly through [`Node::as_dir`] / [`Node::as_file`] and maps
//! a missing capability to `ENOTDIR` / `EINVAL` instead of panicking.
//!
//! Every method except [`Node::kind`] has a default, so a concrete type only
//! overrides what it actually supports. The defaults are the "base" node
//! behaviour: attribute mutations are accepted and ignored, removal and
//! structural changes report `ENOSYS`.

use crate::error::{VfsError, VfsResult};
use std::any::Any;
use std::sync::Arc;
use std::time::SystemTime;

/// Block size reported in attributes and statfs.
pub const FS_BLOCK_SIZE: u32 = 0x1000;

/// File type mask of [`FileStat::mode`].
pub const S_IFMT: u32 = 0o170_000;
/// Directory type bit.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type bit.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link type bit.
pub const S_IFLNK: u32 = 0o120_000;

/// Default file permissions (rw-r--r--).
pub const DEFAULT_FILE_PERM: u32 = 0o644;

/// Default directory permissions (rwxr-xr-x).
pub const DEFAULT_DIR_PERM: u32 = 0o755;

/// Shared, reference-counted node handle.
///
/// The tree (root, parent child tables) owns nodes; the handle table and
/// mount table hold additional references to the same allocation.
pub type NodeRef = Arc<dyn Node>;

/// The variant of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A directory; exposes [`Dir`].
    Directory,
    /// A regular file; exposes [`File`].
    File,
    /// Symbolic link. Reserved, no bundled implementation produces it.
    Link,
}

impl NodeKind {
    /// Derives the kind from the type bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => NodeKind::Directory,
            S_IFLNK => NodeKind::Link,
            _ => NodeKind::File,
        }
    }

    /// Type bits for this kind.
    pub fn type_bits(self) -> u32 {
        match self {
            NodeKind::Directory => S_IFDIR,
            NodeKind::File => S_IFREG,
            NodeKind::Link => S_IFLNK,
        }
    }
}

/// Node attributes, the driver's view of `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Type bits plus permission bits.
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    /// Stamped by the driver; nodes leave these at 0.
    pub uid: u32,
    pub gid: u32,
}

impl FileStat {
    /// Attributes with current timestamps and the default permissions for `kind`.
    pub fn new(kind: NodeKind) -> Self {
        let now = SystemTime::now();
        let perm = match kind {
            NodeKind::Directory => DEFAULT_DIR_PERM,
            NodeKind::File => DEFAULT_FILE_PERM,
            NodeKind::Link => 0o777,
        };
        Self {
            mode: kind.type_bits() | perm,
            nlink: 1,
            size: 0,
            blksize: FS_BLOCK_SIZE,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            uid: 0,
            gid: 0,
        }
    }

    /// Sets the reported size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }

    /// Permission bits only.
    #[inline]
    pub fn perm(&self) -> u32 {
        self.mode & !S_IFMT
    }
}

/// Common node capability.
pub trait Node: Any + Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Fills attributes. The driver overwrites uid/gid afterwards.
    fn getattr(&self) -> VfsResult<FileStat> {
        Ok(FileStat::new(self.kind()))
    }

    /// Calls `fill` for every attribute name; stops with `ERANGE` once
    /// `fill` returns `false`.
    fn listxattr(&self, _fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        Ok(())
    }

    fn setxattr(&self, _name: &str, _value: &[u8], _flags: i32) -> VfsResult<()> {
        Ok(())
    }

    fn getxattr(&self, _name: &str) -> VfsResult<Vec<u8>> {
        Err(VfsError::NoAttr)
    }

    fn removexattr(&self, _name: &str) -> VfsResult<()> {
        Ok(())
    }

    fn utime(&self, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Ok(())
    }

    /// Unlinks the node from its parent. Directories must refuse with
    /// `ENOTEMPTY` while they have children.
    fn remove(&self) -> VfsResult<()> {
        Err(VfsError::NotImplemented)
    }

    /// Flush the node's own metadata.
    fn sync(&self) {}

    /// Flush file content, or the children's metadata for directories.
    fn data_sync(&self) {}

    /// Directory capability, if this node has it.
    fn as_dir(&self) -> Option<&dyn Dir> {
        None
    }

    /// File capability, if this node has it.
    fn as_file(&self) -> Option<&dyn File> {
        None
    }
}

impl std::fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{:p}", self.kind(), std::ptr::from_ref(self).cast::<()>())
    }
}

/// Directory capability.
pub trait Dir: Node {
    fn lookup(&self, _name: &str) -> Option<NodeRef> {
        None
    }

    /// Visits child names until `fill` returns `false`.
    fn readdir(&self, _fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        Ok(())
    }

    /// Creates and inserts a child. `mode` carries the type bits.
    fn make(&self, _name: &str, _mode: u32) -> VfsResult<NodeRef> {
        Err(VfsError::NotImplemented)
    }

    /// Moves `node` (currently living anywhere in the same implementation)
    /// into this directory under `new_name`.
    fn rename(&self, _node: &NodeRef, _new_name: &str) -> VfsResult<()> {
        Err(VfsError::NotImplemented)
    }
}

/// Random-access file capability.
pub trait File: Node {
    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> VfsResult<usize> {
        Ok(0)
    }

    fn write_at(&self, buf: &[u8], _offset: u64) -> VfsResult<usize> {
        Ok(buf.len())
    }

    /// Releases content. Called once the last handle to the node closes.
    fn close(&self) -> VfsResult<()> {
        Ok(())
    }

    fn truncate(&self, _size: u64) -> VfsResult<()> {
        Err(VfsError::NotImplemented)
    }
}

/// Identity comparison that ignores vtable pointers.
#[inline]
pub fn same_node(a: &NodeRef, b: &NodeRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl Node for Plain {
        fn kind(&self) -> NodeKind {
            NodeKind::File
        }

        fn as_file(&self) -> Option<&dyn File> {
            Some(self)
        }
    }

    impl File for Plain {}

    struct Folder;

    impl Node for Folder {
        fn kind(&self) -> NodeKind {
            NodeKind::Directory
        }

        fn as_dir(&self) -> Option<&dyn Dir> {
            Some(self)
        }
    }

    impl Dir for Folder {}

    #[test]
    fn test_file_defaults() {
        let f = Plain;
        let stat = f.getattr().unwrap();
        assert_eq!(stat.mode, S_IFREG | 0o644);
        assert_eq!(stat.nlink, 1);
        assert_eq!(stat.blksize, FS_BLOCK_SIZE);

        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 0);
        assert_eq!(f.write_at(b"abc", 0).unwrap(), 3);
        assert!(matches!(f.truncate(0), Err(VfsError::NotImplemented)));
        assert!(matches!(f.remove(), Err(VfsError::NotImplemented)));
        assert!(matches!(f.getxattr("user.x"), Err(VfsError::NoAttr)));
        assert!(f.setxattr("user.x", b"1", 0).is_ok());
        assert!(f.as_dir().is_none());
    }

    #[test]
    fn test_dir_defaults() {
        let d = Folder;
        assert_eq!(d.getattr().unwrap().mode, S_IFDIR | 0o755);
        assert!(d.lookup("x").is_none());
        assert!(matches!(d.make("x", S_IFREG), Err(VfsError::NotImplemented)));

        let mut names = Vec::new();
        d.readdir(&mut |n| {
            names.push(n.to_string());
            true
        })
        .unwrap();
        assert!(names.is_empty());
        assert!(d.as_file().is_none());
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(NodeKind::from_mode(S_IFDIR | 0o700), NodeKind::Directory);
        assert_eq!(NodeKind::from_mode(S_IFREG | 0o600), NodeKind::File);
        assert_eq!(NodeKind::from_mode(0o644), NodeKind::File);
        assert_eq!(NodeKind::from_mode(S_IFLNK), NodeKind::Link);
    }

    #[test]
    fn test_same_node_identity() {
        let a: NodeRef = Arc::new(Plain);
        let b: NodeRef = Arc::new(Plain);
        let a2 = Arc::clone(&a);
        assert!(same_node(&a, &a2));
        assert!(!same_node(&a, &b));
    }
}
