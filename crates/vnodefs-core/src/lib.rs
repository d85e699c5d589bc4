//! Path-based virtual filesystem driver over pluggable node trees.
//!
//! This crate translates filesystem protocol calls (open, read, write,
//! readdir, rename, attributes, xattrs) into operations on a tree of
//! [`Node`] trait objects, and adds three services the protocol itself does
//! not provide:
//!
//! - **Open sharing**: repeated opens of one path share one handle and one
//!   live node, reference counted by the [`OpenHandleTable`].
//! - **Mount overlay**: directories of unrelated implementations can be
//!   grafted over path prefixes at runtime ([`VirtualFs::mount`]).
//! - **Page cache**: [`DynamicPagedFile`] exposes any page-addressable
//!   [`PagedFile`] store as a [`File`] with a single-page write-back cache.
//!
//! # Components
//!
//! - [`Node`], [`Dir`], [`File`] - capability contracts with base defaults
//! - [`VirtualFs`] - the protocol-facing driver, one coarse lock
//! - [`OpenHandleTable`] - path-shared, ref-counted open entries
//! - [`MountTable`] / [`resolve`] - path resolution through mounts
//! - [`DynamicPagedFile`] - single-page cache adapter
//! - [`MemDir`] / [`MemFile`] - mutable in-memory tree
//! - [`StaticDir`] / [`StaticFile`] - read-only adapters
//! - [`WindowPagedFile`] - page view of a host file window
//!
//! # Example
//!
//! ```
//! use vnodefs_core::{FsConfig, MemDir, VirtualFs};
//!
//! let fs = VirtualFs::new(MemDir::new_root(), FsConfig::default()).unwrap();
//! fs.init().unwrap();
//!
//! let fh = fs.create("/hello.txt", 0o644).unwrap();
//! assert_eq!(fs.write(fh, b"hello", 0), 5);
//!
//! let mut buf = [0u8; 5];
//! assert_eq!(fs.read(fh, &mut buf, 0), 5);
//! assert_eq!(&buf, b"hello");
//! fs.release(fh).unwrap();
//! ```

#![warn(clippy::all)]

mod config;
mod driver;
mod error;
mod handle_table;
mod memfs;
mod node;
mod paged;
mod resolver;
mod static_node;
mod trace;
mod window;

/// Test fixtures shared by unit and integration tests.
pub mod testing;

pub use config::{DEFAULT_NAME_MAX, FsConfig};
pub use driver::{STATFS_UNLIMITED, StatFs, VirtualFs};
pub use error::{ENOATTR, VfsError, VfsResult, status_of};
pub use handle_table::{Handle, OpenEntry, OpenHandleTable, ROOT_HANDLE};
pub use memfs::{DEFAULT_PAGE_SIZE, MemDir, MemFile};
pub use node::{
    DEFAULT_DIR_PERM, DEFAULT_FILE_PERM, Dir, FS_BLOCK_SIZE, File, FileStat, Node, NodeKind,
    NodeRef, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, same_node,
};
pub use paged::{DynamicPagedFile, MAX_FILE_SIZE, MEM_PAGES_MAX_SIZE, MemPages, PagedFile};
pub use resolver::{MountTable, Walk, canonical_path, components, resolve, split_parent};
pub use static_node::{StaticDir, StaticFile};
pub use trace::{CallTrace, ParseTraceMaskError, TraceMask};
pub use window::WindowPagedFile;
