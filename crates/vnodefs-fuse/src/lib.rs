//! FUSE frontend for the vnodefs driver.
//!
//! Exposes a [`VirtualFs`](vnodefs_core::VirtualFs) to the kernel: inode
//! numbers are mapped to canonical driver paths, file handles are passed
//! through, and every request becomes one driver call.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use vnodefs_core::{FsConfig, MemDir, VirtualFs};
//! use vnodefs_fuse::{MountConfig, VnodeFs, mount};
//!
//! let driver = Arc::new(VirtualFs::new(MemDir::new_root(), FsConfig::default())?);
//! let handle = mount(VnodeFs::new(driver, MountConfig::default()), mountpoint)?;
//! // ...
//! handle.unmount();
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod inode;

pub use backend::{FuseBackend, FuseMountHandle, mount, mount_options};
pub use config::MountConfig;
pub use error::{FuseError, FuseResult};
pub use filesystem::{VnodeFs, to_file_attr};
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
