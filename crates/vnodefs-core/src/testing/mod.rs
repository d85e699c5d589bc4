//! Testing utilities for driver and page cache tests.
//!
//! - **Generators**: page-boundary aware content
//! - **Assertions**: content and errno checks with readable failures
//! - **Recording store**: a [`PagedFile`](crate::PagedFile) that logs every
//!   page operation and can be told to fail
//!
//! # Usage
//!
//! ```
//! use vnodefs_core::testing::{RecordingPages, PageOp, patterned};
//! use vnodefs_core::DynamicPagedFile;
//!
//! let (pages, log) = RecordingPages::new(patterned(10), 4);
//! let file = DynamicPagedFile::new(pages).unwrap();
//! assert_eq!(log.take(), vec![PageOp::Read(0)]);
//! # let _ = file;
//! ```

pub mod assertions;
pub mod generators;
pub mod recording;

pub use assertions::{assert_bytes_equal, assert_vfs_err, errno_name};
pub use generators::{page_minus_one, page_plus_one, patterned, spanning_pages};
pub use recording::{OpLog, PageOp, RecordingPages};
