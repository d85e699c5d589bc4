//! Driver configuration.

use crate::node::FS_BLOCK_SIZE;
use crate::trace::TraceMask;

/// Maximum file name length reported by statfs.
pub const DEFAULT_NAME_MAX: u32 = 255;

/// Configuration options for [`VirtualFs`](crate::VirtualFs).
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Calls that emit a trace event. Default: every call.
    pub trace_mask: TraceMask,

    /// Owner stamped on every attribute. `None` captures the effective
    /// user id at `init`.
    pub uid: Option<u32>,

    /// Group stamped on every attribute. `None` captures the effective
    /// group id at `init`.
    pub gid: Option<u32>,

    /// Block size reported by statfs. Default: 4096.
    pub block_size: u32,

    /// Maximum name length reported by statfs. Default: 255.
    pub name_max: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            trace_mask: TraceMask::ALL,
            uid: None,
            gid: None,
            block_size: FS_BLOCK_SIZE,
            name_max: DEFAULT_NAME_MAX,
        }
    }
}

impl FsConfig {
    /// Sets the traced call categories.
    #[must_use]
    pub fn trace_mask(mut self, mask: TraceMask) -> Self {
        self.trace_mask = mask;
        self
    }

    /// Overrides the reported owner instead of using the process identity.
    #[must_use]
    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    #[must_use]
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    #[must_use]
    pub fn name_max(mut self, max: u32) -> Self {
        self.name_max = max;
        self
    }
}
