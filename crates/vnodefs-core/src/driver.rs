//! Path-based filesystem driver.
//!
//! [`VirtualFs`] is the protocol-facing operation set. Each entry point
//! takes the single filesystem-wide lock for its whole duration, resolves
//! the path (through mounts), acts on the resolved node, updates the handle
//! table, and returns a [`VfsResult`]. The coarse lock keeps every call
//! linearizable; it is also the throughput ceiling of the driver.
//!
//! Read and write report only a byte count. Their errors are logged and
//! collapsed to zero bytes.

use crate::config::FsConfig;
use crate::error::{VfsError, VfsResult};
use crate::handle_table::{Handle, OpenHandleTable, ROOT_HANDLE};
use crate::node::{FileStat, NodeKind, NodeRef, S_IFDIR, S_IFMT, S_IFREG, same_node};
use crate::resolver::{MountTable, Walk, canonical_path, resolve, split_parent};
use crate::trace::{CallTrace, TraceMask};
use nix::unistd::{getegid, geteuid};
use parking_lot::Mutex;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Capacity figure reported for blocks and inodes. Not backed by accounting.
pub const STATFS_UNLIMITED: u64 = 0x1000_0000_0000;

/// Synthetic filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub fragment_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    /// Free inodes available to unprivileged callers.
    pub files_available: u64,
    pub name_max: u32,
}

/// Everything the driver lock protects.
struct FsState {
    root: Option<NodeRef>,
    handles: OpenHandleTable,
    mounts: MountTable,
    uid: u32,
    gid: u32,
}

impl FsState {
    fn walk(&self, path: &str, prohibited: Option<&NodeRef>) -> VfsResult<Walk> {
        let root = self.root.as_ref().ok_or(VfsError::Invalid)?;
        Ok(resolve(root, &self.mounts, path, prohibited))
    }

    fn lookup(&self, path: &str) -> VfsResult<NodeRef> {
        self.walk(path, None)?.found()
    }

    /// Node open under `fh`, falling back to resolving `path`.
    fn node(&self, path: &str, fh: Option<Handle>) -> VfsResult<NodeRef> {
        if let Some(fh) = fh
            && let Ok(node) = self.handles.node(fh)
        {
            return Ok(node.clone());
        }
        self.lookup(path)
    }

    fn getattr(&self, path: &str, fh: Option<Handle>) -> VfsResult<FileStat> {
        let mut stat = self.node(path, fh)?.getattr()?;
        stat.uid = self.uid;
        stat.gid = self.gid;
        Ok(stat)
    }

    fn open_path(&mut self, path: &str, want_dir: bool) -> VfsResult<Handle> {
        let node = self.lookup(path)?;
        self.handles.open(path, node, want_dir)
    }

    /// Creates the node at `path` in its (existing) parent directory.
    fn make_node(&self, path: &str, mode: u32) -> VfsResult<NodeRef> {
        let Walk {
            node,
            remaining,
            outcome,
            ..
        } = self.walk(path, None)?;
        match outcome {
            Ok(()) => Err(VfsError::Exists),
            Err(VfsError::NotFound) if remaining.len() == 1 => {
                node.as_dir().ok_or(VfsError::NotDir)?.make(&remaining[0], mode)
            }
            Err(e) => Err(e),
        }
    }

    /// Removes the node at `path`. `want` restricts the kind removed.
    fn remove_node(&mut self, path: &str, want: Option<NodeKind>) -> VfsResult<()> {
        if path == "/" || self.mounts.is_mounted(path) {
            return Err(VfsError::Busy);
        }
        let node = self.lookup(path)?;
        match (want, node.kind()) {
            (Some(NodeKind::Directory), kind) if kind != NodeKind::Directory => {
                return Err(VfsError::NotDir);
            }
            (Some(NodeKind::File), NodeKind::Directory) => return Err(VfsError::IsDir),
            _ => {}
        }
        node.remove()?;
        self.handles.detach_path(path);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        let busy = |path: &str| path == "/" || self.mounts.is_mounted(path);
        if busy(from) || busy(to) {
            return Err(VfsError::Busy);
        }
        let node = self.lookup(from)?;

        let walk = self.walk(to, Some(&node))?;
        let (dest_dir, existing) = match walk.outcome {
            Ok(()) => (walk.parent.ok_or(VfsError::Busy)?, Some(walk.node)),
            Err(VfsError::NotFound) if walk.remaining.len() == 1 => (walk.node, None),
            Err(e) => return Err(e),
        };

        if let Some(existing) = existing {
            if same_node(&existing, &node) {
                return Ok(());
            }
            // Overwrite: no atomic replace.
            existing.remove()?;
            self.handles.detach_path(to);
        }

        let (_, name) = split_parent(to);
        dest_dir
            .as_dir()
            .ok_or(VfsError::NotDir)?
            .rename(&node, name)?;
        self.handles.rename_path(from, to);
        Ok(())
    }

    fn fsync(&self, fh: Handle, datasync: bool) -> VfsResult<()> {
        let node = self.handles.node(fh)?;
        node.data_sync();
        if !datasync {
            node.sync();
        }
        Ok(())
    }
}

/// The filesystem driver.
pub struct VirtualFs {
    state: Mutex<FsState>,
    config: FsConfig,
}

impl std::fmt::Debug for VirtualFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VirtualFs")
            .field("mounted", &state.root.is_some())
            .field("open_handles", &state.handles.len())
            .field("mounts", &state.mounts)
            .finish_non_exhaustive()
    }
}

impl VirtualFs {
    /// Creates a driver over `root`, which must be a directory.
    pub fn new(root: NodeRef, config: FsConfig) -> VfsResult<Self> {
        if root.as_dir().is_none() {
            return Err(VfsError::NotDir);
        }
        let (uid, gid) = Self::identity(&config);
        Ok(Self {
            state: Mutex::new(FsState {
                root: Some(root),
                handles: OpenHandleTable::new(),
                mounts: MountTable::new(),
                uid,
                gid,
            }),
            config,
        })
    }

    fn identity(config: &FsConfig) -> (u32, u32) {
        (
            config.uid.unwrap_or_else(|| geteuid().as_raw()),
            config.gid.unwrap_or_else(|| getegid().as_raw()),
        )
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    fn trace(
        &self,
        category: TraceMask,
        name: &'static str,
        args: impl FnOnce() -> String,
    ) -> CallTrace {
        CallTrace::start(self.config.trace_mask, category, name, args)
    }

    /// Captures the owner identity and opens the root, which receives
    /// [`ROOT_HANDLE`].
    pub fn init(&self) -> VfsResult<Handle> {
        let trace = self.trace(TraceMask::INIT, "init", String::new);
        let mut state = self.state.lock();
        let (uid, gid) = Self::identity(&self.config);
        state.uid = uid;
        state.gid = gid;
        info!(uid, gid, "Filesystem initialized");
        trace.finish(state.open_path("/", true))
    }

    /// Closes the root handle and drops the root. Later calls fail with `EINVAL`.
    pub fn destroy(&self) {
        let trace = self.trace(TraceMask::DESTROY, "destroy", String::new);
        let mut state = self.state.lock();
        if let Err(e) = state.handles.close(ROOT_HANDLE) {
            debug!(error = %e, "Root handle was not open at destroy");
        }
        state.root = None;
        trace.finish_value(());
    }

    /// The root directory, until [`destroy`](Self::destroy).
    pub fn root(&self) -> Option<NodeRef> {
        self.state.lock().root.clone()
    }

    // ---- attributes ----

    /// Attributes of the node open under `fh`, or at `path`, with the
    /// driver's uid/gid stamped in.
    pub fn getattr(&self, path: &str, fh: Option<Handle>) -> VfsResult<FileStat> {
        let trace = self.trace(TraceMask::GETATTR, "getattr", || format!("{path:?} fh={fh:?}"));
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.getattr(&path, fh))
    }

    /// Accepted and ignored; the driver owns identity and modes.
    pub fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let trace = self.trace(TraceMask::CHMOD, "chmod", || format!("{path:?} {mode:o}"));
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.lookup(&path).map(|_| ()))
    }

    /// Accepted and ignored; the driver owns identity and modes.
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> VfsResult<()> {
        let trace = self.trace(TraceMask::CHOWN, "chown", || format!("{path:?} {uid}:{gid}"));
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.lookup(&path).map(|_| ()))
    }

    pub fn utimens(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let trace = self.trace(TraceMask::UTIMENS, "utimens", || {
            format!("{path:?} {atime:?} {mtime:?}")
        });
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.lookup(&path).and_then(|n| n.utime(atime, mtime)))
    }

    /// Checks `mask` (`R_OK`/`W_OK`/`X_OK` bits) against the owner
    /// permission bits only.
    pub fn access(&self, path: &str, mask: u32) -> VfsResult<()> {
        let trace = self.trace(TraceMask::ACCESS, "access", || format!("{path:?} {mask:o}"));
        let path = canonical_path(path);
        let state = self.state.lock();
        let res = state.getattr(&path, None).and_then(|stat| {
            if (stat.mode >> 6) & mask == mask {
                Ok(())
            } else {
                Err(VfsError::Access)
            }
        });
        trace.finish(res)
    }

    // ---- directories ----

    pub fn opendir(&self, path: &str) -> VfsResult<Handle> {
        let trace = self.trace(TraceMask::OPENDIR, "opendir", || format!("{path:?}"));
        let path = canonical_path(path);
        let mut state = self.state.lock();
        trace.finish(state.open_path(&path, true))
    }

    /// Lists `.`, `..` and then every child of the directory open under
    /// `fh`, until `fill` returns `false`.
    pub fn readdir(&self, fh: Handle, fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        let trace = self.trace(TraceMask::READDIR, "readdir", || format!("fh={fh}"));
        let state = self.state.lock();
        let res = state.handles.dir(fh).and_then(|dir| {
            if !fill(".") || !fill("..") {
                return Ok(());
            }
            dir.readdir(fill)
        });
        trace.finish(res)
    }

    pub fn fsyncdir(&self, fh: Handle, datasync: bool) -> VfsResult<()> {
        let trace = self.trace(TraceMask::FSYNCDIR, "fsyncdir", || {
            format!("fh={fh} datasync={datasync}")
        });
        let state = self.state.lock();
        trace.finish(state.fsync(fh, datasync))
    }

    pub fn releasedir(&self, fh: Handle) -> VfsResult<()> {
        let trace = self.trace(TraceMask::RELEASEDIR, "releasedir", || format!("fh={fh}"));
        let mut state = self.state.lock();
        trace.finish(state.handles.close(fh))
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let trace = self.trace(TraceMask::MKDIR, "mkdir", || format!("{path:?} {mode:o}"));
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.make_node(&path, (mode & !S_IFMT) | S_IFDIR).map(|_| ()))
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        let trace = self.trace(TraceMask::RMDIR, "rmdir", || format!("{path:?}"));
        let path = canonical_path(path);
        let mut state = self.state.lock();
        trace.finish(state.remove_node(&path, Some(NodeKind::Directory)))
    }

    /// Moves the node at `from` to `to`, replacing an existing destination.
    ///
    /// The destination is resolved with the source as prohibited node, so
    /// moving a directory below itself fails with `ELOOP` and changes
    /// nothing. Open handles at or below `from` follow the move.
    pub fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let trace = self.trace(TraceMask::RENAME, "rename", || format!("{from:?} -> {to:?}"));
        let from = canonical_path(from);
        let to = canonical_path(to);
        let mut state = self.state.lock();
        trace.finish(state.rename(&from, &to))
    }

    // ---- files ----

    /// Opens an existing non-directory. Repeated opens of one path share
    /// the handle.
    pub fn open(&self, path: &str) -> VfsResult<Handle> {
        let trace = self.trace(TraceMask::OPEN, "open", || format!("{path:?}"));
        let path = canonical_path(path);
        let mut state = self.state.lock();
        trace.finish(state.open_path(&path, false))
    }

    /// Opens `path`, creating a file first if it does not exist. An
    /// existing file is opened as is, without truncation.
    pub fn create(&self, path: &str, mode: u32) -> VfsResult<Handle> {
        let trace = self.trace(TraceMask::CREATE, "create", || format!("{path:?} {mode:o}"));
        let path = canonical_path(path);
        let mut state = self.state.lock();
        if let Ok(fh) = state.open_path(&path, false) {
            return trace.finish(Ok(fh));
        }
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        let res = state
            .make_node(&path, mode)
            .map(|node| state.handles.open_node(&path, node));
        trace.finish(res)
    }

    /// Resizes a file. Without a usable `fh` the path is opened and closed
    /// around the call.
    pub fn truncate(&self, path: &str, size: u64, fh: Option<Handle>) -> VfsResult<()> {
        let trace = self.trace(TraceMask::TRUNCATE, "truncate", || {
            format!("{path:?} size={size} fh={fh:?}")
        });
        let path = canonical_path(path);
        let mut state = self.state.lock();
        if let Some(fh) = fh
            && let Ok(file) = state.handles.file(fh)
        {
            return trace.finish(file.truncate(size));
        }
        let res = state.open_path(&path, false).and_then(|fh| {
            let res = state.handles.file(fh).and_then(|f| f.truncate(size));
            let closed = state.handles.close(fh);
            res.and(closed)
        });
        trace.finish(res)
    }

    /// Reads from the file open under `fh`. Errors read as zero bytes.
    pub fn read(&self, fh: Handle, buf: &mut [u8], offset: u64) -> usize {
        let trace = self.trace(TraceMask::READ, "read", || {
            format!("fh={fh} len={} offset={offset}", buf.len())
        });
        let state = self.state.lock();
        let n = state
            .handles
            .file(fh)
            .and_then(|f| f.read_at(buf, offset))
            .unwrap_or_else(|e| {
                warn!(fh, offset, error = %e, "Read failed");
                0
            });
        trace.finish_value(n)
    }

    /// Writes to the file open under `fh`. Errors write zero bytes.
    pub fn write(&self, fh: Handle, buf: &[u8], offset: u64) -> usize {
        let trace = self.trace(TraceMask::WRITE, "write", || {
            format!("fh={fh} len={} offset={offset}", buf.len())
        });
        let state = self.state.lock();
        let n = state
            .handles
            .file(fh)
            .and_then(|f| f.write_at(buf, offset))
            .unwrap_or_else(|e| {
                warn!(fh, offset, error = %e, "Write failed");
                0
            });
        trace.finish_value(n)
    }

    /// Same effect as a full [`fsync`](Self::fsync).
    pub fn flush(&self, fh: Handle) -> VfsResult<()> {
        let trace = self.trace(TraceMask::FLUSH, "flush", || format!("fh={fh}"));
        let state = self.state.lock();
        trace.finish(state.fsync(fh, false))
    }

    /// Flushes content; unless `datasync`, metadata too.
    pub fn fsync(&self, fh: Handle, datasync: bool) -> VfsResult<()> {
        let trace = self.trace(TraceMask::FSYNC, "fsync", || {
            format!("fh={fh} datasync={datasync}")
        });
        let state = self.state.lock();
        trace.finish(state.fsync(fh, datasync))
    }

    pub fn release(&self, fh: Handle) -> VfsResult<()> {
        let trace = self.trace(TraceMask::RELEASE, "release", || format!("fh={fh}"));
        let mut state = self.state.lock();
        trace.finish(state.handles.close(fh))
    }

    /// Removes a non-directory. Open handles to it stay usable.
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        let trace = self.trace(TraceMask::UNLINK, "unlink", || format!("{path:?}"));
        let path = canonical_path(path);
        let mut state = self.state.lock();
        trace.finish(state.remove_node(&path, Some(NodeKind::File)))
    }

    // ---- extended attributes ----

    pub fn listxattr(&self, path: &str, fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        let trace = self.trace(TraceMask::LISTXATTR, "listxattr", || format!("{path:?}"));
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.lookup(&path).and_then(|n| n.listxattr(fill)))
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> VfsResult<()> {
        let trace = self.trace(TraceMask::SETXATTR, "setxattr", || {
            format!("{path:?} {name:?} len={} flags={flags:#x}", value.len())
        });
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.lookup(&path).and_then(|n| n.setxattr(name, value, flags)))
    }

    pub fn getxattr(&self, path: &str, name: &str) -> VfsResult<Vec<u8>> {
        let trace = self.trace(TraceMask::GETXATTR, "getxattr", || format!("{path:?} {name:?}"));
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.lookup(&path).and_then(|n| n.getxattr(name)))
    }

    pub fn removexattr(&self, path: &str, name: &str) -> VfsResult<()> {
        let trace = self.trace(TraceMask::REMOVEXATTR, "removexattr", || {
            format!("{path:?} {name:?}")
        });
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.lookup(&path).and_then(|n| n.removexattr(name)))
    }

    // ---- filesystem ----

    /// Effectively unlimited capacity.
    pub fn statfs(&self, path: &str) -> StatFs {
        let trace = self.trace(TraceMask::STATFS, "statfs", || format!("{path:?}"));
        trace.finish_value(StatFs {
            block_size: self.config.block_size,
            fragment_size: self.config.block_size,
            blocks: STATFS_UNLIMITED,
            blocks_free: STATFS_UNLIMITED,
            blocks_available: STATFS_UNLIMITED,
            files: STATFS_UNLIMITED,
            files_free: STATFS_UNLIMITED,
            files_available: STATFS_UNLIMITED,
            name_max: self.config.name_max,
        })
    }

    /// Creates a node at `path` with the kind given by the type bits of `mode`.
    pub fn make_node(&self, path: &str, mode: u32) -> VfsResult<NodeRef> {
        let trace = self.trace(TraceMask::MAKE, "make", || format!("{path:?} {mode:o}"));
        let path = canonical_path(path);
        let state = self.state.lock();
        trace.finish(state.make_node(&path, mode))
    }

    /// Removes the node at `path`, whatever its kind.
    pub fn remove_node(&self, path: &str) -> VfsResult<()> {
        let trace = self.trace(TraceMask::REMOVE, "remove", || format!("{path:?}"));
        let path = canonical_path(path);
        let mut state = self.state.lock();
        trace.finish(state.remove_node(&path, None))
    }

    /// Grafts `dir` over `path`; `EBUSY` if something is mounted there.
    pub fn mount(&self, path: &str, dir: NodeRef) -> VfsResult<()> {
        let trace = self.trace(TraceMask::MOUNT, "mount", || format!("{path:?} {dir:?}"));
        let mut state = self.state.lock();
        trace.finish(state.mounts.mount(path, dir))
    }

    /// Removes the mount at `path`; `EINVAL` if nothing is mounted there.
    ///
    /// Handles opened beneath the mount keep the detached sub-tree alive
    /// until they are released.
    pub fn unmount(&self, path: &str) -> VfsResult<()> {
        let trace = self.trace(TraceMask::UNMOUNT, "unmount", || format!("{path:?}"));
        let mut state = self.state.lock();
        trace.finish(state.mounts.unmount(path).map(|_| ()))
    }

    // ---- introspection ----

    /// Handle and open count of the entry shared under `path`.
    pub fn open_entry(&self, path: &str) -> Option<(Handle, u32)> {
        let path = canonical_path(path);
        let state = self.state.lock();
        let fh = state.handles.handle_for(&path)?;
        state.handles.entry(fh).map(|e| (fh, e.open_count))
    }

    /// Node open under `fh`.
    pub fn open_node(&self, fh: Handle) -> VfsResult<NodeRef> {
        self.state.lock().handles.node(fh).cloned()
    }

    /// Number of live handle-table entries.
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Resolves `path` to a node without opening it.
    pub fn lookup(&self, path: &str) -> VfsResult<NodeRef> {
        let path = canonical_path(path);
        self.state.lock().lookup(&path)
    }
}
