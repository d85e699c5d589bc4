//! Reference-counted open-handle table.
//!
//! Every open of a path goes through [`OpenHandleTable::open`]. Repeated
//! opens of the same canonical path share one entry (and one handle) whose
//! `open_count` tracks how many releases are still outstanding. Only the
//! final release closes the node's content.
//!
//! # Handle Lifecycle
//!
//! 1. **Open**: the driver resolves the path, then registers the node here.
//!    An existing entry for the path is reused without re-checking the node
//!    type.
//! 2. **Get**: I/O calls fetch the node by handle with a capability check.
//! 3. **Close**: decrements the count; at zero both mappings go away and the
//!    node is closed (files) or synced (everything else).
//!
//! The table is not internally synchronized. It lives inside the driver's
//! state mutex, so the path map and the handle map can never be observed
//! out of step.

use crate::error::{VfsError, VfsResult};
use crate::node::{Dir, File, NodeKind, NodeRef};
use std::collections::HashMap;
use tracing::trace;

/// Numeric handle returned by open calls.
pub type Handle = u64;

/// Handle of the root directory, allocated by the first open at `init`.
pub const ROOT_HANDLE: Handle = 1;

/// One live open entry.
#[derive(Debug, Clone)]
pub struct OpenEntry {
    pub node: NodeRef,
    /// Path the entry is shared under. `None` once the path was unlinked or
    /// overwritten; the handle stays usable until released.
    pub path: Option<String>,
    pub open_count: u32,
}

/// Handle → entry and path → handle maps, kept mutually consistent.
#[derive(Debug)]
pub struct OpenHandleTable {
    entries: HashMap<Handle, OpenEntry>,
    paths: HashMap<String, Handle>,
    next_handle: Handle,
}

impl Default for OpenHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenHandleTable {
    /// Creates an empty table. The first handle handed out is [`ROOT_HANDLE`].
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            paths: HashMap::new(),
            next_handle: ROOT_HANDLE,
        }
    }

    /// Registers an open of `path`, which resolved to `node`.
    ///
    /// A live entry for `path` is shared: its count goes up and its handle
    /// is returned. Otherwise the node's type must match `want_dir`
    /// (`EISDIR` / `ENOTDIR` on mismatch, nothing inserted).
    pub fn open(&mut self, path: &str, node: NodeRef, want_dir: bool) -> VfsResult<Handle> {
        if let Some(&handle) = self.paths.get(path)
            && let Some(entry) = self.entries.get_mut(&handle)
        {
            entry.open_count += 1;
            trace!(handle, path, open_count = entry.open_count, "Shared open");
            return Ok(handle);
        }

        let is_dir = node.kind() == NodeKind::Directory;
        if is_dir != want_dir {
            return Err(if is_dir { VfsError::IsDir } else { VfsError::NotDir });
        }

        Ok(self.insert(path, node))
    }

    /// Registers `node` under `path` without a type check, sharing an
    /// existing entry like [`open`](Self::open). Used right after creation.
    pub fn open_node(&mut self, path: &str, node: NodeRef) -> Handle {
        if let Some(&handle) = self.paths.get(path)
            && let Some(entry) = self.entries.get_mut(&handle)
        {
            entry.open_count += 1;
            return handle;
        }
        self.insert(path, node)
    }

    fn insert(&mut self, path: &str, node: NodeRef) -> Handle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(
            handle,
            OpenEntry {
                node,
                path: Some(path.to_owned()),
                open_count: 1,
            },
        );
        self.paths.insert(path.to_owned(), handle);
        trace!(handle, path, "New open entry");
        handle
    }

    /// Releases one open of `handle`.
    ///
    /// On the last release the entry is removed and the node closed (files)
    /// or synced (everything else); the close result is returned.
    pub fn close(&mut self, handle: Handle) -> VfsResult<()> {
        let entry = self.entries.get_mut(&handle).ok_or(VfsError::Invalid)?;
        entry.open_count -= 1;
        if entry.open_count > 0 {
            return Ok(());
        }

        let Some(entry) = self.entries.remove(&handle) else {
            return Err(VfsError::Invalid);
        };
        if let Some(path) = &entry.path
            && self.paths.get(path) == Some(&handle)
        {
            self.paths.remove(path);
        }
        trace!(handle, path = ?entry.path, "Closing last open");

        match entry.node.as_file() {
            Some(file) => file.close(),
            None => {
                entry.node.sync();
                Ok(())
            }
        }
    }

    /// Node behind `handle`, any kind.
    pub fn node(&self, handle: Handle) -> VfsResult<&NodeRef> {
        self.entries
            .get(&handle)
            .map(|e| &e.node)
            .ok_or(VfsError::Invalid)
    }

    /// Directory behind `handle`; `EINVAL` for unknown handles and non-directories.
    pub fn dir(&self, handle: Handle) -> VfsResult<&dyn Dir> {
        self.node(handle)?.as_dir().ok_or(VfsError::Invalid)
    }

    /// File behind `handle`; `EINVAL` for unknown handles and non-files.
    pub fn file(&self, handle: Handle) -> VfsResult<&dyn File> {
        self.node(handle)?.as_file().ok_or(VfsError::Invalid)
    }

    pub fn entry(&self, handle: Handle) -> Option<&OpenEntry> {
        self.entries.get(&handle)
    }

    /// Handle currently shared under `path`.
    pub fn handle_for(&self, path: &str) -> Option<Handle> {
        self.paths.get(path).copied()
    }

    /// Stops sharing the entry opened under `path` (after unlink or overwrite).
    pub fn detach_path(&mut self, path: &str) {
        if let Some(handle) = self.paths.remove(path)
            && let Some(entry) = self.entries.get_mut(&handle)
        {
            entry.path = None;
        }
    }

    /// Re-keys every entry opened at or below `from` to live under `to`.
    pub fn rename_path(&mut self, from: &str, to: &str) {
        let moved: Vec<(String, Handle)> = self
            .paths
            .iter()
            .filter(|(p, _)| is_at_or_below(p, from))
            .map(|(p, h)| (p.clone(), *h))
            .collect();

        for (old, handle) in moved {
            self.paths.remove(&old);
            let new = format!("{to}{}", &old[from.len()..]);
            if let Some(entry) = self.entries.get_mut(&handle) {
                entry.path = Some(new.clone());
            }
            self.paths.insert(new, handle);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether `path` equals `prefix` or lies beneath it, on component boundaries.
pub(crate) fn is_at_or_below(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
