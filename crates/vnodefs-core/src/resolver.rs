//! Path resolution through mount overlays.
//!
//! Paths are slash-separated and always resolved against the root or, when
//! a mount prefix matches, against the mounted directory with the prefix
//! stripped. Resolution returns a [`Walk`]: the deepest node reached, its
//! parent directory, the components that could not be consumed, and the
//! outcome. Callers use the leftovers to tell "only the leaf is missing"
//! apart from deeper failures.

use crate::error::{VfsError, VfsResult};
use crate::handle_table::is_at_or_below;
use crate::node::{NodeKind, NodeRef, same_node};
use std::collections::BTreeMap;
use tracing::debug;

/// Normalizes `path` to the canonical form used as table key: a leading
/// `/`, no empty components, no trailing `/`.
pub fn canonical_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for comp in components(path) {
        out.push('/');
        out.push_str(comp);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Non-empty components of `path`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Splits a canonical path into its parent path and final component.
/// The root splits into `("/", "")`.
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

/// Directories grafted over path prefixes.
#[derive(Default)]
pub struct MountTable {
    mounts: BTreeMap<String, NodeRef>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.mounts.keys()).finish()
    }
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grafts `dir` over `path`. `EBUSY` if the path is already a mount
    /// point, `ENOTDIR` if `dir` is not a directory.
    pub fn mount(&mut self, path: &str, dir: NodeRef) -> VfsResult<()> {
        if dir.as_dir().is_none() {
            return Err(VfsError::NotDir);
        }
        let path = canonical_path(path);
        if self.mounts.contains_key(&path) {
            return Err(VfsError::Busy);
        }
        debug!(path, "Mounted directory");
        self.mounts.insert(path, dir);
        Ok(())
    }

    /// Removes the mount at `path`, returning the detached directory.
    /// `EINVAL` if nothing is mounted there.
    pub fn unmount(&mut self, path: &str) -> VfsResult<NodeRef> {
        let path = canonical_path(path);
        let dir = self.mounts.remove(&path).ok_or(VfsError::Invalid)?;
        debug!(path, "Unmounted directory");
        Ok(dir)
    }

    /// Longest mount prefix covering `path`, with the rest of the path.
    pub fn find<'p>(&self, path: &'p str) -> Option<(&NodeRef, &'p str)> {
        self.mounts
            .iter()
            .filter(|(prefix, _)| is_at_or_below(path, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, dir)| {
                let rest = if prefix.as_str() == "/" {
                    path
                } else {
                    &path[prefix.len()..]
                };
                (dir, rest)
            })
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.mounts.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.mounts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

/// Outcome of a path resolution.
pub struct Walk {
    /// Deepest node reached. On success, the node at the path.
    pub node: NodeRef,
    /// Directory that `node` was looked up in; `None` at the traversal root.
    pub parent: Option<NodeRef>,
    /// Components not consumed, starting with the one that failed.
    pub remaining: Vec<String>,
    pub outcome: VfsResult<()>,
}

impl Walk {
    /// The resolved node, or the resolution error.
    pub fn found(self) -> VfsResult<NodeRef> {
        self.outcome.map(|()| self.node)
    }

    /// Only the final component is missing; `node` is its would-be parent.
    pub fn missing_leaf(&self) -> bool {
        matches!(self.outcome, Err(VfsError::NotFound)) && self.remaining.len() == 1
    }
}

/// Resolves `path` from `root`, switching to a mounted directory when a
/// mount prefix covers the path. Walking through `prohibited` fails with
/// `ELOOP`.
pub fn resolve(
    root: &NodeRef,
    mounts: &MountTable,
    path: &str,
    prohibited: Option<&NodeRef>,
) -> Walk {
    let (start, rest) = match mounts.find(path) {
        Some((dir, rest)) => (dir, rest),
        None => (root, path),
    };

    let mut comps = components(rest).peekable();
    let mut node = start.clone();
    let mut parent = None;
    let mut outcome = Ok(());

    while let Some(&name) = comps.peek() {
        if prohibited.is_some_and(|p| same_node(&node, p)) {
            outcome = Err(VfsError::Loop);
            break;
        }
        if node.kind() != NodeKind::Directory {
            outcome = Err(VfsError::NotDir);
            break;
        }
        let Some(dir) = node.as_dir() else {
            outcome = Err(VfsError::NotDir);
            break;
        };
        let Some(child) = dir.lookup(name) else {
            outcome = Err(VfsError::NotFound);
            break;
        };
        parent = Some(node);
        node = child;
        comps.next();
    }

    Walk {
        node,
        parent,
        remaining: comps.map(str::to_owned).collect(),
        outcome,
    }
}
