//! Inode management for the FUSE frontend.
//!
//! The kernel speaks inode numbers; the driver speaks canonical paths.
//! [`InodeTable`] keeps the bidirectional mapping plus the kernel's
//! `nlookup` count per inode, so an inode is only evicted once the kernel
//! has forgotten every reference it was handed.

use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Canonical driver path. `None` once the path was unlinked; the inode
    /// stays valid until the kernel forgets it.
    pub path: Option<String>,
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: String, nlookup: u64) -> Self {
        Self {
            path: Some(path),
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count by `count`. Returns `None` on underflow,
    /// leaving the count unchanged.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        self.nlookup
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(count))
            .ok()
            .map(|old| old - count)
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe inode ↔ path table.
#[derive(Debug)]
pub struct InodeTable {
    entries: DashMap<u64, InodeEntry>,
    paths: DashMap<String, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Creates a table with the root inode pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            entries: DashMap::new(),
            paths: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        table
            .entries
            .insert(ROOT_INODE, InodeEntry::new("/".to_string(), 1));
        table.paths.insert("/".to_string(), ROOT_INODE);
        table
    }

    /// Returns the inode for `path`, allocating one if needed, and counts
    /// one kernel lookup against it.
    pub fn get_or_insert(&self, path: &str) -> u64 {
        self.insert_with(path, 1)
    }

    /// Like [`get_or_insert`](Self::get_or_insert) but without touching the
    /// lookup count. Used for `readdir` entries, which the kernel does not
    /// count.
    pub fn get_or_insert_no_lookup_inc(&self, path: &str) -> u64 {
        self.insert_with(path, 0)
    }

    fn insert_with(&self, path: &str, lookups: u64) -> u64 {
        if let Some(inode) = self.paths.get(path).map(|r| *r)
            && let Some(entry) = self.entries.get(&inode)
        {
            if lookups > 0 {
                entry.inc_nlookup();
            }
            return inode;
        }
        let inode = *self.paths.entry(path.to_string()).or_insert_with(|| {
            let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
            self.entries
                .insert(inode, InodeEntry::new(path.to_string(), 0));
            inode
        });
        if lookups > 0
            && let Some(entry) = self.entries.get(&inode)
        {
            entry.inc_nlookup();
        }
        inode
    }

    pub fn get(&self, inode: u64) -> Option<Ref<'_, u64, InodeEntry>> {
        self.entries.get(&inode)
    }

    /// Current path of `inode`, if it is known and still linked.
    pub fn path(&self, inode: u64) -> Option<String> {
        self.entries.get(&inode).and_then(|e| e.path.clone())
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.paths.get(path).map(|r| *r)
    }

    /// Drops `nlookup` kernel references. Returns `true` if the inode was
    /// evicted. The root is never evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        let remaining = match self.entries.get(&inode) {
            Some(entry) => entry.dec_nlookup(nlookup),
            None => return false,
        };
        if remaining != Some(0) {
            return false;
        }
        match self.entries.remove(&inode) {
            Some((_, entry)) => {
                if let Some(path) = entry.path {
                    self.paths.remove_if(&path, |_, &i| i == inode);
                }
                true
            }
            None => false,
        }
    }

    /// Unmaps `path` after it was removed. The inode entry stays until the
    /// kernel forgets it.
    pub fn invalidate_path(&self, path: &str) {
        if let Some((_, inode)) = self.paths.remove(path)
            && let Some(mut entry) = self.entries.get_mut(&inode)
        {
            entry.path = None;
        }
    }

    /// Re-keys every inode at or below `from` to the same place below `to`.
    /// An inode previously mapped at `to` is invalidated first.
    pub fn rename(&self, from: &str, to: &str) {
        self.invalidate_path(to);
        // Collect first: removing while iterating would deadlock on the shard.
        let moved: Vec<(String, String, u64)> = self
            .paths
            .iter()
            .filter_map(|r| rebase(r.key(), from, to).map(|p| (r.key().clone(), p, *r.value())))
            .collect();
        for (old, new, inode) in moved {
            self.paths.remove(&old);
            if let Some(mut entry) = self.entries.get_mut(&inode) {
                entry.path = Some(new.clone());
            }
            self.paths.insert(new, inode);
        }
    }

    /// Number of inodes, root included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if only the root is left.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `path` moved from below `from` to below `to`, or `None` if it is not at
/// or below `from`.
fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    let rest = path.strip_prefix(from)?;
    if rest.is_empty() {
        Some(to.to_string())
    } else if rest.starts_with('/') {
        Some(format!("{to}{rest}"))
    } else {
        None
    }
}

/// Joins a canonical parent path and a child name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
