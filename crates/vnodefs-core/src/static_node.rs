//! Read-only node adapters.
//!
//! [`StaticDir`] serves a fixed name → node table and [`StaticFile`] a
//! fixed byte buffer. Every mutation fails with `EROFS`. Both are meant to
//! be grafted into a tree through [`VirtualFs::mount`](crate::VirtualFs::mount).

use crate::error::{VfsError, VfsResult};
use crate::node::{Dir, File, FileStat, Node, NodeKind, NodeRef};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Fixed directory.
#[derive(Default)]
pub struct StaticDir {
    entries: BTreeMap<String, NodeRef>,
}

impl StaticDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `node` under `name`, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, node: NodeRef) -> Self {
        self.entries.insert(name.into(), node);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, NodeRef)> for StaticDir {
    fn from_iter<I: IntoIterator<Item = (String, NodeRef)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Node for StaticDir {
    fn kind(&self) -> NodeKind {
        NodeKind::Directory
    }

    fn utime(&self, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn remove(&self) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn as_dir(&self) -> Option<&dyn Dir> {
        Some(self)
    }
}

impl Dir for StaticDir {
    fn lookup(&self, name: &str) -> Option<NodeRef> {
        self.entries.get(name).cloned()
    }

    fn readdir(&self, fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        for name in self.entries.keys() {
            if !fill(name) {
                break;
            }
        }
        Ok(())
    }

    fn make(&self, _name: &str, _mode: u32) -> VfsResult<NodeRef> {
        Err(VfsError::ReadOnly)
    }

    fn rename(&self, _node: &NodeRef, _new_name: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }
}

/// Fixed file content.
pub struct StaticFile {
    data: Vec<u8>,
}

impl StaticFile {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

impl Node for StaticFile {
    fn kind(&self) -> NodeKind {
        NodeKind::File
    }

    fn getattr(&self) -> VfsResult<FileStat> {
        let mut stat = FileStat::new(NodeKind::File).with_size(self.data.len() as u64);
        stat.mode &= !0o222;
        Ok(stat)
    }

    fn utime(&self, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn remove(&self) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn as_file(&self) -> Option<&dyn File> {
        Some(self)
    }
}

impl File for StaticFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::ReadOnly)
    }

    fn truncate(&self, _size: u64) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::S_IFREG;
    use std::sync::Arc;

    fn sample() -> StaticDir {
        StaticDir::new()
            .with("b.txt", Arc::new(StaticFile::new("bravo")))
            .with("a.txt", Arc::new(StaticFile::new("alpha")))
    }

    #[test]
    fn test_lookup_and_readdir() {
        let dir = sample();
        assert!(dir.lookup("a.txt").is_some());
        assert!(dir.lookup("c.txt").is_none());

        let mut names = Vec::new();
        dir.readdir(&mut |n| {
            names.push(n.to_string());
            true
        })
        .unwrap();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_readdir_stops() {
        let dir = sample();
        let mut count = 0;
        dir.readdir(&mut |_| {
            count += 1;
            false
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_read() {
        let file = StaticFile::new("hello");
        let mut buf = [0u8; 3];
        assert_eq!(file.read_at(&mut buf, 1).unwrap(), 3);
        assert_eq!(&buf, b"ell");
        assert_eq!(file.read_at(&mut buf, 5).unwrap(), 0);
        assert_eq!(file.getattr().unwrap().size, 5);
        assert_eq!(file.getattr().unwrap().perm(), 0o444);
    }

    #[test]
    fn test_mutations_are_read_only() {
        let dir = sample();
        let file = StaticFile::new("x");
        let now = SystemTime::now();

        assert!(matches!(dir.make("n", S_IFREG), Err(VfsError::ReadOnly)));
        assert!(matches!(dir.remove(), Err(VfsError::ReadOnly)));
        assert!(matches!(dir.utime(now, now), Err(VfsError::ReadOnly)));
        let node = dir.lookup("a.txt").unwrap();
        assert!(matches!(dir.rename(&node, "z"), Err(VfsError::ReadOnly)));

        assert!(matches!(file.write_at(b"y", 0), Err(VfsError::ReadOnly)));
        assert!(matches!(file.truncate(0), Err(VfsError::ReadOnly)));
        assert!(matches!(file.remove(), Err(VfsError::ReadOnly)));
    }
}
