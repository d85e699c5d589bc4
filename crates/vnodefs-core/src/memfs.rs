//! Mutable in-memory node tree.
//!
//! [`MemDir`] keeps its children in a name-ordered table and a weak
//! back-reference to its parent, so `remove` and `rename` can unlink a node
//! without the driver knowing where it lives. [`MemFile`] stores its bytes
//! in a [`DynamicPagedFile`] over [`MemPages`]; all file I/O goes through
//! the page cache.

use crate::error::{VfsError, VfsResult};
use crate::node::{
    DEFAULT_DIR_PERM, DEFAULT_FILE_PERM, Dir, File, FileStat, Node, NodeKind, NodeRef, S_IFMT,
};
use crate::paged::{DynamicPagedFile, MemPages};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// Page size of files created without an explicit one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Name, location and attributes shared by both node kinds.
#[derive(Debug)]
struct MemMeta {
    name: String,
    parent: Weak<MemDir>,
    /// Permission bits fixed at creation.
    perm: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    crtime: SystemTime,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl MemMeta {
    fn new(name: &str, parent: Weak<MemDir>, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.to_owned(),
            parent,
            perm,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            xattrs: BTreeMap::new(),
        }
    }

    fn stat(&self, kind: NodeKind) -> FileStat {
        let mut stat = FileStat::new(kind);
        stat.mode = kind.type_bits() | self.perm;
        stat.atime = self.atime;
        stat.mtime = self.mtime;
        stat.ctime = self.ctime;
        stat.crtime = self.crtime;
        stat
    }

    /// Permission bits requested by `mode`, or the defaults for `kind` when
    /// it carries only type bits.
    fn perm_of(mode: u32, kind: NodeKind) -> u32 {
        match mode & !S_IFMT {
            0 if kind == NodeKind::Directory => DEFAULT_DIR_PERM,
            0 => DEFAULT_FILE_PERM,
            perm => perm,
        }
    }

    fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }

    fn listxattr(&self, fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        for name in self.xattrs.keys() {
            if !fill(name) {
                return Err(VfsError::Range);
            }
        }
        Ok(())
    }

    fn setxattr(&mut self, name: &str, value: &[u8], flags: i32) -> VfsResult<()> {
        let exists = self.xattrs.contains_key(name);
        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(VfsError::Exists);
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(VfsError::NoAttr);
        }
        self.xattrs.insert(name.to_owned(), value.to_vec());
        self.ctime = SystemTime::now();
        Ok(())
    }

    fn getxattr(&self, name: &str) -> VfsResult<Vec<u8>> {
        self.xattrs.get(name).cloned().ok_or(VfsError::NoAttr)
    }

    fn removexattr(&mut self, name: &str) -> VfsResult<()> {
        self.xattrs.remove(name).map(|_| ()).ok_or(VfsError::NoAttr)
    }
}

/// Removes the child called `name` from `parent` if it is `node`.
fn unlink_from(parent: &Weak<MemDir>, name: &str, node: *const ()) {
    if let Some(parent) = parent.upgrade() {
        let mut children = parent.children.lock();
        if children
            .get(name)
            .is_some_and(|c| std::ptr::addr_eq(Arc::as_ptr(c), node))
        {
            children.remove(name);
            drop(children);
            parent.meta.lock().touch();
        }
    }
}

/// In-memory directory.
pub struct MemDir {
    this: Weak<MemDir>,
    meta: Mutex<MemMeta>,
    children: Mutex<BTreeMap<String, NodeRef>>,
    page_size: usize,
}

impl std::fmt::Debug for MemDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDir")
            .field("name", &self.meta.lock().name)
            .field("children", &self.children.lock().len())
            .finish()
    }
}

impl MemDir {
    /// Empty root directory with the default file page size.
    pub fn new_root() -> NodeRef {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Empty root directory whose files use `page_size` byte pages.
    pub fn with_page_size(page_size: usize) -> NodeRef {
        Self::create("", Weak::new(), DEFAULT_DIR_PERM, page_size)
    }

    fn create(name: &str, parent: Weak<MemDir>, perm: u32, page_size: usize) -> Arc<MemDir> {
        Arc::new_cyclic(|this| MemDir {
            this: this.clone(),
            meta: Mutex::new(MemMeta::new(name, parent, perm)),
            children: Mutex::new(BTreeMap::new()),
            page_size,
        })
    }

    pub fn name(&self) -> String {
        self.meta.lock().name.clone()
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }

    /// Inserts an existing node (of any implementation) under `name`.
    /// Foreign nodes cannot be moved or removed through this directory later.
    pub fn insert(&self, name: &str, node: NodeRef) -> VfsResult<()> {
        let mut children = self.children.lock();
        if children.contains_key(name) {
            return Err(VfsError::Exists);
        }
        children.insert(name.to_owned(), node);
        Ok(())
    }
}

impl Node for MemDir {
    fn kind(&self) -> NodeKind {
        NodeKind::Directory
    }

    fn getattr(&self) -> VfsResult<FileStat> {
        let mut stat = self.meta.lock().stat(NodeKind::Directory);
        let subdirs = self
            .children
            .lock()
            .values()
            .filter(|c| c.kind() == NodeKind::Directory)
            .count();
        stat.nlink = 2 + u32::try_from(subdirs).unwrap_or(u32::MAX - 2);
        Ok(stat)
    }

    fn listxattr(&self, fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        self.meta.lock().listxattr(fill)
    }

    fn setxattr(&self, name: &str, value: &[u8], flags: i32) -> VfsResult<()> {
        self.meta.lock().setxattr(name, value, flags)
    }

    fn getxattr(&self, name: &str) -> VfsResult<Vec<u8>> {
        self.meta.lock().getxattr(name)
    }

    fn removexattr(&self, name: &str) -> VfsResult<()> {
        self.meta.lock().removexattr(name)
    }

    fn utime(&self, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let mut meta = self.meta.lock();
        meta.atime = atime;
        meta.mtime = mtime;
        Ok(())
    }

    fn remove(&self) -> VfsResult<()> {
        if !self.children.lock().is_empty() {
            return Err(VfsError::NotEmpty);
        }
        let (parent, name) = {
            let meta = self.meta.lock();
            (meta.parent.clone(), meta.name.clone())
        };
        if parent.upgrade().is_none() {
            return Err(VfsError::Busy);
        }
        unlink_from(&parent, &name, std::ptr::from_ref(self).cast());
        self.meta.lock().parent = Weak::new();
        Ok(())
    }

    fn data_sync(&self) {
        let children: Vec<NodeRef> = self.children.lock().values().cloned().collect();
        for child in children {
            child.sync();
        }
    }

    fn as_dir(&self) -> Option<&dyn Dir> {
        Some(self)
    }
}

impl Dir for MemDir {
    fn lookup(&self, name: &str) -> Option<NodeRef> {
        self.children.lock().get(name).cloned()
    }

    fn readdir(&self, fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        let names: Vec<String> = self.children.lock().keys().cloned().collect();
        for name in names {
            if !fill(&name) {
                break;
            }
        }
        self.meta.lock().atime = SystemTime::now();
        Ok(())
    }

    fn make(&self, name: &str, mode: u32) -> VfsResult<NodeRef> {
        if name.is_empty() || name.contains('/') {
            return Err(VfsError::Invalid);
        }
        let mut children = self.children.lock();
        if children.contains_key(name) {
            return Err(VfsError::Exists);
        }
        let kind = NodeKind::from_mode(mode);
        let perm = MemMeta::perm_of(mode, kind);
        let parent = self.this.clone();
        let node: NodeRef = match kind {
            NodeKind::Directory => MemDir::create(name, parent, perm, self.page_size),
            NodeKind::File => Arc::new(MemFile::create(name, parent, perm, self.page_size)?),
            NodeKind::Link => return Err(VfsError::NotImplemented),
        };
        children.insert(name.to_owned(), node.clone());
        drop(children);
        self.meta.lock().touch();
        Ok(node)
    }

    fn rename(&self, node: &NodeRef, new_name: &str) -> VfsResult<()> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(VfsError::Invalid);
        }
        let any: &dyn Any = &**node;
        let meta = if let Some(dir) = any.downcast_ref::<MemDir>() {
            &dir.meta
        } else if let Some(file) = any.downcast_ref::<MemFile>() {
            &file.meta
        } else {
            return Err(VfsError::CrossDevice);
        };

        let (old_parent, old_name) = {
            let meta = meta.lock();
            (meta.parent.clone(), meta.name.clone())
        };
        unlink_from(&old_parent, &old_name, Arc::as_ptr(node).cast());

        self.children.lock().insert(new_name.to_owned(), node.clone());
        self.meta.lock().touch();

        let mut meta = meta.lock();
        meta.name = new_name.to_owned();
        meta.parent = self.this.clone();
        meta.ctime = SystemTime::now();
        Ok(())
    }
}

/// In-memory regular file.
pub struct MemFile {
    meta: Mutex<MemMeta>,
    content: DynamicPagedFile<MemPages>,
}

impl std::fmt::Debug for MemFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFile")
            .field("name", &self.meta.lock().name)
            .field("cached_page", &self.content.cached_page())
            .finish()
    }
}

impl MemFile {
    fn create(name: &str, parent: Weak<MemDir>, perm: u32, page_size: usize) -> VfsResult<Self> {
        Ok(Self {
            meta: Mutex::new(MemMeta::new(name, parent, perm)),
            content: DynamicPagedFile::new(MemPages::new(page_size))?,
        })
    }

    /// Detached file holding `data`, for insertion into any directory.
    pub fn with_content(data: Vec<u8>, page_size: usize) -> VfsResult<Self> {
        Ok(Self {
            meta: Mutex::new(MemMeta::new("", Weak::new(), DEFAULT_FILE_PERM)),
            content: DynamicPagedFile::new(MemPages::with_content(data, page_size))?,
        })
    }

    pub fn name(&self) -> String {
        self.meta.lock().name.clone()
    }

    /// The page cache in front of the content.
    pub fn content(&self) -> &DynamicPagedFile<MemPages> {
        &self.content
    }
}

impl Node for MemFile {
    fn kind(&self) -> NodeKind {
        NodeKind::File
    }

    fn getattr(&self) -> VfsResult<FileStat> {
        let size = self.content.size()?;
        Ok(self.meta.lock().stat(NodeKind::File).with_size(size))
    }

    fn listxattr(&self, fill: &mut dyn FnMut(&str) -> bool) -> VfsResult<()> {
        self.meta.lock().listxattr(fill)
    }

    fn setxattr(&self, name: &str, value: &[u8], flags: i32) -> VfsResult<()> {
        self.meta.lock().setxattr(name, value, flags)
    }

    fn getxattr(&self, name: &str) -> VfsResult<Vec<u8>> {
        self.meta.lock().getxattr(name)
    }

    fn removexattr(&self, name: &str) -> VfsResult<()> {
        self.meta.lock().removexattr(name)
    }

    fn utime(&self, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let mut meta = self.meta.lock();
        meta.atime = atime;
        meta.mtime = mtime;
        Ok(())
    }

    fn remove(&self) -> VfsResult<()> {
        let (parent, name) = {
            let meta = self.meta.lock();
            (meta.parent.clone(), meta.name.clone())
        };
        unlink_from(&parent, &name, std::ptr::from_ref(self).cast());
        self.meta.lock().parent = Weak::new();
        Ok(())
    }

    fn data_sync(&self) {
        self.content.data_sync();
    }

    fn as_file(&self) -> Option<&dyn File> {
        Some(self)
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let n = self.content.read_at(buf, offset)?;
        self.meta.lock().atime = SystemTime::now();
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let n = self.content.write_at(buf, offset)?;
        self.meta.lock().touch();
        Ok(n)
    }

    fn close(&self) -> VfsResult<()> {
        self.content.close()
    }

    fn truncate(&self, size: u64) -> VfsResult<()> {
        self.content.truncate(size)?;
        self.meta.lock().touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{S_IFDIR, S_IFREG, same_node};

    fn names(dir: &dyn Dir) -> Vec<String> {
        let mut out = Vec::new();
        dir.readdir(&mut |n| {
            out.push(n.to_string());
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn test_make_and_lookup() {
        let root = MemDir::new_root();
        let dir = root.as_dir().unwrap();
        let f = dir.make("f", S_IFREG | 0o644).unwrap();
        let d = dir.make("d", S_IFDIR | 0o755).unwrap();
        assert_eq!(f.kind(), NodeKind::File);
        assert_eq!(d.kind(), NodeKind::Directory);
        assert!(same_node(&dir.lookup("f").unwrap(), &f));
        assert_eq!(names(dir), vec!["d", "f"]);
        assert_eq!(root.getattr().unwrap().nlink, 3);
    }

    #[test]
    fn test_make_keeps_requested_permissions() {
        let root = MemDir::new_root();
        let dir = root.as_dir().unwrap();
        let d = dir.make("private", S_IFDIR | 0o700).unwrap();
        let f = dir.make("script", S_IFREG | 0o750).unwrap();
        let plain = dir.make("plain", S_IFREG).unwrap();
        assert_eq!(d.getattr().unwrap().mode, S_IFDIR | 0o700);
        assert_eq!(f.getattr().unwrap().mode, S_IFREG | 0o750);
        assert_eq!(plain.getattr().unwrap().perm(), 0o644);
        assert_eq!(root.getattr().unwrap().perm(), 0o755);
    }

    #[test]
    fn test_make_existing_fails() {
        let root = MemDir::new_root();
        let dir = root.as_dir().unwrap();
        dir.make("x", S_IFREG).unwrap();
        assert!(matches!(dir.make("x", S_IFDIR), Err(VfsError::Exists)));
        assert!(matches!(dir.make("", S_IFREG), Err(VfsError::Invalid)));
    }

    #[test]
    fn test_remove_nonempty_dir() {
        let root = MemDir::new_root();
        let d = root.as_dir().unwrap().make("d", S_IFDIR).unwrap();
        d.as_dir().unwrap().make("f", S_IFREG).unwrap();
        assert!(matches!(d.remove(), Err(VfsError::NotEmpty)));

        let f = d.as_dir().unwrap().lookup("f").unwrap();
        f.remove().unwrap();
        d.remove().unwrap();
        assert!(root.as_dir().unwrap().lookup("d").is_none());
    }

    #[test]
    fn test_remove_root_is_busy() {
        let root = MemDir::new_root();
        assert!(matches!(root.remove(), Err(VfsError::Busy)));
    }

    #[test]
    fn test_file_io_through_page_cache() {
        let root = MemDir::with_page_size(4);
        let f = root.as_dir().unwrap().make("f", S_IFREG).unwrap();
        let file = f.as_file().unwrap();
        assert_eq!(file.write_at(b"hello world", 0).unwrap(), 11);
        let mut buf = [0u8; 11];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(f.getattr().unwrap().size, 11);

        file.truncate(5).unwrap();
        assert_eq!(f.getattr().unwrap().size, 5);
    }

    #[test]
    fn test_rename_within_dir() {
        let root = MemDir::new_root();
        let dir = root.as_dir().unwrap();
        let f = dir.make("a", S_IFREG).unwrap();
        dir.rename(&f, "b").unwrap();
        assert!(dir.lookup("a").is_none());
        assert!(same_node(&dir.lookup("b").unwrap(), &f));
    }

    #[test]
    fn test_rename_across_dirs() {
        let root = MemDir::new_root();
        let src = root.as_dir().unwrap().make("src", S_IFDIR).unwrap();
        let dst = root.as_dir().unwrap().make("dst", S_IFDIR).unwrap();
        let f = src.as_dir().unwrap().make("f", S_IFREG).unwrap();

        dst.as_dir().unwrap().rename(&f, "g").unwrap();
        assert!(src.as_dir().unwrap().lookup("f").is_none());
        assert!(same_node(&dst.as_dir().unwrap().lookup("g").unwrap(), &f));

        // Removal now unlinks from the new parent.
        f.remove().unwrap();
        assert!(dst.as_dir().unwrap().lookup("g").is_none());
    }

    #[test]
    fn test_rename_foreign_node_is_cross_device() {
        struct Foreign;
        impl Node for Foreign {
            fn kind(&self) -> NodeKind {
                NodeKind::File
            }
        }
        let root = MemDir::new_root();
        let foreign: NodeRef = Arc::new(Foreign);
        assert!(matches!(
            root.as_dir().unwrap().rename(&foreign, "x"),
            Err(VfsError::CrossDevice)
        ));
    }

    #[test]
    fn test_xattrs() {
        let root = MemDir::new_root();
        let f = root.as_dir().unwrap().make("f", S_IFREG).unwrap();
        f.setxattr("user.a", b"1", 0).unwrap();
        f.setxattr("user.b", b"2", 0).unwrap();
        assert_eq!(f.getxattr("user.a").unwrap(), b"1");
        assert!(matches!(
            f.setxattr("user.a", b"x", libc::XATTR_CREATE),
            Err(VfsError::Exists)
        ));
        assert!(matches!(
            f.setxattr("user.c", b"x", libc::XATTR_REPLACE),
            Err(VfsError::NoAttr)
        ));

        let mut seen = Vec::new();
        f.listxattr(&mut |n| {
            seen.push(n.to_string());
            true
        })
        .unwrap();
        assert_eq!(seen, vec!["user.a", "user.b"]);

        let res = f.listxattr(&mut |_| false);
        assert!(matches!(res, Err(VfsError::Range)));

        f.removexattr("user.a").unwrap();
        assert!(matches!(f.getxattr("user.a"), Err(VfsError::NoAttr)));
    }

    #[test]
    fn test_utime() {
        let root = MemDir::new_root();
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        root.utime(t, t).unwrap();
        let stat = root.getattr().unwrap();
        assert_eq!(stat.atime, t);
        assert_eq!(stat.mtime, t);
    }
}
