//! FUSE bridge over the path-based driver.
//!
//! The kernel addresses nodes by inode number; [`VirtualFs`] by canonical
//! path. [`VnodeFs`] translates between the two through the
//! [`InodeTable`] and forwards every request to the driver. File handles
//! are passed through unchanged: the kernel's `fh` *is* the driver's
//! shared open handle.
//!
//! | Operation | Driver call | Notes |
//! |-----------|-------------|-------|
//! | lookup | getattr | counts one kernel lookup |
//! | forget/batch_forget | - | evicts at nlookup 0 |
//! | getattr | getattr | uses `fh` when the path is gone |
//! | setattr | truncate, utimens, chmod, chown | applied in that order |
//! | open/release | open/release | |
//! | read/write | read/write | errors read as short counts |
//! | flush/fsync | flush/fsync | |
//! | opendir/readdir/releasedir | opendir/readdir/releasedir | readdir does not count lookups |
//! | create/mknod/mkdir | create/make/mkdir | mknod only for regular files |
//! | unlink/rmdir | unlink/rmdir | inode kept until forgotten |
//! | rename | rename | flags unsupported (EINVAL) |
//! | xattrs | *xattr | size probe when `size == 0` |
//! | statfs | statfs | synthetic |

use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use crate::inode::{InodeTable, ROOT_INODE, child_path};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, trace};
use vnodefs_core::{
    FileStat, Handle, NodeKind, S_IFMT, S_IFREG, StatFs, VirtualFs, split_parent,
};

/// Converts driver attributes to the kernel's view.
pub fn to_file_attr(ino: u64, stat: &FileStat) -> FileAttr {
    let blksize = stat.blksize.max(1);
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(u64::from(blksize)),
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.crtime,
        kind: file_type(stat.kind()),
        perm: u16::try_from(stat.perm() & 0o7777).unwrap_or(0),
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize,
        flags: 0,
    }
}

pub fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
        NodeKind::Link => FileType::Symlink,
    }
}

/// Free-inode count for the statfs reply. The protocol carries one count,
/// which the kernel reports as both `f_ffree` and `f_favail`, so it must
/// not exceed what unprivileged callers may use.
pub fn free_files(st: &StatFs) -> u64 {
    st.files_free.min(st.files_available)
}

/// How to answer an xattr read of `size` bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum XattrReply<'a> {
    /// `size == 0`: the caller is probing for the buffer size.
    Size(u32),
    Data(&'a [u8]),
    /// The caller's buffer is too small (`ERANGE`).
    TooSmall,
}

pub fn xattr_reply(value: &[u8], size: u32) -> XattrReply<'_> {
    let Ok(len) = u32::try_from(value.len()) else {
        return XattrReply::TooSmall;
    };
    if size == 0 {
        XattrReply::Size(len)
    } else if len > size {
        XattrReply::TooSmall
    } else {
        XattrReply::Data(value)
    }
}

fn send_xattr(reply: ReplyXattr, value: &[u8], size: u32) {
    match xattr_reply(value, size) {
        XattrReply::Size(n) => reply.size(n),
        XattrReply::Data(data) => reply.data(data),
        XattrReply::TooSmall => reply.error(libc::ERANGE),
    }
}

fn time_of(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn reply_empty(reply: ReplyEmpty, op: &str, res: FuseResult<()>) {
    match res {
        Ok(()) => reply.ok(),
        Err(e) => {
            debug!(op, error = %e, "Request failed");
            reply.error(e.to_errno());
        }
    }
}

/// The `fuser::Filesystem` implementation.
pub struct VnodeFs {
    driver: Arc<VirtualFs>,
    inodes: InodeTable,
    config: MountConfig,
}

impl VnodeFs {
    pub fn new(driver: Arc<VirtualFs>, config: MountConfig) -> Self {
        Self {
            driver,
            inodes: InodeTable::new(),
            config,
        }
    }

    /// The driver, e.g. to graft mounts while the filesystem is live.
    pub fn driver(&self) -> &Arc<VirtualFs> {
        &self.driver
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    fn path(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path(ino).ok_or(FuseError::InvalidInode(ino))
    }

    /// Path of `ino`, or the root as a stand-in when the path is gone but
    /// `fh` still refers to a live handle (the driver prefers the handle).
    fn path_or_handle(&self, ino: u64, fh: Option<u64>) -> FuseResult<String> {
        match self.inodes.path(ino) {
            Some(path) => Ok(path),
            None if fh.is_some_and(|fh| self.driver.open_node(fh).is_ok()) => Ok("/".to_string()),
            None => Err(FuseError::InvalidInode(ino)),
        }
    }

    fn child(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name.to_str().ok_or(FuseError::InvalidName)?;
        if name.is_empty() || name.contains('/') {
            return Err(FuseError::InvalidName);
        }
        Ok(child_path(&self.path(parent)?, name))
    }

    fn attr(&self, ino: u64, path: &str, fh: Option<Handle>) -> FuseResult<FileAttr> {
        let stat = self.driver.getattr(path, fh)?;
        Ok(to_file_attr(ino, &stat))
    }

    /// Attributes of `path`, counting one kernel lookup on its inode.
    fn entry(&self, path: &str) -> FuseResult<FileAttr> {
        let stat = self.driver.getattr(path, None)?;
        let ino = self.inodes.get_or_insert(path);
        Ok(to_file_attr(ino, &stat))
    }

    fn reply_entry(&self, reply: ReplyEntry, op: &str, res: FuseResult<String>) {
        match res.and_then(|path| self.entry(&path)) {
            Ok(attr) => reply.entry(&self.config.ttl, &attr, 0),
            Err(e) => {
                debug!(op, error = %e, "Request failed");
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn set_attributes(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> FuseResult<FileAttr> {
        let path = self.path_or_handle(ino, fh)?;
        if let Some(size) = size {
            self.driver.truncate(&path, size, fh)?;
        }
        // The remaining calls are path-only; an unlinked node keeps its times.
        if self.inodes.path(ino).is_none() {
            return self.attr(ino, &path, fh);
        }
        if atime.is_some() || mtime.is_some() {
            let current = self.driver.getattr(&path, fh)?;
            self.driver.utimens(
                &path,
                atime.map_or(current.atime, time_of),
                mtime.map_or(current.mtime, time_of),
            )?;
        }
        if let Some(mode) = mode {
            self.driver.chmod(&path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.driver
                .chown(&path, uid.unwrap_or(u32::MAX), gid.unwrap_or(u32::MAX))?;
        }
        self.attr(ino, &path, fh)
    }

    /// Directory entries from `offset` on: inode, type, name.
    fn list(&self, ino: u64, fh: u64, offset: usize) -> FuseResult<Vec<(u64, FileType, String)>> {
        let path = self.path(ino)?;
        let mut names = Vec::new();
        self.driver.readdir(fh, &mut |name| {
            names.push(name.to_string());
            true
        })?;

        let mut entries = Vec::with_capacity(names.len().saturating_sub(offset));
        for name in names.into_iter().skip(offset) {
            match name.as_str() {
                "." => entries.push((ino, FileType::Directory, name)),
                ".." => {
                    let (parent, _) = split_parent(&path);
                    let parent_ino = self.inodes.get_inode(parent).unwrap_or(ROOT_INODE);
                    entries.push((parent_ino, FileType::Directory, name));
                }
                _ => {
                    let child = child_path(&path, &name);
                    // A child removed since the listing is simply skipped.
                    let Ok(stat) = self.driver.getattr(&child, None) else {
                        continue;
                    };
                    let child_ino = self.inodes.get_or_insert_no_lookup_inc(&child);
                    entries.push((child_ino, file_type(stat.kind()), name));
                }
            }
        }
        Ok(entries)
    }
}

impl Filesystem for VnodeFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        match self.driver.init() {
            Ok(fh) => {
                info!(root_handle = fh, "FUSE filesystem initialized");
                Ok(())
            }
            Err(e) => Err(e.to_errno()),
        }
    }

    fn destroy(&mut self) {
        self.driver.destroy();
        info!("FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, ?name, "lookup");
        let res = self.child(parent, name);
        self.reply_entry(reply, "lookup", res);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, ?fh, "getattr");
        match self
            .path_or_handle(ino, fh)
            .and_then(|path| self.attr(ino, &path, fh))
        {
            Ok(attr) => reply.attr(&self.config.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?mode, ?uid, ?gid, ?size, "setattr");
        match self.set_attributes(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&self.config.ttl, &attr),
            Err(e) => {
                debug!(inode = ino, error = %e, "setattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        match self
            .path(ino)
            .and_then(|path| self.driver.open(&path).map_err(FuseError::from))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        let n = self.driver.read(fh, &mut buf, offset);
        reply.data(&buf[..n]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, size = data.len(), "write");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let n = self.driver.write(fh, data, offset);
        reply.written(u32::try_from(n).unwrap_or(u32::MAX));
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        reply_empty(reply, "flush", self.driver.flush(fh).map_err(FuseError::from));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        reply_empty(reply, "release", self.driver.release(fh).map_err(FuseError::from));
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, datasync, "fsync");
        reply_empty(
            reply,
            "fsync",
            self.driver.fsync(fh, datasync).map_err(FuseError::from),
        );
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        match self
            .path(ino)
            .and_then(|path| self.driver.opendir(&path).map_err(FuseError::from))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, fh, offset, "readdir");
        let start = usize::try_from(offset).unwrap_or(0);
        match self.list(ino, fh, start) {
            Ok(entries) => {
                for (i, (entry_ino, kind, name)) in entries.iter().enumerate() {
                    let next = i64::try_from(start + i + 1).unwrap_or(i64::MAX);
                    if reply.add(*entry_ino, next, *kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "releasedir");
        reply_empty(
            reply,
            "releasedir",
            self.driver.releasedir(fh).map_err(FuseError::from),
        );
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, datasync, "fsyncdir");
        reply_empty(
            reply,
            "fsyncdir",
            self.driver.fsyncdir(fh, datasync).map_err(FuseError::from),
        );
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(inode = ino, mask, "access");
        let res = self.path(ino).and_then(|path| {
            self.driver
                .access(&path, mask.cast_unsigned())
                .map_err(FuseError::from)
        });
        reply_empty(reply, "access", res);
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.inodes.path(ino).unwrap_or_else(|| "/".to_string());
        let st = self.driver.statfs(&path);
        reply.statfs(
            st.blocks,
            st.blocks_free,
            st.blocks_available,
            st.files,
            free_files(&st),
            st.block_size,
            st.name_max,
            st.fragment_size,
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, ?name, mode, flags, "create");
        let res = self.child(parent, name).and_then(|path| {
            let fh = self.driver.create(&path, mode & !umask)?;
            match self.entry(&path) {
                Ok(attr) => Ok((attr, fh)),
                Err(e) => {
                    // Do not leak the handle the kernel will never see.
                    let _ = self.driver.release(fh);
                    Err(e)
                }
            }
        });
        match res {
            Ok((attr, fh)) => reply.created(&self.config.ttl, &attr, 0, fh, 0),
            Err(e) => {
                debug!(parent, ?name, error = %e, "create failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, mode, "mknod");
        if mode & S_IFMT != S_IFREG {
            reply.error(libc::ENOSYS);
            return;
        }
        let res = self.child(parent, name).and_then(|path| {
            self.driver.make_node(&path, mode & !umask)?;
            Ok(path)
        });
        self.reply_entry(reply, "mknod", res);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, mode, "mkdir");
        let res = self.child(parent, name).and_then(|path| {
            self.driver.mkdir(&path, mode & !umask)?;
            Ok(path)
        });
        self.reply_entry(reply, "mkdir", res);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "unlink");
        let res = self.child(parent, name).and_then(|path| {
            self.driver.unlink(&path)?;
            self.inodes.invalidate_path(&path);
            Ok(())
        });
        reply_empty(reply, "unlink", res);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "rmdir");
        let res = self.child(parent, name).and_then(|path| {
            self.driver.rmdir(&path)?;
            self.inodes.invalidate_path(&path);
            Ok(())
        });
        reply_empty(reply, "rmdir", res);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, ?name, newparent, ?newname, flags, "rename");
        let res = if flags != 0 {
            Err(FuseError::UnsupportedFlags(flags))
        } else {
            self.child(parent, name).and_then(|from| {
                let to = self.child(newparent, newname)?;
                self.driver.rename(&from, &to)?;
                self.inodes.rename(&from, &to);
                Ok(())
            })
        };
        reply_empty(reply, "rename", res);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        trace!(inode = ino, ?name, size, "getxattr");
        let res = self.path(ino).and_then(|path| {
            let name = name.to_str().ok_or(FuseError::InvalidName)?;
            Ok(self.driver.getxattr(&path, name)?)
        });
        match res {
            Ok(value) => send_xattr(reply, &value, size),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, ?name, len = value.len(), flags, "setxattr");
        let res = self.path(ino).and_then(|path| {
            let name = name.to_str().ok_or(FuseError::InvalidName)?;
            Ok(self.driver.setxattr(&path, name, value, flags)?)
        });
        reply_empty(reply, "setxattr", res);
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        trace!(inode = ino, size, "listxattr");
        let res = self.path(ino).and_then(|path| {
            let mut names = Vec::new();
            self.driver.listxattr(&path, &mut |name| {
                names.extend_from_slice(name.as_bytes());
                names.push(0);
                true
            })?;
            Ok(names)
        });
        match res {
            Ok(names) => send_xattr(reply, &names, size),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(inode = ino, ?name, "removexattr");
        let res = self.path(ino).and_then(|path| {
            let name = name.to_str().ok_or(FuseError::InvalidName)?;
            Ok(self.driver.removexattr(&path, name)?)
        });
        reply_empty(reply, "removexattr", res);
    }
}
