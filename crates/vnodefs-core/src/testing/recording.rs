//! A [`PagedFile`] that records every page operation.

use crate::paged::{MemPages, PagedFile};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One call observed by [`RecordingPages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOp {
    Read(u64),
    /// Page number and byte count handed to the store.
    Write(u64, usize),
    SetLen(u64),
    Close,
}

/// Shared view of the operations a [`RecordingPages`] saw, plus failure
/// switches. Clones observe the same store.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    ops: Arc<Mutex<Vec<PageOp>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    content: Arc<Mutex<Vec<u8>>>,
}

impl OpLog {
    /// Drains and returns the operations seen so far.
    pub fn take(&self) -> Vec<PageOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Operations seen so far, without draining.
    pub fn ops(&self) -> Vec<PageOp> {
        self.ops.lock().clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Bytes the store currently holds (what has been written back).
    pub fn content(&self) -> Vec<u8> {
        self.content.lock().clone()
    }

    fn push(&self, op: PageOp) {
        self.ops.lock().push(op);
    }
}

/// In-memory page store that logs to an [`OpLog`].
#[derive(Debug)]
pub struct RecordingPages {
    inner: MemPages,
    log: OpLog,
}

impl RecordingPages {
    /// Store holding `content`, and the log observing it.
    pub fn new(content: Vec<u8>, page_size: usize) -> (Self, OpLog) {
        let log = OpLog::default();
        *log.content.lock() = content.clone();
        let pages = Self {
            inner: MemPages::with_content(content, page_size),
            log: log.clone(),
        };
        (pages, log)
    }

    fn sync_content(&self) {
        *self.log.content.lock() = self.inner.content().to_vec();
    }
}

impl PagedFile for RecordingPages {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn max_size(&self) -> u64 {
        self.inner.max_size()
    }

    fn read_page(&mut self, buf: &mut [u8], page: u64) -> io::Result<usize> {
        self.log.push(PageOp::Read(page));
        if self.log.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected read failure"));
        }
        self.inner.read_page(buf, page)
    }

    fn write_page(&mut self, buf: &[u8], page: u64) -> io::Result<usize> {
        self.log.push(PageOp::Write(page, buf.len()));
        if self.log.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        let n = self.inner.write_page(buf, page)?;
        self.sync_content();
        Ok(n)
    }

    fn set_len(&mut self, size: u64) -> io::Result<()> {
        self.log.push(PageOp::SetLen(size));
        self.inner.set_len(size)?;
        self.sync_content();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.log.push(PageOp::Close);
        Ok(())
    }
}
