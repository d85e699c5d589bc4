//! Single-page read/write cache over page-addressable storage.
//!
//! [`DynamicPagedFile`] turns any [`PagedFile`] into a [`File`] node. It
//! keeps exactly one page in memory:
//!
//! 1. A request for the cached page number reuses it (sequential access
//!    within a page costs no backing I/O).
//! 2. A request for a different page writes the cached page back first if
//!    it is dirty, then loads the requested one. Write-back happens on
//!    eviction, never per write.
//! 3. `close`, `data_sync`, `truncate` and a change of the backing size
//!    flush the page as well.
//!
//! # Locking
//!
//! The adapter lock covers only the swap decision. While a caller copies
//! bytes, the page buffer is *loaned* out of the slot and the slot records
//! [`PageState::LockedClean`] / [`PageState::LockedDirty`]. Another caller
//! waits on a condition variable until the loan comes back. Flushing a page
//! that is out on loan is a lock-discipline bug and aborts with a panic.

use crate::error::{VfsError, VfsResult};
use crate::node::{File, FileStat, Node, NodeKind};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use tracing::{trace, warn};

/// Largest size any store may report; protocol offsets are signed.
pub const MAX_FILE_SIZE: u64 = i64::MAX.unsigned_abs();

/// Default growth limit of [`MemPages`].
pub const MEM_PAGES_MAX_SIZE: u64 = 1 << 32;

/// Page-addressable backing storage.
pub trait PagedFile: Send {
    /// Current size in bytes.
    fn size(&self) -> u64;

    /// Fixed page size in bytes. Must not change over the lifetime.
    fn page_size(&self) -> usize;

    /// Reads page `page` into `buf` (at most one page). A short count means
    /// the page exists but ends early; `UnexpectedEof` is treated the same.
    fn read_page(&mut self, buf: &mut [u8], page: u64) -> io::Result<usize>;

    /// Writes `buf` (at most one page) at the start of page `page`.
    fn write_page(&mut self, buf: &[u8], page: u64) -> io::Result<usize>;

    /// Largest size the store can reach. A store that cannot grow reports
    /// its current size.
    fn max_size(&self) -> u64 {
        MAX_FILE_SIZE
    }

    /// Resizes the storage. Optional.
    fn set_len(&mut self, _size: u64) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Flushes and releases whatever the store holds open.
    fn close(&mut self) -> io::Result<()>;
}

/// A cached page buffer.
#[derive(Debug)]
struct Page {
    number: u64,
    buf: Box<[u8]>,
    /// Bytes of `buf` holding valid data.
    used: usize,
}

impl Page {
    fn new(number: u64, page_size: usize) -> Self {
        Self {
            number,
            buf: vec![0u8; page_size].into_boxed_slice(),
            used: 0,
        }
    }

    fn read_at(&self, dst: &mut [u8], offset: usize) -> usize {
        if offset >= self.used {
            return 0;
        }
        let n = dst.len().min(self.used - offset);
        dst[..n].copy_from_slice(&self.buf[offset..offset + n]);
        n
    }

    fn write_at(&mut self, src: &[u8], offset: usize) -> usize {
        if offset >= self.buf.len() {
            return 0;
        }
        let n = src.len().min(self.buf.len() - offset);
        self.buf[offset..offset + n].copy_from_slice(&src[..n]);
        self.used = self.used.max(offset + n);
        n
    }
}

/// State of the single cache slot.
#[derive(Debug)]
enum PageState {
    Empty,
    Clean(Page),
    Dirty(Page),
    /// Loaned to a caller, no unflushed writes. Holds the page number.
    LockedClean(u64),
    /// Loaned to a caller, with unflushed writes.
    LockedDirty(u64),
}

impl PageState {
    fn is_locked(&self) -> bool {
        matches!(self, PageState::LockedClean(_) | PageState::LockedDirty(_))
    }
}

/// A page on loan to one read or write call.
struct PageLoan {
    page: Page,
    dirty: bool,
}

struct Inner<P> {
    pf: P,
    page: PageState,
    last_page: u64,
    last_page_size: u64,
}

impl<P: PagedFile> Inner<P> {
    fn size(&self, page_size: u64) -> u64 {
        self.last_page * page_size + self.last_page_size
    }

    /// Writes the cached page back if it is dirty. The page stays cached.
    ///
    /// A failed write keeps the page dirty for a retry. A short write means
    /// the store has no room for the tail: the page keeps what was stored,
    /// turns clean, and the call reports `WriteZero` once.
    fn flush_page(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.page, PageState::Empty) {
            PageState::Dirty(mut page) => {
                trace!(page = page.number, used = page.used, "Writing back dirty page");
                match self.pf.write_page(&page.buf[..page.used], page.number) {
                    Ok(n) if n >= page.used => {
                        self.page = PageState::Clean(page);
                        Ok(())
                    }
                    Ok(n) => {
                        warn!(
                            page = page.number,
                            used = page.used,
                            written = n,
                            "Short page write-back, dropping the unstored tail"
                        );
                        page.used = n;
                        self.page = PageState::Clean(page);
                        Err(io::Error::from(io::ErrorKind::WriteZero))
                    }
                    Err(e) => {
                        self.page = PageState::Dirty(page);
                        Err(e)
                    }
                }
            }
            PageState::LockedDirty(number) => {
                panic!("Internal error: flushing locked page #{number}")
            }
            other => {
                self.page = other;
                Ok(())
            }
        }
    }

    /// Flushes and drops the cached page.
    fn free_page(&mut self) -> io::Result<()> {
        self.flush_page()?;
        if let PageState::LockedClean(number) = self.page {
            panic!("Internal error: evicting locked page #{number}");
        }
        self.page = PageState::Empty;
        Ok(())
    }

    /// Raises the size high-water mark to cover `end`.
    fn extend_to(&mut self, end: u64, page_size: u64) {
        if end > self.size(page_size) {
            self.last_page = end / page_size;
            self.last_page_size = end % page_size;
        }
    }
}

/// [`File`] node backed by a [`PagedFile`] through a one-page cache.
pub struct DynamicPagedFile<P> {
    inner: Mutex<Inner<P>>,
    released: Condvar,
    page_size: usize,
}

impl<P: PagedFile> std::fmt::Debug for DynamicPagedFile<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPagedFile")
            .field("page_size", &self.page_size)
            .field("cached_page", &self.cached_page())
            .finish_non_exhaustive()
    }
}

impl<P: PagedFile> DynamicPagedFile<P> {
    /// Wraps `pf`, probing page 0 so an unreadable store fails here.
    pub fn new(pf: P) -> VfsResult<Self> {
        let page_size = pf.page_size();
        if page_size == 0 {
            return Err(VfsError::Invalid);
        }
        let size = pf.size();
        let ps = page_size as u64;
        let file = Self {
            inner: Mutex::new(Inner {
                pf,
                page: PageState::Empty,
                last_page: size / ps,
                last_page_size: size % ps,
            }),
            released: Condvar::new(),
            page_size,
        };
        let probe = file.lock_page(0)?;
        file.unlock_page(probe, None);
        Ok(file)
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current size, re-read from the backing store.
    ///
    /// If the backing size no longer matches the cached high-water mark the
    /// cached page is flushed and dropped, since it may describe a stale
    /// region.
    pub fn size(&self) -> VfsResult<u64> {
        let mut inner = self.inner.lock();
        self.refresh_size(&mut inner)?;
        Ok(inner.size(self.page_size as u64))
    }

    /// Number and dirtiness of the cached page, if any.
    pub fn cached_page(&self) -> Option<(u64, bool)> {
        match &self.inner.lock().page {
            PageState::Empty => None,
            PageState::Clean(p) => Some((p.number, false)),
            PageState::Dirty(p) => Some((p.number, true)),
            PageState::LockedClean(n) => Some((*n, false)),
            PageState::LockedDirty(n) => Some((*n, true)),
        }
    }

    /// Writes the cached page back without evicting it.
    pub fn flush(&self) -> VfsResult<()> {
        let mut inner = self.inner.lock();
        self.wait_unlocked(&mut inner);
        inner.flush_page()?;
        Ok(())
    }

    fn wait_unlocked(&self, inner: &mut MutexGuard<'_, Inner<P>>) {
        while inner.page.is_locked() {
            self.released.wait(inner);
        }
    }

    fn refresh_size(&self, inner: &mut MutexGuard<'_, Inner<P>>) -> VfsResult<()> {
        let ps = self.page_size as u64;
        let size = inner.pf.size();
        if (size / ps, size % ps) == (inner.last_page, inner.last_page_size) {
            return Ok(());
        }
        self.wait_unlocked(inner);
        inner.free_page()?;
        // The write-back may itself have grown the store.
        let size = inner.pf.size();
        inner.last_page = size / ps;
        inner.last_page_size = size % ps;
        Ok(())
    }

    /// Loans page `number` to the caller, loading it if necessary.
    fn lock_page(&self, number: u64) -> VfsResult<PageLoan> {
        let mut inner = self.inner.lock();
        self.wait_unlocked(&mut inner);

        match std::mem::replace(&mut inner.page, PageState::Empty) {
            PageState::Clean(page) if page.number == number => {
                inner.page = PageState::LockedClean(number);
                return Ok(PageLoan { page, dirty: false });
            }
            PageState::Dirty(page) if page.number == number => {
                inner.page = PageState::LockedDirty(number);
                return Ok(PageLoan { page, dirty: true });
            }
            other => inner.page = other,
        }

        inner.free_page()?;

        let mut page = Page::new(number, self.page_size);
        page.used = match inner.pf.read_page(&mut page.buf, number) {
            Ok(n) => n.min(self.page_size),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e.into()),
        };
        trace!(page = number, used = page.used, "Loaded page");
        inner.page = PageState::LockedClean(number);
        Ok(PageLoan { page, dirty: false })
    }

    /// Returns a loaned page to the slot. `end` raises the size high-water mark.
    fn unlock_page(&self, loan: PageLoan, end: Option<u64>) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.page.is_locked(), "unlocking a page that is not on loan");
        inner.page = if loan.dirty {
            PageState::Dirty(loan.page)
        } else {
            PageState::Clean(loan.page)
        };
        if let Some(end) = end {
            inner.extend_to(end, self.page_size as u64);
        }
        drop(inner);
        self.released.notify_all();
    }

    /// Copies bytes starting at `offset` into `buf`, page by page.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let ps = self.page_size as u64;
        let size = self.size()?;
        if offset >= size {
            return Ok(0);
        }

        let mut done = 0;
        let mut offset = offset;
        while done < buf.len() {
            let loan = self.lock_page(offset / ps)?;
            #[allow(clippy::cast_possible_truncation)]
            let n = loan.page.read_at(&mut buf[done..], (offset % ps) as usize);
            self.unlock_page(loan, None);
            if n == 0 {
                break;
            }
            offset += n as u64;
            done += n;
        }
        Ok(done)
    }

    /// Copies `buf` into the cache starting at `offset`, marking pages dirty.
    ///
    /// Bytes that would land past the store's [`max_size`](PagedFile::max_size)
    /// are not taken, so the count comes back short. A non-empty write that
    /// starts at or past the limit fails with `EFBIG` and dirties nothing.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let max = self.inner.lock().pf.max_size();
        if offset >= max {
            return Err(VfsError::FileTooLarge);
        }
        let room = usize::try_from(max - offset).unwrap_or(usize::MAX);
        let buf = &buf[..buf.len().min(room)];

        let ps = self.page_size as u64;
        let mut done = 0;
        let mut offset = offset;
        while done < buf.len() {
            let number = offset / ps;
            let mut loan = self.lock_page(number)?;
            #[allow(clippy::cast_possible_truncation)]
            let n = loan.page.write_at(&buf[done..], (offset % ps) as usize);
            loan.dirty |= n > 0;
            let end = number * ps + loan.page.used as u64;
            self.unlock_page(loan, Some(end));
            if n == 0 {
                break;
            }
            offset += n as u64;
            done += n;
        }
        Ok(done)
    }

    /// Flushes, then resizes the backing store.
    pub fn truncate(&self, size: u64) -> VfsResult<()> {
        let ps = self.page_size as u64;
        let mut inner = self.inner.lock();
        self.wait_unlocked(&mut inner);
        inner.free_page()?;
        inner.pf.set_len(size)?;
        let size = inner.pf.size();
        inner.last_page = size / ps;
        inner.last_page_size = size % ps;
        Ok(())
    }

    /// Flushes and drops the cached page, then closes the backing store.
    /// A second close finds no page and only repeats the store close.
    pub fn close(&self) -> VfsResult<()> {
        let mut inner = self.inner.lock();
        self.wait_unlocked(&mut inner);
        inner.free_page()?;
        inner.pf.close()?;
        Ok(())
    }
}

impl<P: PagedFile + 'static> Node for DynamicPagedFile<P> {
    fn kind(&self) -> NodeKind {
        NodeKind::File
    }

    fn getattr(&self) -> VfsResult<FileStat> {
        Ok(FileStat::new(NodeKind::File).with_size(self.size()?))
    }

    fn data_sync(&self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to write back cached page");
        }
    }

    fn as_file(&self) -> Option<&dyn File> {
        Some(self)
    }
}

impl<P: PagedFile + 'static> File for DynamicPagedFile<P> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        DynamicPagedFile::read_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        DynamicPagedFile::write_at(self, buf, offset)
    }

    fn close(&self) -> VfsResult<()> {
        DynamicPagedFile::close(self)
    }

    fn truncate(&self, size: u64) -> VfsResult<()> {
        DynamicPagedFile::truncate(self, size)
    }
}

/// In-memory [`PagedFile`], growable and truncatable up to a size limit
/// ([`MEM_PAGES_MAX_SIZE`] unless set with [`with_max_size`](Self::with_max_size)).
#[derive(Debug, Clone)]
pub struct MemPages {
    data: Vec<u8>,
    page_size: usize,
    max_size: u64,
}

impl MemPages {
    pub fn new(page_size: usize) -> Self {
        Self::with_content(Vec::new(), page_size)
    }

    pub fn with_content(data: Vec<u8>, page_size: usize) -> Self {
        Self {
            data,
            page_size,
            max_size: MEM_PAGES_MAX_SIZE,
        }
    }

    /// Caps growth at `max_size` bytes.
    #[must_use]
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn content(&self) -> &[u8] {
        &self.data
    }

    /// Byte range `[start, end)` of the first `len` bytes (at most a page)
    /// of page `page`, or `FileTooLarge` if it overflows the address space.
    fn page_range(&self, page: u64, len: usize) -> io::Result<(usize, usize)> {
        usize::try_from(page)
            .ok()
            .and_then(|p| p.checked_mul(self.page_size))
            .and_then(|start| {
                let end = start.checked_add(len.min(self.page_size))?;
                Some((start, end))
            })
            .ok_or_else(|| io::Error::from(io::ErrorKind::FileTooLarge))
    }
}

impl PagedFile for MemPages {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn max_size(&self) -> u64 {
        // A Vec holds at most isize::MAX bytes.
        let addressable = u64::try_from(isize::MAX).unwrap_or(u64::MAX);
        self.max_size.min(addressable)
    }

    fn read_page(&mut self, buf: &mut [u8], page: u64) -> io::Result<usize> {
        let Ok((start, end)) = self.page_range(page, buf.len()) else {
            return Ok(0);
        };
        if start >= self.data.len() {
            return Ok(0);
        }
        let end = end.min(self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }

    fn write_page(&mut self, buf: &[u8], page: u64) -> io::Result<usize> {
        let (start, end) = self.page_range(page, buf.len())?;
        if end as u64 > self.max_size() {
            return Err(io::Error::from(io::ErrorKind::FileTooLarge));
        }
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(&buf[..end - start]);
        Ok(end - start)
    }

    fn set_len(&mut self, size: u64) -> io::Result<()> {
        if size > self.max_size() {
            return Err(io::Error::from(io::ErrorKind::FileTooLarge));
        }
        let size =
            usize::try_from(size).map_err(|_| io::Error::from(io::ErrorKind::FileTooLarge))?;
        self.data.resize(size, 0);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}


/// Property-based tests using proptest.
#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any sequence of writes reads back like the same writes applied
        /// to a reference Vec<u8>.
        #[test]
        fn write_sequence_matches_reference(
            initial in prop::collection::vec(any::<u8>(), 0..64),
            page_size in 1usize..16,
            ops in prop::collection::vec(
                (0usize..96, prop::collection::vec(any::<u8>(), 0..40)),
                0..16
            )
        ) {
            let f = DynamicPagedFile::new(MemPages::with_content(initial.clone(), page_size)).unwrap();
            let mut reference = initial;

            for (offset, data) in ops {
                let written = f.write_at(&data, offset as u64).unwrap();
                prop_assert_eq!(written, data.len());

                let end = offset + data.len();
                if !data.is_empty() {
                    if end > reference.len() {
                        reference.resize(end, 0);
                    }
                    reference[offset..end].copy_from_slice(&data);
                }
            }

            prop_assert_eq!(f.size().unwrap(), reference.len() as u64);
            let mut out = vec![0u8; reference.len() + 8];
            let n = f.read_at(&mut out, 0).unwrap();
            prop_assert_eq!(&out[..n], reference.as_slice());
        }
    }
}
