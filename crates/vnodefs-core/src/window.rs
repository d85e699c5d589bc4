//! Fixed byte window of a host file, addressed in pages.

use crate::paged::PagedFile;
use std::fs;
use std::io;
use std::os::unix::fs::FileExt;

/// [`PagedFile`] over `[offset, offset + size)` of a positional file.
///
/// The window never grows, so its size is also its
/// [`max_size`](PagedFile::max_size). Page numbers past the last (partial)
/// page fail with `InvalidInput`; buffers longer than a page, or reaching
/// past the window, are clamped.
#[derive(Debug)]
pub struct WindowPagedFile<F> {
    file: F,
    offset: u64,
    size: u64,
    page_size: usize,
    pages: u64,
}

impl<F: FileExt + Send> WindowPagedFile<F> {
    pub fn new(file: F, offset: u64, size: u64, page_size: usize) -> io::Result<Self> {
        if page_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page size must be non-zero",
            ));
        }
        Ok(Self {
            file,
            offset,
            size,
            page_size,
            pages: size / page_size as u64,
        })
    }

    pub fn into_inner(self) -> F {
        self.file
    }

    /// Absolute position of `page` and the byte count available there.
    #[allow(clippy::cast_possible_truncation)]
    fn locate(&self, page: u64, len: usize) -> io::Result<(u64, usize)> {
        if page > self.pages {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let start = page * self.page_size as u64;
        let avail = (self.size - start).min(self.page_size as u64) as usize;
        Ok((self.offset + start, len.min(avail)))
    }
}

impl WindowPagedFile<fs::File> {
    /// Window covering the whole of `file` at its current length.
    pub fn whole(file: fs::File, page_size: usize) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Self::new(file, 0, size, page_size)
    }
}

impl<F: FileExt + Send> PagedFile for WindowPagedFile<F> {
    fn size(&self) -> u64 {
        self.size
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn max_size(&self) -> u64 {
        self.size
    }

    fn read_page(&mut self, buf: &mut [u8], page: u64) -> io::Result<usize> {
        let (pos, len) = self.locate(page, buf.len())?;
        let mut done = 0;
        while done < len {
            match self.file.read_at(&mut buf[done..len], pos + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn write_page(&mut self, buf: &[u8], page: u64) -> io::Result<usize> {
        let (pos, len) = self.locate(page, buf.len())?;
        self.file.write_all_at(&buf[..len], pos)?;
        Ok(len)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn host_file(content: &[u8]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(content).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_read_pages_in_window() {
        let tmp = host_file(b"xx0123456789yy");
        let file = tmp.reopen().unwrap();
        let mut pf = WindowPagedFile::new(file, 2, 10, 4).unwrap();
        assert_eq!(pf.size(), 10);
        assert_eq!(pf.max_size(), 10);

        let mut buf = [0u8; 4];
        assert_eq!(pf.read_page(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(pf.read_page(&mut buf, 2).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
    }

    #[test]
    fn test_page_past_window_is_invalid() {
        let tmp = host_file(b"0123456789");
        let mut pf = WindowPagedFile::whole(tmp.reopen().unwrap(), 4).unwrap();
        let mut buf = [0u8; 4];
        let err = pf.read_page(&mut buf, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_oversized_buffer_is_clamped() {
        let tmp = host_file(b"0123456789");
        let mut pf = WindowPagedFile::whole(tmp.reopen().unwrap(), 4).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(pf.read_page(&mut buf, 1).unwrap(), 4);
        assert_eq!(&buf[..4], b"4567");
    }

    #[test]
    fn test_write_page_stays_in_window() {
        let tmp = host_file(b"..........");
        let mut pf = WindowPagedFile::new(tmp.reopen().unwrap(), 2, 6, 4).unwrap();
        assert_eq!(pf.write_page(b"ABCD", 0).unwrap(), 4);
        assert_eq!(pf.write_page(b"EFGH", 1).unwrap(), 2);
        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"..ABCDEF..");
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let tmp = host_file(b"abc");
        assert!(WindowPagedFile::whole(tmp.reopen().unwrap(), 0).is_err());
    }
}
