//! Shared harness for driver integration tests.

#![allow(dead_code)]

pub use vnodefs_core::testing::*;
pub use vnodefs_core::*;

/// Page size used by the harness so that small buffers cross pages.
pub const TEST_PAGE_SIZE: usize = 16;

/// An initialized driver over an in-memory tree.
pub struct TestFs {
    pub fs: VirtualFs,
}

impl TestFs {
    pub fn new() -> Self {
        Self::with_page_size(TEST_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let config = FsConfig::default().owner(1000, 1000);
        let fs = VirtualFs::new(MemDir::with_page_size(page_size), config).expect("driver");
        assert_eq!(fs.init().expect("init"), ROOT_HANDLE);
        Self { fs }
    }

    /// Creates (or reuses) `path`, writes `data` at 0 and releases it.
    pub fn write(&self, path: &str, data: &[u8]) {
        let fh = self.fs.create(path, 0o644).expect("create");
        assert_eq!(self.fs.write(fh, data, 0), data.len(), "short write to {path}");
        self.fs.release(fh).expect("release");
    }

    /// Opens `path`, reads it whole and releases it.
    pub fn read(&self, path: &str) -> Vec<u8> {
        let size = self.fs.getattr(path, None).expect("getattr").size;
        let fh = self.fs.open(path).expect("open");
        let mut buf = vec![0u8; usize::try_from(size).expect("size") + 8];
        let n = self.fs.read(fh, &mut buf, 0);
        self.fs.release(fh).expect("release");
        buf.truncate(n);
        buf
    }

    /// Creates directories (paths ending in `/`) and empty files.
    pub fn tree(&self, paths: &[&str]) {
        for path in paths {
            if let Some(dir) = path.strip_suffix('/') {
                self.fs.mkdir(dir, 0o755).expect("mkdir");
            } else {
                self.write(path, b"");
            }
        }
    }

    /// Names listed by readdir, without `.` and `..`.
    pub fn list(&self, path: &str) -> Vec<String> {
        let fh = self.fs.opendir(path).expect("opendir");
        let mut names = Vec::new();
        self.fs
            .readdir(fh, &mut |n| {
                if n != "." && n != ".." {
                    names.push(n.to_string());
                }
                true
            })
            .expect("readdir");
        self.fs.releasedir(fh).expect("releasedir");
        names
    }

    pub fn exists(&self, path: &str) -> bool {
        self.fs.lookup(path).is_ok()
    }
}

pub fn assert_file_content(t: &TestFs, path: &str, expected: &[u8]) {
    assert_bytes_equal(&t.read(path), expected, path);
}
