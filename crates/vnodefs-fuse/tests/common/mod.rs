//! Test mount harness for FUSE integration tests.
//!
//! Provides `TestMount`, which mounts a fresh in-memory tree in a temporary
//! directory and unmounts it on drop.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use vnodefs_core::{
    DynamicPagedFile, FsConfig, MemDir, NodeRef, StaticDir, VirtualFs, WindowPagedFile,
};
use vnodefs_fuse::{FuseBackend, FuseMountHandle, MountConfig, VnodeFs};

/// Page size of the test trees; small enough that short files span pages.
pub const TEST_PAGE_SIZE: usize = 64;

/// A mounted vnode tree for testing.
pub struct TestMount {
    /// Unmounts on drop; declared first so it drops before the temp dirs.
    handle: Option<FuseMountHandle>,
    /// The driver behind the mount, for grafting nodes at runtime.
    pub driver: Arc<VirtualFs>,
    /// Path where the tree is mounted.
    pub mount_path: PathBuf,
    /// Host directory holding attached files.
    pub host_dir: TempDir,
    _temp_mount: TempDir,
}

impl TestMount {
    /// Mount an empty in-memory tree (read-write).
    pub fn new() -> Result<Self, String> {
        Self::with_attached(&[])
    }

    /// Mount an in-memory tree with one host file per `(name, content)`
    /// pair grafted under `/host`.
    pub fn with_attached(files: &[(&str, &[u8])]) -> Result<Self, String> {
        let host_dir = TempDir::new().map_err(|e| format!("Failed to create host dir: {e}"))?;
        let temp_mount = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let mount_path = temp_mount.path().join("mnt");
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;

        let driver = VirtualFs::new(MemDir::with_page_size(TEST_PAGE_SIZE), FsConfig::default())
            .map_err(|e| format!("Failed to create driver: {e}"))?;
        if !files.is_empty() {
            let mut host = StaticDir::new();
            for (name, content) in files {
                host = host.with(*name, attach(&host_dir.path().join(name), content)?);
            }
            driver
                .mkdir("/host", 0o755)
                .map_err(|e| format!("Failed to create /host: {e}"))?;
            driver
                .mount("/host", Arc::new(host))
                .map_err(|e| format!("Failed to mount /host: {e}"))?;
        }

        let driver = Arc::new(driver);
        let config = MountConfig::default().fs_name("vnodefs-test");
        let fs = VnodeFs::new(Arc::clone(&driver), config);
        let handle = FuseBackend::with_timeouts(Duration::from_secs(5), Duration::from_millis(50))
            .mount(fs, &mount_path)
            .map_err(|e| format!("Failed to mount: {e}"))?;

        // macFUSE can report the mount as ready before create() works
        thread::sleep(Duration::from_millis(100));

        Ok(Self {
            handle: Some(handle),
            driver,
            mount_path,
            host_dir,
            _temp_mount: temp_mount,
        })
    }

    /// Build a full path from a relative path.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.mount_path.join(relative.trim_start_matches('/'))
    }

    /// Path of an attached file on the host side.
    pub fn host_path(&self, name: &str) -> PathBuf {
        self.host_dir.path().join(name)
    }

    /// Read a file's contents.
    pub fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut content = Vec::new();
        File::open(self.path(path))?.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Write content to a file (creates or overwrites).
    pub fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = File::create(self.path(path))?;
        file.write_all(content)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.path(path))
    }

    pub fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.path(path))
    }

    pub fn rmdir(&self, path: &str) -> io::Result<()> {
        fs::remove_dir(self.path(path))
    }

    pub fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.path(from), self.path(to))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.path(path).exists()
    }

    pub fn metadata(&self, path: &str) -> io::Result<Metadata> {
        fs::metadata(self.path(path))
    }

    /// List directory entries (names only, sorted).
    pub fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.path(path))?
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Truncate a file to a specific size.
    pub fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(self.path(path))?;
        file.set_len(size)?;
        Ok(())
    }
}

impl Drop for TestMount {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.unmount();
        }
    }
}

fn attach(path: &Path, content: &[u8]) -> Result<NodeRef, String> {
    fs::write(path, content).map_err(|e| format!("Failed to write host file: {e}"))?;
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| format!("Failed to open host file: {e}"))?;
    let pages = WindowPagedFile::whole(file, TEST_PAGE_SIZE)
        .map_err(|e| format!("Failed to map host file: {e}"))?;
    let node =
        DynamicPagedFile::new(pages).map_err(|e| format!("Failed to cache host file: {e}"))?;
    Ok(Arc::new(node))
}

/// Check if FUSE is available on this system.
pub fn fuse_available() -> bool {
    FuseBackend::new().is_available()
}

/// Assert that an I/O result failed with `errno`.
#[track_caller]
pub fn assert_errno<T: std::fmt::Debug>(result: io::Result<T>, errno: i32) {
    match result {
        Ok(v) => panic!("expected errno {errno}, got Ok({v:?})"),
        Err(e) => assert_eq!(e.raw_os_error(), Some(errno), "unexpected error: {e}"),
    }
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}
