//! Mounting a [`VnodeFs`] through the kernel's FUSE interface.

use crate::error::{FuseError, FuseResult};
use crate::{MountConfig, VnodeFs};
use fuser::{BackgroundSession, MountOption};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Timeout for a graceful `session.join()` on drop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Subtype reported in the mount table (`fuse.vnodefs`).
const SUBTYPE: &str = "vnodefs";

/// Mount options for `config`.
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype(SUBTYPE.to_string()),
        // Let the kernel check modes against the attributes we report.
        MountOption::DefaultPermissions,
    ];
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options.push(if config.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });

    // On macOS, set the volume name shown in Finder
    #[cfg(target_os = "macos")]
    options.push(MountOption::CUSTOM(format!("volname={}", config.fs_name)));

    options
}

/// Handle to a mounted filesystem. Dropping it unmounts.
pub struct FuseMountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl FuseMountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts and waits for the session thread to finish.
    pub fn unmount(mut self) {
        tracing::info!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem");
        if let Some(session) = self.session.take() {
            session.join();
        }
        tracing::info!(mountpoint = %self.mountpoint.display(), "FUSE unmount successful");
    }
}

impl std::fmt::Debug for FuseMountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseMountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("mounted", &self.session.is_some())
            .finish()
    }
}

impl Drop for FuseMountHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::debug!("Unmounting FUSE filesystem at {}", self.mountpoint.display());

        // join() blocks while the kernel still holds the mount busy
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            session.join();
            let _ = tx.send(());
        });
        if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
            tracing::warn!(
                "session.join() timed out after {:?} for {}",
                JOIN_TIMEOUT,
                self.mountpoint.display()
            );
        }
    }
}

/// FUSE mounting backend.
#[derive(Debug, Clone, Copy)]
pub struct FuseBackend {
    /// Timeout for the mount call and for the mount to become visible.
    pub mount_timeout: Duration,
    /// Polling interval while waiting for the mount.
    pub poll_interval: Duration,
}

impl Default for FuseBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FuseBackend {
    pub fn new() -> Self {
        Self {
            mount_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_timeouts(mount_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            mount_timeout,
            poll_interval,
        }
    }

    /// Whether the platform's FUSE support appears to be installed.
    pub fn is_available(&self) -> bool {
        #[cfg(target_os = "macos")]
        {
            Path::new("/Library/Filesystems/macfuse.fs").exists()
        }
        #[cfg(target_os = "linux")]
        {
            Path::new("/dev/fuse").exists()
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            false
        }
    }

    pub fn unavailable_reason(&self) -> Option<String> {
        if self.is_available() {
            return None;
        }

        #[cfg(target_os = "macos")]
        {
            Some("macFUSE is not installed. Download it from https://osxfuse.github.io/".to_string())
        }
        #[cfg(target_os = "linux")]
        {
            Some("FUSE is not available. Ensure the fuse kernel module is loaded.".to_string())
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Some("FUSE is not supported on this platform.".to_string())
        }
    }

    /// Mounts `fs` at `mountpoint` and waits until the mount is live.
    pub fn mount(&self, fs: VnodeFs, mountpoint: &Path) -> FuseResult<FuseMountHandle> {
        if !mountpoint.is_dir() {
            return Err(FuseError::BadMountpoint(mountpoint.to_path_buf()));
        }
        if let Some(reason) = self.unavailable_reason() {
            return Err(FuseError::Mount(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                reason,
            )));
        }

        let options = mount_options(fs.config());
        tracing::info!(
            mountpoint = %mountpoint.display(),
            fs_name = %fs.config().fs_name,
            read_only = fs.config().read_only,
            "Starting FUSE mount"
        );

        let session = self.spawn_mount_with_timeout(fs, mountpoint, options)?;
        let handle = FuseMountHandle {
            session: Some(session),
            mountpoint: mountpoint.to_path_buf(),
        };
        self.wait_for_mount(mountpoint)?;

        tracing::info!(mountpoint = %mountpoint.display(), "FUSE mount successful");
        Ok(handle)
    }

    /// `spawn_mount2` on a helper thread: the mount syscall itself can block
    /// on a stale mount at `mountpoint`.
    fn spawn_mount_with_timeout(
        &self,
        fs: VnodeFs,
        mountpoint: &Path,
        options: Vec<MountOption>,
    ) -> FuseResult<BackgroundSession> {
        let mountpoint = mountpoint.to_path_buf();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(fuser::spawn_mount2(fs, &mountpoint, &options));
        });

        match rx.recv_timeout(self.mount_timeout) {
            Ok(res) => Ok(res?),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(FuseError::Mount(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mount operation timed out - the mountpoint may be on a stale FUSE mount",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(FuseError::Mount(
                std::io::Error::other("Mount thread terminated unexpectedly"),
            )),
        }
    }

    /// Polls until `mountpoint` sits on a different device than its parent.
    fn wait_for_mount(&self, mountpoint: &Path) -> FuseResult<()> {
        use std::os::unix::fs::MetadataExt;

        let deadline = Instant::now() + self.mount_timeout;
        let parent = mountpoint.parent().unwrap_or(Path::new("/"));
        while Instant::now() < deadline {
            if let (Ok(path_meta), Ok(parent_meta)) =
                (std::fs::metadata(mountpoint), std::fs::metadata(parent))
                && path_meta.dev() != parent_meta.dev()
            {
                tracing::debug!(
                    "FUSE mount confirmed active at {} (dev {} != parent dev {})",
                    mountpoint.display(),
                    path_meta.dev(),
                    parent_meta.dev()
                );
                return Ok(());
            }
            std::thread::sleep(self.poll_interval);
        }

        Err(FuseError::Mount(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!(
                "FUSE mount did not become ready within {:?}",
                self.mount_timeout
            ),
        )))
    }
}

/// Mounts `fs` at `mountpoint` with the default backend.
pub fn mount(fs: VnodeFs, mountpoint: &Path) -> FuseResult<FuseMountHandle> {
    FuseBackend::new().mount(fs, mountpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vnodefs_core::{FsConfig, MemDir, VirtualFs};

    fn has(options: &[MountOption], wanted: &MountOption) -> bool {
        options.iter().any(|o| o == wanted)
    }

    #[test]
    fn test_default_mount_options() {
        let options = mount_options(&MountConfig::default());
        assert!(has(&options, &MountOption::FSName("vnodefs".to_string())));
        assert!(has(&options, &MountOption::Subtype("vnodefs".to_string())));
        assert!(has(&options, &MountOption::AutoUnmount));
        assert!(has(&options, &MountOption::DefaultPermissions));
        assert!(has(&options, &MountOption::RW));
        assert!(!has(&options, &MountOption::AllowOther));
    }

    #[test]
    fn test_read_only_shared_mount_options() {
        let config = MountConfig::default()
            .read_only(true)
            .allow_other(true)
            .auto_unmount(false);
        let options = mount_options(&config);
        assert!(has(&options, &MountOption::RO));
        assert!(!has(&options, &MountOption::RW));
        assert!(has(&options, &MountOption::AllowOther));
        assert!(!has(&options, &MountOption::AutoUnmount));
    }

    #[test]
    fn test_custom_timeouts() {
        let backend = FuseBackend::with_timeouts(Duration::from_secs(5), Duration::from_millis(100));
        assert_eq!(backend.mount_timeout, Duration::from_secs(5));
        assert_eq!(backend.poll_interval, Duration::from_millis(100));
        // Just verify the method doesn't panic
        let _ = backend.unavailable_reason();
    }

    #[test]
    fn test_mount_rejects_missing_mountpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        let driver = VirtualFs::new(MemDir::new_root(), FsConfig::default()).unwrap();
        let fs = VnodeFs::new(Arc::new(driver), MountConfig::default());

        let err = mount(fs, &missing).unwrap_err();
        assert!(matches!(err, FuseError::BadMountpoint(ref p) if *p == missing));
        assert_eq!(err.to_errno(), libc::ENOTDIR);
    }
}
