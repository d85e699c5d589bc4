//! Mount configuration for the FUSE frontend.

use std::time::Duration;

/// Default attribute and entry TTL handed to the kernel.
///
/// Kept short: nodes can be grafted over paths at runtime, and the kernel
/// would otherwise keep serving attributes of the shadowed tree.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Default filesystem name shown in the mount table.
pub const DEFAULT_FS_NAME: &str = "vnodefs";

/// Configuration options for a FUSE mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Time-to-live for attributes and directory entries.
    pub ttl: Duration,

    /// Name reported as the mount source.
    pub fs_name: String,

    /// Let users other than the mounting one access the filesystem.
    ///
    /// Requires `user_allow_other` in `/etc/fuse.conf` on Linux.
    pub allow_other: bool,

    /// Unmount automatically when the process exits.
    pub auto_unmount: bool,

    /// Mount read-only; the kernel rejects writes before they reach the driver.
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            fs_name: DEFAULT_FS_NAME.to_string(),
            allow_other: false,
            auto_unmount: true,
            read_only: false,
        }
    }
}

impl MountConfig {
    /// Sets the attribute and entry TTL.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the filesystem name.
    #[must_use]
    pub fn fs_name(mut self, name: impl Into<String>) -> Self {
        self.fs_name = name.into();
        self
    }

    #[must_use]
    pub fn allow_other(mut self, allow: bool) -> Self {
        self.allow_other = allow;
        self
    }

    #[must_use]
    pub fn auto_unmount(mut self, auto: bool) -> Self {
        self.auto_unmount = auto;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MountConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(1));
        assert_eq!(config.fs_name, "vnodefs");
        assert!(config.auto_unmount);
        assert!(!config.allow_other);
        assert!(!config.read_only);
    }

    #[test]
    fn test_builder_pattern() {
        let config = MountConfig::default()
            .ttl(Duration::ZERO)
            .fs_name("scratch")
            .allow_other(true)
            .read_only(true);
        assert_eq!(config.ttl, Duration::ZERO);
        assert_eq!(config.fs_name, "scratch");
        assert!(config.allow_other);
        assert!(config.read_only);
    }
}
