//! Per-call trace categories.
//!
//! Every driver entry point belongs to one [`TraceMask`] category. When the
//! category is enabled in the configured mask, the call emits one `debug!`
//! event carrying its name, arguments and result. A call that unwinds
//! emits an `error!` event marked `!PANIC` instead.

use bitflags::{Flags, bitflags};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};

bitflags! {
    /// Set of driver calls to trace.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraceMask: u64 {
        const GETATTR = 1 << 0;
        const CHMOD = 1 << 1;
        const CHOWN = 1 << 2;
        const UTIMENS = 1 << 3;
        const ACCESS = 1 << 4;

        const OPENDIR = 1 << 5;
        const READDIR = 1 << 6;
        const FSYNCDIR = 1 << 7;
        const RELEASEDIR = 1 << 8;
        const MKDIR = 1 << 9;
        const RMDIR = 1 << 10;

        const OPEN = 1 << 11;
        const CREATE = 1 << 12;
        const TRUNCATE = 1 << 13;
        const READ = 1 << 14;
        const WRITE = 1 << 15;
        const RELEASE = 1 << 16;
        const UNLINK = 1 << 17;
        const FLUSH = 1 << 18;
        const FSYNC = 1 << 19;

        const LISTXATTR = 1 << 20;
        const SETXATTR = 1 << 21;
        const GETXATTR = 1 << 22;
        const REMOVEXATTR = 1 << 23;

        const INIT = 1 << 24;
        const DESTROY = 1 << 25;
        const STATFS = 1 << 26;
        const MAKE = 1 << 27;
        const REMOVE = 1 << 28;
        const RENAME = 1 << 29;
        const MOUNT = 1 << 30;
        const UNMOUNT = 1 << 31;

        const ATTR = Self::GETATTR.bits() | Self::CHMOD.bits() | Self::CHOWN.bits()
            | Self::UTIMENS.bits() | Self::ACCESS.bits();
        const XATTR = Self::LISTXATTR.bits() | Self::SETXATTR.bits()
            | Self::GETXATTR.bits() | Self::REMOVEXATTR.bits();
        const DIR = Self::OPENDIR.bits() | Self::READDIR.bits() | Self::FSYNCDIR.bits()
            | Self::RELEASEDIR.bits() | Self::MKDIR.bits() | Self::RMDIR.bits();
        const FILE = Self::OPEN.bits() | Self::CREATE.bits() | Self::TRUNCATE.bits()
            | Self::READ.bits() | Self::WRITE.bits() | Self::RELEASE.bits()
            | Self::UNLINK.bits() | Self::FLUSH.bits() | Self::FSYNC.bits();
        const FS = Self::INIT.bits() | Self::DESTROY.bits() | Self::STATFS.bits()
            | Self::MAKE.bits() | Self::REMOVE.bits() | Self::RENAME.bits()
            | Self::MOUNT.bits() | Self::UNMOUNT.bits();
        const ALL = Self::ATTR.bits() | Self::XATTR.bits() | Self::DIR.bits()
            | Self::FILE.bits() | Self::FS.bits();

        const OPEN_ANY = Self::OPENDIR.bits() | Self::OPEN.bits();
        const RELEASE_ANY = Self::RELEASEDIR.bits() | Self::RELEASE.bits();
        const CREATE_ANY = Self::CREATE.bits() | Self::MKDIR.bits() | Self::MAKE.bits();
        const REMOVE_ANY = Self::RMDIR.bits() | Self::UNLINK.bits() | Self::REMOVE.bits();
    }
}

impl Default for TraceMask {
    fn default() -> Self {
        TraceMask::ALL
    }
}

/// Case- and underscore-insensitive comparison key.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Error for an unknown category name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown trace category: {0}")]
pub struct ParseTraceMaskError(pub String);

impl FromStr for TraceMask {
    type Err = ParseTraceMaskError;

    /// Parses `+`-separated category names, e.g. `"Getattr+Read+Dir"`.
    /// The empty string disables tracing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = TraceMask::empty();
        for part in s.split('+').map(str::trim).filter(|p| !p.is_empty()) {
            let key = normalize(part);
            let flag = TraceMask::FLAGS
                .iter()
                .find(|f| normalize(f.name()) == key)
                .ok_or_else(|| ParseTraceMaskError(part.to_owned()))?;
            mask |= *flag.value();
        }
        Ok(mask)
    }
}

impl fmt::Display for TraceMask {
    /// Lists the single-call categories joined with `+`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for flag in TraceMask::FLAGS {
            let bits = flag.value().bits();
            if bits.is_power_of_two() && self.bits() & bits != 0 {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(flag.name())?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Trace guard for one driver call.
///
/// Created before the call takes the driver lock, finished with the
/// result. Dropped unfinished while unwinding, it reports the panic.
#[must_use]
pub struct CallTrace {
    name: &'static str,
    args: Option<String>,
}

impl CallTrace {
    /// Starts tracing `name` if `category` is enabled in `mask`. `args` is
    /// only formatted when tracing is on.
    pub fn start(
        mask: TraceMask,
        category: TraceMask,
        name: &'static str,
        args: impl FnOnce() -> String,
    ) -> Self {
        let args = mask.intersects(category).then(args);
        Self { name, args }
    }

    /// Logs the outcome and hands it back.
    pub fn finish<T: fmt::Debug, E: fmt::Debug>(mut self, result: Result<T, E>) -> Result<T, E> {
        if let Some(args) = self.args.take() {
            debug!(call = self.name, args = %args, result = ?result, "vfs call");
        }
        result
    }

    /// Logs a call whose outcome is not a `Result`.
    pub fn finish_value<T: fmt::Debug>(mut self, value: T) -> T {
        if let Some(args) = self.args.take() {
            debug!(call = self.name, args = %args, result = ?value, "vfs call");
        }
        value
    }

    pub fn is_enabled(&self) -> bool {
        self.args.is_some()
    }
}

impl Drop for CallTrace {
    fn drop(&mut self) {
        if let Some(args) = self.args.take()
            && std::thread::panicking()
        {
            error!(call = self.name, args = %args, "!PANIC");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_all() {
        assert_eq!(TraceMask::default(), TraceMask::ALL);
        assert!(TraceMask::ALL.contains(TraceMask::UNMOUNT));
    }

    #[test]
    fn test_groups() {
        assert!(TraceMask::ATTR.contains(TraceMask::GETATTR | TraceMask::ACCESS));
        assert!(TraceMask::OPEN_ANY.contains(TraceMask::OPEN | TraceMask::OPENDIR));
        assert!(TraceMask::CREATE_ANY.contains(TraceMask::MAKE));
        assert!(!TraceMask::FILE.intersects(TraceMask::XATTR));
    }

    #[test]
    fn test_parse_mixed_case() {
        let mask: TraceMask = "Getattr+read+Dir".parse().unwrap();
        assert!(mask.contains(TraceMask::GETATTR));
        assert!(mask.contains(TraceMask::READ));
        assert!(mask.contains(TraceMask::DIR));
        assert!(!mask.contains(TraceMask::WRITE));
    }

    #[test]
    fn test_parse_camel_case_group() {
        let mask: TraceMask = "OpenAny".parse().unwrap();
        assert_eq!(mask, TraceMask::OPEN_ANY);
    }

    #[test]
    fn test_parse_empty_disables() {
        assert_eq!("".parse::<TraceMask>().unwrap(), TraceMask::empty());
    }

    #[test]
    fn test_parse_unknown() {
        let err = "Getattr+Bogus".parse::<TraceMask>().unwrap_err();
        assert_eq!(err, ParseTraceMaskError("Bogus".to_string()));
    }

    #[test]
    fn test_display_roundtrip() {
        let mask = TraceMask::GETATTR | TraceMask::READ;
        assert_eq!(mask.to_string(), "GETATTR+READ");
        assert_eq!(mask.to_string().parse::<TraceMask>().unwrap(), mask);
        assert_eq!(TraceMask::empty().to_string(), "");
    }

    #[test]
    fn test_disabled_trace_skips_formatting() {
        let trace = CallTrace::start(TraceMask::READ, TraceMask::WRITE, "write", || {
            panic!("arguments formatted for a disabled category")
        });
        assert!(!trace.is_enabled());
        assert_eq!(trace.finish::<u8, ()>(Ok(3)), Ok(3));
    }
}
