//! Custom assertions with failure messages that stay readable for large
//! buffers.

use crate::error::{VfsError, VfsResult};

/// Assert that two byte slices are equal.
///
/// On failure, shows sizes and the first differing position rather than
/// dumping both buffers.
pub fn assert_bytes_equal(actual: &[u8], expected: &[u8], context: &str) {
    assert!(
        actual.len() == expected.len(),
        "{}: size mismatch - expected {} bytes, got {} bytes",
        context,
        expected.len(),
        actual.len()
    );

    if let Some((i, (a, e))) = actual
        .iter()
        .zip(expected.iter())
        .enumerate()
        .find(|(_, (a, e))| a != e)
    {
        panic!("{context}: content mismatch at byte {i} - expected 0x{e:02x}, got 0x{a:02x}");
    }
}

/// Assert that a driver result failed with `expected_errno`.
pub fn assert_vfs_err<T: std::fmt::Debug>(result: VfsResult<T>, expected_errno: i32, context: &str) {
    match result {
        Ok(value) => panic!(
            "{}: expected {} but got success with {:?}",
            context,
            errno_name(expected_errno),
            value
        ),
        Err(err) => {
            let actual = VfsError::to_errno(&err);
            assert!(
                actual == expected_errno,
                "{}: expected {} ({}), got {} ({}: {})",
                context,
                expected_errno,
                errno_name(expected_errno),
                actual,
                errno_name(actual),
                err
            );
        }
    }
}

/// Human-readable name for the errno values the driver produces.
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        libc::ENOENT => "ENOENT",
        libc::EEXIST => "EEXIST",
        libc::ENOTDIR => "ENOTDIR",
        libc::EISDIR => "EISDIR",
        libc::ENOTEMPTY => "ENOTEMPTY",
        libc::EACCES => "EACCES",
        libc::EPERM => "EPERM",
        libc::EINVAL => "EINVAL",
        libc::EIO => "EIO",
        libc::ELOOP => "ELOOP",
        libc::EROFS => "EROFS",
        libc::EBUSY => "EBUSY",
        libc::EXDEV => "EXDEV",
        libc::ENOSYS => "ENOSYS",
        libc::ERANGE => "ERANGE",
        libc::EFBIG => "EFBIG",
        e if e == crate::error::ENOATTR => "ENOATTR",
        _ => "UNKNOWN",
    }
}
