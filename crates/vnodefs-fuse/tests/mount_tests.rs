//! End-to-end tests through a real kernel mount.
//!
//! Run: `cargo test -p vnodefs-fuse --features fuse-tests`

#![cfg(all(unix, feature = "fuse-tests"))]

mod common;

use common::*;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use vnodefs_core::{StaticDir, StaticFile};

// =============================================================================
// Files
// =============================================================================

#[test]
fn test_write_read_small_file() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.write("small.txt", b"Hello, World!").unwrap();
    assert_eq!(mount.read("small.txt").unwrap(), b"Hello, World!");
    assert_eq!(mount.metadata("small.txt").unwrap().len(), 13);
}

#[test]
fn test_write_read_across_pages() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    let content: Vec<u8> = (0..TEST_PAGE_SIZE * 5 + 3).map(|i| (i % 251) as u8).collect();
    mount.write("big.bin", &content).unwrap();
    assert_eq!(mount.read("big.bin").unwrap(), content);
}

#[test]
fn test_overwrite_in_place() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.write("f", b"0123456789").unwrap();
    let mut file = OpenOptions::new().write(true).open(mount.path("f")).unwrap();
    file.seek(SeekFrom::Start(3)).unwrap();
    file.write_all(b"abc").unwrap();
    drop(file);

    assert_eq!(mount.read("f").unwrap(), b"012abc6789");
}

#[test]
fn test_truncate_shrinks_and_extends() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.write("f", b"0123456789").unwrap();
    mount.truncate("f", 4).unwrap();
    assert_eq!(mount.read("f").unwrap(), b"0123");

    mount.truncate("f", 6).unwrap();
    assert_eq!(mount.read("f").unwrap(), b"0123\0\0");
}

#[test]
fn test_unlinked_file_stays_readable() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.write("doomed", b"still here").unwrap();
    let mut file = File::open(mount.path("doomed")).unwrap();
    mount.remove("doomed").unwrap();
    assert!(!mount.exists("doomed"));

    let mut content = Vec::new();
    file.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"still here");
}

#[test]
fn test_attributes_carry_process_identity() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.write("f", b"x").unwrap();
    let meta = mount.metadata("f").unwrap();
    let expected = std::fs::metadata(mount.host_dir.path()).unwrap();
    assert_eq!(meta.uid(), expected.uid());
    assert_eq!(meta.gid(), expected.gid());
    assert!(meta.is_file());
}

// =============================================================================
// Directories
// =============================================================================

#[test]
fn test_mkdir_list_rmdir() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.mkdir("d").unwrap();
    mount.write("d/a", b"1").unwrap();
    mount.write("d/b", b"2").unwrap();
    assert_eq!(mount.list("d").unwrap(), vec!["a", "b"]);
    assert!(mount.metadata("d").unwrap().is_dir());

    assert_errno(mount.rmdir("d"), libc::ENOTEMPTY);
    mount.remove("d/a").unwrap();
    mount.remove("d/b").unwrap();
    mount.rmdir("d").unwrap();
    assert!(!mount.exists("d"));
}

#[test]
fn test_missing_entries() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    assert_errno(mount.read("nope"), libc::ENOENT);
    assert_errno(mount.mkdir("no/such/dir"), libc::ENOENT);
}

// =============================================================================
// Rename
// =============================================================================

#[test]
fn test_rename_file() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.write("old", b"content").unwrap();
    mount.rename("old", "new").unwrap();
    assert!(!mount.exists("old"));
    assert_eq!(mount.read("new").unwrap(), b"content");
}

#[test]
fn test_rename_directory_moves_children() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.mkdir("a").unwrap();
    mount.write("a/f", b"inside").unwrap();
    mount.rename("a", "b").unwrap();

    assert_eq!(mount.read("b/f").unwrap(), b"inside");
    assert!(!mount.exists("a/f"));
}

#[test]
fn test_rename_over_existing_file() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.write("src", b"new").unwrap();
    mount.write("dst", b"old").unwrap();
    mount.rename("src", "dst").unwrap();
    assert_eq!(mount.read("dst").unwrap(), b"new");
    assert_eq!(mount.list("").unwrap(), vec!["dst"]);
}

// =============================================================================
// Mounted sub-trees
// =============================================================================

#[test]
fn test_attached_host_file_reads_through() {
    skip_if_no_fuse!();
    let content: Vec<u8> = (0..200u8).collect();
    let mount = require_mount!(TestMount::with_attached(&[("data.bin", content.as_slice())]));

    assert_eq!(mount.list("host").unwrap(), vec!["data.bin"]);
    assert_eq!(mount.read("host/data.bin").unwrap(), content);
    assert_eq!(mount.metadata("host/data.bin").unwrap().len(), 200);
}

#[test]
fn test_attached_host_file_writes_back() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::with_attached(&[("data.txt", &b"0123456789"[..])]));

    let mut file = OpenOptions::new()
        .write(true)
        .open(mount.path("host/data.txt"))
        .unwrap();
    file.write_all(b"HELLO").unwrap();
    file.sync_all().unwrap();
    drop(file);

    let host = std::fs::read(mount.host_path("data.txt")).unwrap();
    assert_eq!(host, b"HELLO56789");
}

#[test]
fn test_attached_directory_is_read_only() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::with_attached(&[("f", &b"x"[..])]));

    assert_errno(mount.write("host/new", b"y"), libc::EROFS);
    assert_errno(mount.mkdir("host/sub"), libc::EROFS);
    assert_errno(mount.rename("host/f", "host/g"), libc::EROFS);
}

#[test]
fn test_runtime_graft_and_unmount() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    mount.mkdir("live").unwrap();
    mount.write("live/shadowed", b"below").unwrap();

    let overlay = StaticDir::new().with("motd", Arc::new(StaticFile::new("hi\n")));
    mount.driver.mount("/live", Arc::new(overlay)).unwrap();
    assert_eq!(mount.read("live/motd").unwrap(), b"hi\n");

    mount.driver.unmount("/live").unwrap();
    assert_eq!(mount.read("live/shadowed").unwrap(), b"below");
}
