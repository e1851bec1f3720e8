//! Mounting an image file on the host and copying out of it.

mod common;

use common::*;
use e2_core::{Command, CommandOutput, FileSystem, HostFs, OpenOptions};
use e2_error::E2Error;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

fn image_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp image");
    file.write_all(&build_image()).expect("write temp image");
    file.flush().expect("flush temp image");
    file
}

#[test]
fn changes_survive_remount() {
    let file = image_file();
    {
        let mut fs = FileSystem::open(file.path()).unwrap();
        fs.mkdir("kept").unwrap();
        fs.cd("kept").unwrap();
        fs.touch("inner.txt").unwrap();
        fs.sync().unwrap();
    }

    let mut fs = FileSystem::open(file.path()).unwrap();
    assert_eq!(fs.ls().unwrap().names(), vec![".", "..", "hello.txt", "kept"]);
    fs.cd("kept").unwrap();
    assert_eq!(fs.ls().unwrap().names(), vec![".", "..", "inner.txt"]);
    assert_eq!(fs.info().free_inodes, 53 + 64 - 2);
}

#[test]
fn read_only_file_mount_reads_but_refuses_writes() {
    let file = image_file();
    let options = OpenOptions {
        read_only: true,
        ..OpenOptions::default()
    };
    let mut fs = FileSystem::open_with_options(file.path(), &options).unwrap();
    assert!(fs.is_read_only());

    let mut out = Vec::new();
    fs.cat("hello.txt", &mut out).unwrap();
    assert_eq!(out, HELLO);
    assert!(matches!(fs.touch("x"), Err(E2Error::ReadOnly)));
}

#[test]
fn cp_writes_a_host_file() {
    let file = image_file();
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("copy.txt");
    let dest_str = dest.to_str().unwrap();

    let mut fs = FileSystem::open(file.path()).unwrap();
    let cp = Command::parse(&["cp", "hello.txt", dest_str]).unwrap();
    let output = fs.execute(&cp, &mut Vec::new(), &mut HostFs).unwrap();
    assert_eq!(
        output,
        CommandOutput::Copied {
            dest: dest_str.to_owned(),
            bytes: HELLO.len() as u64
        }
    );
    assert_eq!(std::fs::read(&dest).unwrap(), HELLO);
}

#[test]
fn cp_of_missing_file_creates_nothing() {
    let file = image_file();
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("never.txt");

    let mut fs = FileSystem::open(file.path()).unwrap();
    let err = fs
        .cp("missing", dest.to_str().unwrap(), &mut HostFs)
        .unwrap_err();
    assert!(matches!(err, E2Error::NotFound(_)));
    assert!(!dest.exists());
}

#[test]
fn truncated_image_is_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&build_image()[..64 * 1024]).unwrap();
    file.flush().unwrap();
    let err = FileSystem::open(file.path()).unwrap_err();
    assert!(matches!(err, E2Error::Format(_)));
}
