//! Filesystem surface round trips on a live pool.

use rstest::rstest;

use super::{pool_size, tempdir};
use crate::fs::{Filesystem, FsError};

fn make_fs(dir: &tempfile::TempDir) -> Filesystem {
    Filesystem::create(dir.path().join("pool"), pool_size(32)).expect("create fs")
}

#[rstest]
fn test_create_write_read(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);

    let file = fs
        .open_file("/hello", libc::O_CREAT | libc::O_RDWR, 0o644)
        .expect("create file");
    assert_eq!(fs.write(&file, b"persistent greetings").unwrap(), 20);

    fs.seek(&file, std::io::SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 64];
    let n = fs.read(&file, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"persistent greetings");

    let meta = fs.fstat(&file);
    assert!(meta.is_file());
    assert_eq!(meta.size, 20);
    assert_eq!(meta.nlink, 1);
}

#[rstest]
fn test_open_exclusive_on_existing(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    fs.mkdir("/a", 0o755).unwrap();
    let file = fs
        .open_file("/a/b", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    drop(file);

    let before = fs.pool().object_count();
    let err = fs
        .open_file("/a/b", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .expect_err("exclusive create must fail");
    assert!(matches!(err, FsError::Exists));
    assert_eq!(err.errno(), libc::EEXIST);
    assert_eq!(fs.pool().object_count(), before, "no state change");
}

#[rstest]
fn test_open_flag_validation(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);

    let err = fs
        .open_file("/x", libc::O_RDONLY | libc::O_ASYNC, 0)
        .expect_err("O_ASYNC is unsupported");
    assert_eq!(err.errno(), libc::EINVAL);

    let err = fs
        .open_file("/x", libc::O_RDONLY | libc::O_PATH, 0)
        .expect_err("O_PATH is unsupported");
    assert_eq!(err.errno(), libc::EINVAL);

    let err = fs
        .open_file("/x", 0x4000_0000, 0)
        .expect_err("unknown bits are rejected");
    assert_eq!(err.errno(), libc::EINVAL);

    // The accepted no-op flags go through.
    let file = fs
        .open_file(
            "/x",
            libc::O_CREAT | libc::O_RDWR | libc::O_CLOEXEC | libc::O_SYNC,
            0o600,
        )
        .expect("no-op flags accepted");
    drop(file);
}

#[rstest]
fn test_link_unlink_round_trip(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    let baseline = fs.pool().object_count();

    let file = fs
        .open_file("/f", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    fs.write(&file, b"payload").unwrap();
    let original = fs.fstat(&file);
    drop(file);

    fs.link("/f", "/g").expect("link");
    assert_eq!(fs.stat("/g").unwrap().nlink, 2);

    fs.unlink("/f").expect("unlink /f");
    let meta = fs.stat("/g").expect("g still resolves");
    assert_eq!(meta.ino, original.ino, "same inode behind the other name");
    assert_eq!(meta.size, original.size);
    assert_eq!(meta.mtime, original.mtime);
    assert_eq!(meta.nlink, 1);

    fs.unlink("/g").expect("unlink /g");
    assert!(matches!(fs.stat("/g"), Err(FsError::NotFound)));
    // The inode and its data block are gone; the orphan page allocated by
    // the final unlink is the only survivor.
    assert_eq!(fs.pool().object_count(), baseline + 1);
}

#[rstest]
fn test_unlink_while_open_defers_reclaim(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    let baseline = fs.pool().object_count();

    let file = fs
        .open_file("/victim", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    fs.write(&file, b"still readable").unwrap();

    fs.unlink("/victim").expect("unlink while open");
    assert!(matches!(fs.stat("/victim"), Err(FsError::NotFound)));

    // The open handle still reads the orphaned inode.
    fs.seek(&file, std::io::SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 32];
    let n = fs.read(&file, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"still readable");

    // Last close reclaims everything (the orphan page itself stays).
    drop(file);
    assert_eq!(fs.pool().object_count(), baseline + 1);
}

#[rstest]
fn test_rename_within_directory(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);

    let file = fs
        .open_file("/x", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    fs.write(&file, b"contents").unwrap();
    drop(file);

    fs.rename("/x", "/y").expect("rename");
    assert!(matches!(fs.stat("/x"), Err(FsError::NotFound)));
    assert_eq!(fs.stat("/y").unwrap().size, 8);
}

#[rstest]
fn test_rename_replaces_destination(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    let baseline = fs.pool().object_count();

    let a = fs
        .open_file("/a", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    fs.write(&a, b"aaaa").unwrap();
    drop(a);
    let b = fs
        .open_file("/b", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    fs.write(&b, b"bb").unwrap();
    drop(b);

    fs.rename("/a", "/b").expect("replacing rename");
    assert!(matches!(fs.stat("/a"), Err(FsError::NotFound)));
    assert_eq!(fs.stat("/b").unwrap().size, 4, "source replaced the victim");

    // The victim's inode and block were reclaimed; what remains is the
    // surviving file (inode + one block) and the orphan page.
    assert_eq!(fs.pool().object_count(), baseline + 3);
}

#[rstest]
fn test_mkdir_rmdir(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    let root_nlink = fs.stat("/").unwrap().nlink;

    fs.mkdir("/dir", 0o755).unwrap();
    assert!(fs.stat("/dir").unwrap().is_dir());
    assert_eq!(fs.stat("/").unwrap().nlink, root_nlink + 1);

    let file = fs
        .open_file("/dir/child", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    drop(file);

    let err = fs.rmdir("/dir").expect_err("non-empty rmdir");
    assert_eq!(err.errno(), libc::ENOTEMPTY);

    fs.unlink("/dir/child").unwrap();
    fs.rmdir("/dir").expect("empty rmdir");
    assert!(matches!(fs.stat("/dir"), Err(FsError::NotFound)));
    assert_eq!(fs.stat("/").unwrap().nlink, root_nlink);
}

#[rstest]
fn test_read_dir_listing(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);

    for name in ["one", "two", "three"] {
        let file = fs
            .open_file(&format!("/{name}"), libc::O_CREAT | libc::O_WRONLY, 0o644)
            .unwrap();
        drop(file);
    }

    let mut names = fs.read_dir("/").unwrap();
    names.sort();
    assert_eq!(names, ["one", "three", "two"]);
}

#[rstest]
fn test_symlink_stat_vs_lstat(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);

    let file = fs
        .open_file("/target", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    fs.write(&file, b"0123456789").unwrap();
    drop(file);

    fs.symlink("/target", "/alias").expect("symlink");

    let followed = fs.stat("/alias").expect("stat follows");
    assert!(followed.is_file());
    assert_eq!(followed.size, 10);

    let link = fs.lstat("/alias").expect("lstat reports the link");
    assert!(link.is_symlink());
    assert_eq!(link.size, "/target".len() as u64);

    // Opening through the symlink reaches the target.
    let through = fs
        .open_file("/alias", libc::O_RDONLY, 0)
        .expect("open through symlink");
    let mut buf = [0u8; 16];
    let n = fs.read(&through, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"0123456789");
}

#[rstest]
fn test_symlink_loop_detected(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    fs.symlink("/b", "/a").unwrap();
    fs.symlink("/a", "/b").unwrap();

    let err = fs.stat("/a").expect_err("loop must be detected");
    assert_eq!(err.errno(), libc::ELOOP);
}

#[rstest]
fn test_tmpfile_vanishes_on_close(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    let baseline = fs.pool().object_count();

    let file = fs
        .open_file("/", libc::O_TMPFILE | libc::O_RDWR, 0o600)
        .expect("tmpfile");
    fs.write(&file, b"scratch").unwrap();
    assert!(fs.pool().object_count() > baseline);

    drop(file);
    // Only the orphan page sticks around.
    assert_eq!(fs.pool().object_count(), baseline + 1);
}

#[rstest]
fn test_large_file_spills_into_overflow_extents(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    let baseline = fs.pool().object_count();

    let file = fs
        .open_file("/big", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();

    // More than one block-array page worth of 4 KiB blocks.
    let chunk: Vec<u8> = (0..PATTERN_LEN).map(|i| (i % 251) as u8).collect();
    for _ in 0..CHUNKS {
        fs.write(&file, &chunk).unwrap();
    }
    let meta = fs.fstat(&file);
    assert_eq!(meta.size, (PATTERN_LEN * CHUNKS) as u64);

    fs.seek(&file, std::io::SeekFrom::Start(0)).unwrap();
    let mut back = vec![0u8; PATTERN_LEN];
    fs.read(&file, &mut back).unwrap();
    assert_eq!(back, chunk);

    // Truncating on reopen releases every block and overflow page.
    drop(file);
    let file = fs
        .open_file("/big", libc::O_TRUNC | libc::O_WRONLY, 0)
        .unwrap();
    assert_eq!(fs.fstat(&file).size, 0);
    drop(file);
    assert_eq!(fs.pool().object_count(), baseline + 1, "only the inode is left");

    const PATTERN_LEN: usize = 8192;
    const CHUNKS: usize = 90;
}

#[rstest]
fn test_relative_paths_and_chdir(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    fs.mkdir("/sub", 0o755).unwrap();
    fs.chdir("/sub").unwrap();

    let file = fs
        .open_file("rel", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    drop(file);
    assert!(fs.stat("/sub/rel").unwrap().is_file());

    fs.chdir("/").unwrap();
    assert!(matches!(fs.stat("rel"), Err(FsError::NotFound)));
}

#[rstest]
fn test_name_too_long(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    let long = "x".repeat(256);
    let err = fs
        .open_file(&format!("/{long}"), libc::O_CREAT | libc::O_WRONLY, 0o644)
        .expect_err("255 bytes is the limit");
    assert_eq!(err.errno(), libc::ENAMETOOLONG);
}

#[rstest]
fn test_unlink_directory_is_rejected(tempdir: tempfile::TempDir) {
    let fs = make_fs(&tempdir);
    fs.mkdir("/d", 0o755).unwrap();
    let err = fs.unlink("/d").expect_err("unlink of a directory");
    assert_eq!(err.errno(), libc::EISDIR);
}
