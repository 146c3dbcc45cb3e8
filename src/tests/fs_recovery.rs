//! Filesystem crash-recovery scenarios: drop the pool at a chosen point,
//! reopen, and check what survived.

use rstest::rstest;

use super::{pool_size, tempdir};
use crate::fs::{Filesystem, FsError, orphan};
use crate::layout::fs::{InodeArrayPage, TYPE_INODE};
use crate::layout::PAGE_SIZE;
use crate::operation::OpKind;
use crate::palloc;

#[rstest]
fn test_write_survives_reopen(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    let payload: Vec<u8> = (0..9000).map(|_| fastrand::u8(..)).collect();

    {
        let fs = Filesystem::create(&path, pool_size(32)).expect("create");
        let file = fs
            .open_file("/data", libc::O_CREAT | libc::O_RDWR, 0o644)
            .unwrap();
        fs.write(&file, &payload).unwrap();
    }

    let fs = Filesystem::open(&path).expect("reopen");
    let file = fs.open_file("/data", libc::O_RDONLY, 0).unwrap();
    let mut back = vec![0u8; payload.len() + 100];
    let n = fs.read(&file, &mut back).unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(&back[..n], &payload[..]);
}

#[rstest]
fn test_offset_write_round_trip(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");

    {
        let fs = Filesystem::create(&path, pool_size(32)).expect("create");
        let file = fs
            .open_file("/sparse", libc::O_CREAT | libc::O_RDWR, 0o644)
            .unwrap();
        fs.seek(&file, std::io::SeekFrom::Start(6000)).unwrap();
        fs.write(&file, b"at-offset").unwrap();
    }

    let fs = Filesystem::open(&path).expect("reopen");
    let file = fs.open_file("/sparse", libc::O_RDONLY, 0).unwrap();
    assert_eq!(fs.fstat(&file).size, 6009);

    // The gap reads back as zeros, the payload intact.
    fs.seek(&file, std::io::SeekFrom::Start(5998)).unwrap();
    let mut buf = [0u8; 11];
    fs.read(&file, &mut buf).unwrap();
    assert_eq!(&buf, b"\0\0at-offset");
}

#[rstest]
fn test_rename_atomic_across_crash(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    {
        let fs = Filesystem::create(&path, pool_size(32)).expect("create");
        let file = fs
            .open_file("/x", libc::O_CREAT | libc::O_WRONLY, 0o644)
            .unwrap();
        fs.write(&file, b"xyz").unwrap();
        drop(file);
        fs.rename("/x", "/y").unwrap();
        // Crash after the rename committed.
    }

    let fs = Filesystem::open(&path).expect("reopen");
    assert!(matches!(fs.stat("/x"), Err(FsError::NotFound)));
    assert_eq!(fs.stat("/y").unwrap().size, 3, "only the new name exists");
}

#[rstest]
fn test_orphan_sweep_reclaims_after_crash(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    let baseline;
    {
        let fs = Filesystem::create(&path, pool_size(32)).expect("create");
        baseline = fs.pool().object_count();

        // Park an inode on the orphan list the way an unlinked-but-open
        // file would be, then crash with the "handle" still live.
        let pool = fs.pool();
        let locks = parking_lot::Mutex::new(std::collections::HashMap::new());
        let reserved = orphan::reserve_slot(pool, &locks).expect("reserve");
        let used = pool
            .pmem()
            .view::<InodeArrayPage>(reserved.page_off)
            .used;

        let mut ctx = pool.operation();
        ctx.add_entry(reserved.slot_off, TYPE_INODE, OpKind::Set).unwrap();
        ctx.add_entry(
            InodeArrayPage::used_off(reserved.page_off),
            used + 1,
            OpKind::Set,
        )
        .unwrap();
        let mut ctor = |data: &mut [u8]| {
            crate::fs::inode::init_inode(
                data,
                (libc::S_IFREG | 0o600) as u64,
                0,
                crate::fs::inode::current_time(),
            );
            Ok(())
        };
        palloc::palloc_operation(
            pool.heap(),
            0,
            Some(reserved.slot_off + 8),
            PAGE_SIZE,
            Some(&mut ctor),
            &mut ctx,
        )
        .expect("orphaned inode allocated");
    }

    // Reopen: no handle can exist any more, the sweep must free the
    // inode; the orphan page itself is kept.
    let fs = Filesystem::open(&path).expect("reopen sweeps");
    assert_eq!(fs.pool().object_count(), baseline + 1);

    let page = fs.pool().superblock().orphaned_inodes;
    assert!(!page.is_null());
    let page: &InodeArrayPage = fs.pool().pmem().view(page.off);
    assert_eq!(page.used, 0, "slot cleared by the sweep");
}

#[rstest]
fn test_aborted_transaction_leaves_no_trace(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    {
        let fs = Filesystem::create(&path, pool_size(32)).expect("create");
        // A transaction staged but never committed dies with the process.
        let pool = fs.pool();
        let mut ctx = pool.operation();
        ctx.add_entry(2048, 0xDEAD, OpKind::Set).unwrap();
    }

    let fs = Filesystem::open(&path).expect("reopen");
    assert_eq!(fs.pool().pmem().read::<u64>(2048), 0);
}
