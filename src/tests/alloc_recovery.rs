//! Crash-recovery scenarios of the allocator and redo log, driven
//! through the pool.

use rstest::rstest;

use super::{pool_size, tempdir};
use crate::heap::BlockState;
use crate::layout::{self, ALLOC_DATA_OFF, ALLOC_HDR_SIZE, AllocationHeader};
use crate::palloc;
use crate::pool::Pool;
use crate::redo_log::{REDO_FINISH_FLAG, RedoEntry, RedoLog};

/// A destination word inside the superblock padding, outside any field
/// the pool itself uses.
const DEST_WORD: u64 = 2048;

#[rstest]
fn test_alloc_survives_crash_after_commit(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    {
        let pool = Pool::create(&path, pool_size(16)).expect("create");
        let mut ctx = pool.operation();
        let mut ctor = |data: &mut [u8]| {
            data[..500].fill(0xAA);
            Ok(())
        };
        palloc::palloc_operation(
            pool.heap(),
            0,
            Some(DEST_WORD),
            500,
            Some(&mut ctor),
            &mut ctx,
        )
        .expect("alloc");
        // Crash immediately after the commit: nothing else persisted.
    }

    let pool = Pool::open(&path).expect("recover");
    assert!(pool.check());
    let user = pool.pmem().read::<u64>(DEST_WORD);
    assert_ne!(user, 0, "published offset must survive");
    assert!(pool.pmem().slice(user, 500).iter().all(|b| *b == 0xAA));

    // The allocation header reports the rounded block size and the block
    // is rediscovered as live.
    let alloc: AllocationHeader = pool.pmem().read(user - ALLOC_HDR_SIZE as u64);
    assert_eq!(alloc.size % 128, 0);
    assert!(alloc.size >= 500 + ALLOC_HDR_SIZE as u64);
    assert_eq!(pool.usable_size(user), alloc.size - ALLOC_DATA_OFF as u64);
    assert_eq!(pool.first_object(), user);
    assert_eq!(pool.next_object(user), 0);
    assert_eq!(pool.object_count(), 1);
}

#[rstest]
fn test_uncommitted_batch_leaves_no_trace(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    {
        let pool = Pool::create(&path, pool_size(16)).expect("create");
        // Stage a batch in the volatile shadow only; never persist it.
        let mut ctx = pool.operation();
        ctx.add_entry(DEST_WORD, 0x1234, crate::operation::OpKind::Set)
            .unwrap();
        // Crash before process(): the shadow dies with the process.
    }

    let pool = Pool::open(&path).expect("recover");
    assert_eq!(pool.pmem().read::<u64>(DEST_WORD), 0);
    assert_eq!(pool.object_count(), 0);
}

#[rstest]
fn test_complete_log_replays_at_open(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    {
        let pool = Pool::create(&path, pool_size(16)).expect("create");
        // Persist the batch to the durable log but crash before applying
        // it to the target words.
        let mut redo = RedoLog::new(pool.pmem().clone(), layout::REDO_OFF);
        redo.store(0, DEST_WORD, 0xAB);
        redo.store_last(1, DEST_WORD + 8, 0xCD);
    }

    let pool = Pool::open(&path).expect("recover");
    assert_eq!(pool.pmem().read::<u64>(DEST_WORD), 0xAB);
    assert_eq!(pool.pmem().read::<u64>(DEST_WORD + 8), 0xCD);
}

#[rstest]
fn test_torn_log_is_discarded_at_open(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    {
        let pool = Pool::create(&path, pool_size(16)).expect("create");
        // Payload entries reached the log but the checksum pair did not
        // match: the classic torn commit.
        pool.pmem().write::<RedoEntry>(
            layout::REDO_OFF,
            RedoEntry {
                offset: 0xBAD0,
                value: 0xBAD1,
            },
        );
        pool.pmem().write::<RedoEntry>(
            layout::REDO_OFF + 16,
            RedoEntry {
                offset: DEST_WORD | REDO_FINISH_FLAG,
                value: 0x77,
            },
        );
    }

    let pool = Pool::open(&path).expect("recover");
    assert_eq!(pool.pmem().read::<u64>(DEST_WORD), 0, "no side effects");
    assert_eq!(
        pool.pmem().read::<RedoEntry>(layout::REDO_OFF),
        RedoEntry::default(),
        "log head zeroed",
    );
}

#[rstest]
fn test_realloc_grow_across_size_classes(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    let old_user;
    {
        let pool = Pool::create(&path, pool_size(16)).expect("create");
        let mut ctx = pool.operation();
        let mut ctor = |data: &mut [u8]| {
            data[..200].fill(0x5C);
            Ok(())
        };
        old_user = palloc::palloc_operation(
            pool.heap(),
            0,
            Some(DEST_WORD),
            200,
            Some(&mut ctor),
            &mut ctx,
        )
        .expect("alloc");

        palloc::palloc_operation(
            pool.heap(),
            old_user,
            Some(DEST_WORD),
            4000,
            None,
            &mut ctx,
        )
        .expect("realloc");
        // Crash after the redo finish but before the old block would be
        // of any transient use again.
    }

    let pool = Pool::open(&path).expect("recover");
    let new_user = pool.pmem().read::<u64>(DEST_WORD);
    assert_ne!(new_user, old_user);
    assert!(pool.pmem().slice(new_user, 200).iter().all(|b| *b == 0x5C));

    // The old block is durably free and the boot walk rediscovered it:
    // only the new allocation is live.
    let old_block = pool.heap().block_from_user_off(old_user);
    assert_eq!(old_block.state(pool.pmem()), BlockState::Free);
    assert_eq!(pool.object_count(), 1);
}

#[rstest]
fn test_huge_free_coalescing_survives_reboot(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    {
        let pool = Pool::create(&path, pool_size(16)).expect("create");
        let mut ctx = pool.operation();
        let size = 2 * layout::CHUNK_SIZE;

        let a = palloc::palloc_operation(pool.heap(), 0, None, size, None, &mut ctx)
            .expect("alloc a");
        let b = palloc::palloc_operation(pool.heap(), 0, None, size, None, &mut ctx)
            .expect("alloc b");
        palloc::palloc_operation(pool.heap(), a, None, 0, None, &mut ctx)
            .expect("free a");
        palloc::palloc_operation(pool.heap(), b, None, 0, None, &mut ctx)
            .expect("free b");
    }

    // If any two adjacent free extents had been persisted, boot would
    // reject the heap; a single spanning extent must come back.
    let pool = Pool::open(&path).expect("recover");
    let mut guard = pool.heap().get_default_bucket().lock();
    assert_eq!(guard.as_huge().len(), 1);
}

#[rstest]
fn test_replayed_log_is_idempotent(tempdir: tempfile::TempDir) {
    let path = tempdir.path().join("pool");
    {
        let pool = Pool::create(&path, pool_size(16)).expect("create");
        let mut redo = RedoLog::new(pool.pmem().clone(), layout::REDO_OFF);
        redo.store_last(0, DEST_WORD, 42);
    }

    // First open replays; a crash right after replay (before anything
    // else) must leave a state a second replay cannot disturb.
    {
        let pool = Pool::open(&path).expect("first recovery");
        assert_eq!(pool.pmem().read::<u64>(DEST_WORD), 42);
    }
    let pool = Pool::open(&path).expect("second recovery");
    assert_eq!(pool.pmem().read::<u64>(DEST_WORD), 42);
}
