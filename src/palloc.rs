//! The persistent allocator front end: malloc, free and realloc expressed
//! as one operation over the transient heap and the redo log.
//!
//! An allocation reserves a block from a bucket, runs the constructor on
//! the still-unreferenced user region, and appends the chunk-metadata flip
//! (plus the optional destination-offset publication) to the operation
//! context. Nothing durable changes until the context is processed, so a
//! constructor cancel or a crash before commit unwinds for free.

use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::lock_api::ArcMutexGuard;

use crate::heap::{BlockState, Heap, MemoryBlock};
use crate::layout::{ALLOC_DATA_OFF, ALLOC_HDR_SIZE, AllocationHeader};
use crate::operation::{OpKind, OperationContext, OperationOverflow};

/// A constructor runs on the reserved user region before the allocation
/// commits; returning `Err` cancels the reservation.
pub(crate) type Constructor<'a> = &'a mut dyn FnMut(&mut [u8]) -> Result<(), ()>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum AllocError {
    /// No free block can serve the request.
    #[error("out of persistent memory")]
    OutOfSpace,
    /// The constructor rejected the reservation; durable state is
    /// untouched.
    #[error("allocation cancelled by its constructor")]
    Cancelled,
    /// The enclosing transaction accumulated more word writes than the
    /// redo log can commit.
    #[error(transparent)]
    TxOverflow(#[from] OperationOverflow),
}

type RunLockGuard = ArcMutexGuard<parking_lot::RawMutex, ()>;

/// Modify the heap so that `dest_off` (when given) points at a block of at
/// least `size` usable bytes, releasing `existing_off` in the same atomic
/// step.
///
/// - `size == 0, existing_off != 0` frees the existing block.
/// - `size != 0, existing_off == 0` allocates a new block.
/// - both nonzero reallocates, copying the old contents.
/// - both zero is a no-op.
///
/// Returns the user offset published to `dest_off` (zero for a free). All
/// durable effects of the call, including entries the caller already
/// appended to `ctx`, commit in one redo batch.
#[tracing::instrument(
    "palloc::operation",
    skip_all,
    fields(existing_off = existing_off, size = size)
)]
pub(crate) fn palloc_operation(
    heap: &Heap,
    existing_off: u64,
    dest_off: Option<u64>,
    size: usize,
    mut constructor: Option<Constructor<'_>>,
    ctx: &mut OperationContext,
) -> Result<u64, AllocError> {
    let pmem = heap.pmem().clone();
    let sizeh = size + ALLOC_DATA_OFF;

    // Reallocation within the same size class is a no-op; nothing is
    // reserved and no redo log is produced.
    if existing_off != 0 && size != 0 {
        let alloc: AllocationHeader = pmem.read(existing_off - ALLOC_HDR_SIZE as u64);
        let bucket = heap.get_best_bucket(sizeh);
        let rounded = bucket.calc_units(sizeh) as u64 * bucket.unit_size();
        if alloc.size == rounded {
            return Ok(existing_off);
        }
    }

    let mut offset_value = 0u64;
    let mut new_block: Option<MemoryBlock> = None;
    let mut new_lock: Option<Arc<Mutex<()>>> = None;
    let mut new_lock_guard: Option<RunLockGuard> = None;

    if size != 0 {
        let bucket = heap.get_best_bucket(sizeh);
        let mut bucket_guard = bucket.lock();
        let size_idx = bucket.calc_units(sizeh);

        let Some(block) = heap.get_bestfit_block(bucket, &mut bucket_guard, size_idx)
        else {
            return Err(AllocError::OutOfSpace);
        };

        // The block is only reserved transiently, so the header write and
        // the constructor run outside any fail-safety machinery: a crash
        // here leaves the block durably free.
        block.write_alloc_header(&pmem);
        let user_off = block.user_off();
        let usable = block.usable_size() as usize;

        if let Some(ctor) = constructor.as_mut() {
            if ctor(pmem.slice_mut(user_off, usable)).is_err() {
                match block {
                    MemoryBlock::Huge(loc) => {
                        let merged = heap.coalesce_huge(bucket_guard.as_huge(), loc);
                        heap.insert_block(
                            &mut bucket_guard,
                            MemoryBlock::Huge(merged),
                        );
                    },
                    MemoryBlock::Run { .. } => {
                        heap.insert_block(&mut bucket_guard, block);
                    },
                }
                return Err(AllocError::Cancelled);
            }
            pmem.persist(user_off, usable);
        }
        offset_value = user_off;

        // The run lock must be taken before the bucket lock is released:
        // once the bucket revokes its claim another thread may operate on
        // the same bitmap word.
        if let Some(lock) = heap.block_lock(&block) {
            new_lock_guard = Some(lock.lock_arc());
            new_lock = Some(lock);
        }
        drop(bucket_guard);

        debug_assert_eq!(
            block.state(&pmem),
            BlockState::Free,
            "double free or heap corruption",
        );

        if let Err(err) = block.prep_hdr(BlockState::Allocated, ctx) {
            unwind_reservation(heap, block);
            ctx.clear();
            return Err(err.into());
        }
        new_block = Some(block);
    }

    let mut existing_block: Option<MemoryBlock> = None;
    let mut _existing_lock_guard: Option<RunLockGuard> = None;
    let mut default_guard = None;
    let mut old_size = 0u64;

    if existing_off != 0 {
        let alloc: AllocationHeader = pmem.read(existing_off - ALLOC_HDR_SIZE as u64);
        old_size = alloc.size;
        let block = heap.block_from_user_off(existing_off);

        // Both run locks may be needed (realloc); take them in address
        // order, deduplicating when the blocks share a run. Dropping the
        // new lock momentarily is safe: the reservation itself is
        // protected by the container removal, the lock only serializes
        // bitmap-word resolution, which has not happened for the existing
        // block yet.
        match (heap.block_lock(&block), &new_lock) {
            (Some(existing), Some(new)) if Arc::ptr_eq(&existing, new) => {},
            (Some(existing), Some(new))
                if (Arc::as_ptr(&existing) as usize) < (Arc::as_ptr(new) as usize) =>
            {
                drop(new_lock_guard.take());
                _existing_lock_guard = Some(existing.lock_arc());
                new_lock_guard = Some(new.lock_arc());
            },
            (Some(existing), _) => {
                _existing_lock_guard = Some(existing.lock_arc());
            },
            (None, _) => {},
        }

        debug_assert_eq!(
            block.state(&pmem),
            BlockState::Allocated,
            "double free or heap corruption",
        );

        // Huge frees coalesce with their neighbours; the default-bucket
        // lock is held through commit and reinsertion so no other thread
        // can durably free an adjacent extent in between, which would
        // break the no-adjacent-free-chunks invariant.
        let freed = if let MemoryBlock::Huge(loc) = block {
            let mut guard = heap.get_default_bucket().lock();
            let merged = heap.coalesce_huge(guard.as_huge(), loc);
            default_guard = Some(guard);
            MemoryBlock::Huge(merged)
        } else {
            block
        };

        if let Err(err) = freed.prep_hdr(BlockState::Free, ctx) {
            if let Some(block) = new_block {
                unwind_reservation(heap, block);
            }
            ctx.clear();
            return Err(err.into());
        }
        existing_block = Some(freed);
    }

    // Not-in-place realloc: carry the old contents over before the redo
    // commit. The copy targets an area recovery still treats as free.
    if existing_block.is_some() && new_block.is_some() {
        let to_cpy = old_size.min(sizeh as u64) as usize - ALLOC_DATA_OFF;
        pmem.copy_within_persist(existing_off, offset_value, to_cpy);
    }

    if let Some(dest_off) = dest_off {
        if let Err(err) = ctx.add_entry(dest_off, offset_value, OpKind::Set) {
            if let Some(block) = new_block {
                unwind_reservation(heap, block);
            }
            ctx.clear();
            return Err(err.into());
        }
    }

    ctx.process();

    // The persistent state is settled; sync the transient container with
    // the freed block. A crash before this point only loses the reclaim
    // until the next boot rediscovers it.
    if let Some(freed) = existing_block {
        match freed {
            MemoryBlock::Huge(_) => {
                let mut guard = default_guard
                    .take()
                    .expect("default bucket is locked for a huge free");
                heap.insert_block(&mut guard, freed);
            },
            MemoryBlock::Run { unit_size, .. } => {
                let bucket = heap.run_bucket_for_unit(unit_size);
                let mut guard = bucket.lock();
                heap.insert_block(&mut guard, freed);
            },
        }
    }

    Ok(offset_value)
}

/// Return a failed reservation to its bucket; the mirror image of the
/// constructor-cancel unwind for errors detected later.
fn unwind_reservation(heap: &Heap, block: MemoryBlock) {
    match block {
        MemoryBlock::Huge(loc) => {
            let mut guard = heap.get_default_bucket().lock();
            let merged = heap.coalesce_huge(guard.as_huge(), loc);
            heap.insert_block(&mut guard, MemoryBlock::Huge(merged));
        },
        MemoryBlock::Run { unit_size, .. } => {
            let bucket = heap.run_bucket_for_unit(unit_size);
            let mut guard = bucket.lock();
            heap.insert_block(&mut guard, block);
        },
    }
}

/// Free several run-class blocks in one redo batch, together with any
/// entries the caller already appended to `ctx`.
///
/// Run locks are collected for every touched run, deduplicated and taken
/// in address order. Huge blocks are not supported here; the multi-object
/// callers only ever free page-sized (run-class) objects.
pub(crate) fn palloc_free_batch(
    heap: &Heap,
    offs: impl IntoIterator<Item = u64>,
    ctx: &mut OperationContext,
) -> Result<(), AllocError> {
    let pmem = heap.pmem().clone();

    let mut blocks = Vec::new();
    let mut locks = Vec::new();
    for off in offs {
        let block = heap.block_from_user_off(off);
        assert!(!block.is_huge(), "BUG: batch free only handles run blocks");
        debug_assert_eq!(
            block.state(&pmem),
            BlockState::Allocated,
            "double free or heap corruption",
        );
        if let Some(lock) = heap.block_lock(&block) {
            locks.push(lock);
        }
        blocks.push(block);
    }

    locks.sort_by_key(|lock| Arc::as_ptr(lock) as usize);
    locks.dedup_by(|a, b| Arc::ptr_eq(a, b));
    let _guards: Vec<RunLockGuard> = locks.iter().map(|lock| lock.lock_arc()).collect();

    for block in &blocks {
        if let Err(err) = block.prep_hdr(BlockState::Free, ctx) {
            ctx.clear();
            return Err(err.into());
        }
    }

    ctx.process();

    for block in blocks {
        let MemoryBlock::Run { unit_size, .. } = block else {
            unreachable!();
        };
        let bucket = heap.run_bucket_for_unit(unit_size);
        let mut guard = bucket.lock();
        heap.insert_block(&mut guard, block);
    }

    Ok(())
}

/// Bytes usable by the owner of `off`.
pub(crate) fn palloc_usable_size(heap: &Heap, off: u64) -> u64 {
    let alloc: AllocationHeader = heap.pmem().read(off - ALLOC_HDR_SIZE as u64);
    alloc.size - ALLOC_DATA_OFF as u64
}

/// User offset of the first live allocation in the heap, or zero.
pub(crate) fn palloc_first(heap: &Heap) -> u64 {
    let mut first = 0u64;
    heap.for_each_object(|user_off| {
        if first == 0 {
            first = user_off;
        }
    });
    first
}

/// User offset of the live allocation following `off`, or zero.
pub(crate) fn palloc_next(heap: &Heap, off: u64) -> u64 {
    let mut seen = false;
    let mut next = 0u64;
    heap.for_each_object(|user_off| {
        if seen && next == 0 {
            next = user_off;
        }
        if user_off == off {
            seen = true;
        }
    });
    next
}
