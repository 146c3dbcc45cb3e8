//! The orphaned-inode list: page-sized arrays of inode references forming
//! a doubly-linked chain off the superblock.
//!
//! An inode whose link count hits zero while file handles are still open
//! is parked here; the last close (or the sweep at the next pool open)
//! reclaims it. Pages are appended at the head of the chain and never
//! reclaimed, so the list keeps its high-water mark. Each page carries a
//! reserved on-media mutex area; the runtime locks live in a registry
//! rebuilt at open.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use super::FsError;
use crate::layout::fs::{INODE_ARRAY_ENTRIES, InodeArrayPage, TYPE_INODE, TYPE_INODE_ARRAY};
use crate::layout::{PAGE_SIZE, PRef};
use crate::operation::{OpKind, OperationContext};
use crate::palloc;
use crate::pool::{SB_ORPHAN_OFF, SB_ORPHAN_TYPE_OFF, Pool};

pub(crate) type PageLocks = Mutex<HashMap<u64, Arc<Mutex<()>>>>;

/// A free orphan slot, held under its page's lock until the owning
/// transaction commits or aborts.
pub(crate) struct ReservedSlot {
    pub page_off: u64,
    pub slot_off: u64,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

fn page_lock(locks: &PageLocks, page_off: u64) -> Arc<Mutex<()>> {
    locks
        .lock()
        .entry(page_off)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn head_page(pool: &Pool) -> Option<u64> {
    let head = pool.superblock().orphaned_inodes;
    (!head.is_null()).then_some(head.off)
}

/// Reserve a free slot, growing the list with a fresh page when every
/// slot of every page is taken. The page allocation commits on its own;
/// the caller must not be holding the operation lane yet.
pub(crate) fn reserve_slot(pool: &Pool, locks: &PageLocks) -> Result<ReservedSlot, FsError> {
    loop {
        let mut page_off = head_page(pool);
        while let Some(off) = page_off {
            let lock = page_lock(locks, off);
            let guard = lock.lock_arc();
            let page: &InodeArrayPage = pool.pmem().view(off);
            debug_assert!(
                page.mutex.iter().all(|b| *b == 0),
                "reserved on-media lock area was scribbled",
            );
            if (page.used as usize) < INODE_ARRAY_ENTRIES {
                if let Some(index) = page.inodes.iter().position(|slot| slot.is_null()) {
                    return Ok(ReservedSlot {
                        page_off: off,
                        slot_off: InodeArrayPage::slot_off(off, index),
                        _guard: guard,
                    });
                }
            }
            drop(guard);
            page_off = (!page.next.is_null()).then(|| page.next.off);
        }

        push_head_page(pool)?;
    }
}

/// Allocate an empty inode-array page and make it the new list head.
fn push_head_page(pool: &Pool) -> Result<(), FsError> {
    let old_head = head_page(pool);

    let mut ctx = pool.operation();
    let mut ctor = |data: &mut [u8]| {
        data[..PAGE_SIZE].fill(0);
        if let Some(old) = old_head {
            let page = unsafe { &mut *(data.as_mut_ptr() as *mut InodeArrayPage) };
            page.next = PRef::new(TYPE_INODE_ARRAY, old);
        }
        Ok(())
    };
    ctx.add_entry(SB_ORPHAN_TYPE_OFF, TYPE_INODE_ARRAY, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    let page_off = palloc::palloc_operation(
        pool.heap(),
        0,
        Some(SB_ORPHAN_OFF),
        PAGE_SIZE,
        Some(&mut ctor),
        &mut ctx,
    )?;
    drop(ctx);

    // Back-link the displaced head. The prev pointer is never used to
    // walk, so a crash leaving it stale is harmless.
    if let Some(old) = old_head {
        pool.pmem()
            .write(old + 64, PRef::new(TYPE_INODE_ARRAY, page_off));
        pool.pmem().persist(old + 64, size_of::<PRef>());
    }

    tracing::debug!(page_off, "orphan list grew by one page");
    Ok(())
}

/// Stage the word writes parking `ino_off` in the reserved slot.
pub(crate) fn stage_insert(
    pool: &Pool,
    ctx: &mut OperationContext,
    slot: &ReservedSlot,
    ino_off: u64,
) -> Result<(), FsError> {
    let used = {
        let page: &InodeArrayPage = pool.pmem().view(slot.page_off);
        page.used
    };
    ctx.add_entry(slot.slot_off, TYPE_INODE, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    ctx.add_entry(slot.slot_off + 8, ino_off, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    ctx.add_entry(InodeArrayPage::used_off(slot.page_off), used + 1, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    Ok(())
}

/// Take a page's runtime lock. Always acquired before the operation
/// lane; the reserve path holds it across its transaction the same way.
pub(crate) fn lock_page(
    locks: &PageLocks,
    page_off: u64,
) -> ArcMutexGuard<RawMutex, ()> {
    page_lock(locks, page_off).lock_arc()
}

/// Stage the word writes clearing an occupied slot. The caller holds the
/// page's lock via [lock_page].
pub(crate) fn stage_remove(
    pool: &Pool,
    ctx: &mut OperationContext,
    page_off: u64,
    slot_off: u64,
) -> Result<(), FsError> {
    let used = {
        let page: &InodeArrayPage = pool.pmem().view(page_off);
        page.used
    };
    debug_assert!(used > 0, "orphan page underflow");
    ctx.add_entry(slot_off, 0, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    ctx.add_entry(slot_off + 8, 0, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    ctx.add_entry(InodeArrayPage::used_off(page_off), used - 1, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    Ok(())
}

/// Every parked inode: `(page_off, slot_off, ino_off)`. Used by the sweep
/// at pool open, when no handles can exist and every entry is
/// reclaimable.
pub(crate) fn parked_inodes(pool: &Pool) -> Vec<(u64, u64, u64)> {
    let mut parked = Vec::new();
    let mut page_off = head_page(pool);
    while let Some(off) = page_off {
        let page: &InodeArrayPage = pool.pmem().view(off);
        // prev links are maintained lazily and only sanity-checked.
        debug_assert!(page.prev.is_null() || page.prev.type_num == TYPE_INODE_ARRAY);
        for (index, slot) in page.inodes.iter().enumerate() {
            if !slot.is_null() {
                parked.push((off, InodeArrayPage::slot_off(off, index), slot.off));
            }
        }
        page_off = (!page.next.is_null()).then(|| page.next.off);
    }
    parked
}
