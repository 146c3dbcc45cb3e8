//! Scoped filesystem transactions.
//!
//! Every syscall-equivalent wraps its durable work in a [Transaction]
//! holding the pool's operation lane. Word writes accumulate in the
//! operation context and commit in one redo batch; transient side effects
//! (reference counts, registry inserts) register an abort closure that is
//! run in LIFO order if the transaction is dropped uncommitted.
//!
//! An allocation inside a transaction is its commit point: the allocator
//! processes the shared context, carrying every previously appended entry
//! with it. Such calls are therefore always the last durable step of
//! their transaction.

use parking_lot::MutexGuard;

use crate::operation::{OpKind, OperationContext, OperationOverflow};
use crate::pool::Pool;

pub(crate) struct Transaction<'p> {
    ctx: MutexGuard<'p, OperationContext>,
    abort_queue: Vec<Box<dyn FnOnce()>>,
    committed: bool,
}

impl<'p> Transaction<'p> {
    /// Begin a transaction, taking the pool's operation lane.
    pub(crate) fn begin(pool: &'p Pool) -> Self {
        let ctx = pool.operation();
        debug_assert!(ctx.is_empty(), "operation lane left dirty");
        Self {
            ctx,
            abort_queue: Vec::new(),
            committed: false,
        }
    }

    #[inline]
    pub(crate) fn ctx(&mut self) -> &mut OperationContext {
        &mut self.ctx
    }

    /// Append a plain word write to the pending batch.
    pub(crate) fn set(&mut self, offset: u64, value: u64) -> Result<(), OperationOverflow> {
        self.ctx.add_entry(offset, value, OpKind::Set)
    }

    /// Register an undo action for a transient side effect; runs only if
    /// the transaction aborts.
    pub(crate) fn on_abort(&mut self, f: impl FnOnce() + 'static) {
        self.abort_queue.push(Box::new(f));
    }

    /// Process any still-pending entries and disarm the abort queue.
    pub(crate) fn commit(mut self) {
        self.ctx.process();
        self.committed = true;
    }

    /// Mark the transaction committed without processing: used when an
    /// allocator call already processed the shared context.
    pub(crate) fn committed_by_alloc(mut self) {
        debug_assert!(self.ctx.is_empty(), "entries pending after allocator commit");
        self.committed = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        // Aborted: no redo records from this transaction may be applied.
        self.ctx.clear();
        for undo in self.abort_queue.drain(..).rev() {
            undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::layout;

    fn make_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let size =
            layout::HEAP_OFF + (layout::ZONE_META_SIZE + 4 * layout::CHUNK_SIZE) as u64;
        let pool = Pool::create(dir.path().join("pool"), size).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_commit_applies_entries() {
        let (_dir, pool) = make_pool();
        let target = layout::SUPERBLOCK_OFF + 2048;

        let mut tx = Transaction::begin(&pool);
        tx.set(target, 99).unwrap();
        tx.commit();

        assert_eq!(pool.pmem().read::<u64>(target), 99);
    }

    #[test]
    fn test_abort_discards_entries_and_unwinds() {
        let (_dir, pool) = make_pool();
        let target = layout::SUPERBLOCK_OFF + 2048;
        let unwound = Arc::new(AtomicU32::new(0));

        {
            let mut tx = Transaction::begin(&pool);
            tx.set(target, 42).unwrap();

            let a = unwound.clone();
            tx.on_abort(move || {
                a.fetch_add(1, Ordering::SeqCst);
                assert_eq!(a.load(Ordering::SeqCst), 2, "LIFO order expected");
            });
            let b = unwound.clone();
            tx.on_abort(move || {
                b.fetch_add(1, Ordering::SeqCst);
                assert_eq!(b.load(Ordering::SeqCst), 1, "LIFO order expected");
            });
        }

        assert_eq!(pool.pmem().read::<u64>(target), 0);
        assert_eq!(unwound.load(Ordering::SeqCst), 2);

        // The lane is reusable after an abort.
        let mut tx = Transaction::begin(&pool);
        tx.set(target, 7).unwrap();
        tx.commit();
        assert_eq!(pool.pmem().read::<u64>(target), 7);
    }
}
