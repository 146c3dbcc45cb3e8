//! The operation context accumulates the pending 8-byte word writes of one
//! logical transaction and drives them through the redo log as a single
//! atomic batch.

use smallvec::SmallVec;

use crate::pmem::PmemMap;
use crate::redo_log::{RedoEntry, RedoLog};

/// How a pending entry combines with the current durable word.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum OpKind {
    /// Write `value` to the target word.
    Set,
    /// Clear the bits missing from `value` (the stored entry is the
    /// resolved `old & value`).
    And,
    /// Set the bits of `value` (the stored entry is the resolved
    /// `old | value`).
    Or,
}

#[derive(Debug, thiserror::Error)]
/// More entries were appended to one transaction than the redo log can
/// commit. This is a programming error of the caller and fails the
/// enclosing operation without touching durable state.
#[error("operation context overflow: redo log capacity is {capacity} entries")]
pub(crate) struct OperationOverflow {
    pub capacity: usize,
}

/// Pending writes of one transaction.
///
/// `And`/`Or` entries are resolved against the current durable word (or an
/// earlier pending entry for the same word) at append time, so the redo
/// log only ever stores plain `{offset, value}` pairs. The context is
/// reusable after [Self::process].
#[derive(Debug)]
pub(crate) struct OperationContext {
    redo: RedoLog,
    entries: SmallVec<[RedoEntry; 16]>,
}

impl OperationContext {
    pub(crate) fn new(redo: RedoLog) -> Self {
        Self {
            redo,
            entries: SmallVec::new(),
        }
    }

    #[inline]
    pub(crate) fn pmem(&self) -> &PmemMap {
        self.redo.pmem()
    }

    #[inline]
    pub(crate) fn redo(&self) -> &RedoLog {
        &self.redo
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append a pending write. Entries targeting a word already pending in
    /// this context are merged in place.
    pub(crate) fn add_entry(
        &mut self,
        offset: u64,
        value: u64,
        kind: OpKind,
    ) -> Result<(), OperationOverflow> {
        debug_assert_eq!(offset % 8, 0, "BUG: redo targets must be word aligned");

        if let Some(entry) = self.entries.iter_mut().find(|e| e.offset == offset) {
            entry.value = match kind {
                OpKind::Set => value,
                OpKind::And => entry.value & value,
                OpKind::Or => entry.value | value,
            };
            return Ok(());
        }

        if self.entries.len() == self.redo.capacity() {
            return Err(OperationOverflow {
                capacity: self.redo.capacity(),
            });
        }

        let resolved = match kind {
            OpKind::Set => value,
            OpKind::And => self.pmem().read::<u64>(offset) & value,
            OpKind::Or => self.pmem().read::<u64>(offset) | value,
        };
        self.entries.push(RedoEntry {
            offset,
            value: resolved,
        });
        Ok(())
    }

    /// Commit the pending batch: the final entry is finish-flagged, the
    /// redo log persists and applies the whole batch, and the context
    /// becomes reusable. A context with no entries is a no-op.
    #[tracing::instrument("operation::process", skip_all, fields(entries = self.entries.len()))]
    pub(crate) fn process(&mut self) {
        let Some(last) = self.entries.len().checked_sub(1) else {
            return;
        };

        for (i, entry) in self.entries[..last].iter().enumerate() {
            self.redo.store(i, entry.offset, entry.value);
        }
        let entry = self.entries[last];
        self.redo.store_last(last, entry.offset, entry.value);
        self.redo.process();

        self.entries.clear();
    }

    /// Drop all pending entries without applying them.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const LOG_OFF: u64 = 4096;
    const DATA_OFF: u64 = 8192;

    fn make_ctx() -> (tempfile::TempDir, OperationContext) {
        let dir = tempfile::tempdir().unwrap();
        let file = crate::utils::create_file(&dir.path().join("pool"), false).unwrap();
        file.set_len(16384).unwrap();
        let pmem = Arc::new(PmemMap::map(&file).unwrap());
        let redo = RedoLog::new(pmem, LOG_OFF);
        (dir, OperationContext::new(redo))
    }

    #[test]
    fn test_set_entries_commit() {
        let (_dir, mut ctx) = make_ctx();

        ctx.add_entry(DATA_OFF, 7, OpKind::Set).unwrap();
        ctx.add_entry(DATA_OFF + 8, 9, OpKind::Set).unwrap();
        ctx.process();

        assert_eq!(ctx.pmem().read::<u64>(DATA_OFF), 7);
        assert_eq!(ctx.pmem().read::<u64>(DATA_OFF + 8), 9);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_and_or_resolve_against_durable_word() {
        let (_dir, mut ctx) = make_ctx();

        ctx.pmem().write::<u64>(DATA_OFF, 0b1100);
        ctx.add_entry(DATA_OFF, 0b0110, OpKind::And).unwrap();
        ctx.process();
        assert_eq!(ctx.pmem().read::<u64>(DATA_OFF), 0b0100);

        ctx.add_entry(DATA_OFF, 0b0011, OpKind::Or).unwrap();
        ctx.process();
        assert_eq!(ctx.pmem().read::<u64>(DATA_OFF), 0b0111);
    }

    #[test]
    fn test_same_offset_entries_merge() {
        let (_dir, mut ctx) = make_ctx();

        ctx.add_entry(DATA_OFF, 0xFF, OpKind::Set).unwrap();
        ctx.add_entry(DATA_OFF, 0x0F, OpKind::And).unwrap();
        ctx.add_entry(DATA_OFF, 0x30, OpKind::Or).unwrap();
        assert_eq!(ctx.len(), 1);

        ctx.process();
        assert_eq!(ctx.pmem().read::<u64>(DATA_OFF), 0x3F);
    }

    #[test]
    fn test_overflow_is_reported() {
        let (_dir, mut ctx) = make_ctx();

        let capacity = crate::layout::REDO_NUM_ENTRIES;
        for i in 0..capacity {
            ctx.add_entry(DATA_OFF + (i * 8) as u64, 1, OpKind::Set)
                .unwrap();
        }

        let err = ctx
            .add_entry(DATA_OFF + (capacity * 8) as u64, 1, OpKind::Set)
            .expect_err("capacity must be enforced");
        assert_eq!(err.capacity, capacity);
    }

    #[test]
    fn test_empty_process_is_noop() {
        let (_dir, mut ctx) = make_ctx();
        ctx.process();
        assert_eq!(
            ctx.pmem().read::<RedoEntry>(LOG_OFF),
            RedoEntry::default()
        );
    }
}
