//! Cross-module scenarios: crash-recovery properties of the allocator
//! and redo log, and filesystem round trips. "Crashes" are simulated by
//! dropping the pool mapping at a chosen point and reopening the same
//! file; everything not yet committed through the redo log must vanish,
//! everything committed must survive.

mod alloc_recovery;
mod fs_basic;
mod fs_recovery;

use crate::layout;

/// A pool size of `chunks` heap chunks, the smallest interesting shapes.
pub(crate) fn pool_size(chunks: usize) -> u64 {
    layout::HEAP_OFF + (layout::ZONE_META_SIZE + chunks * layout::CHUNK_SIZE) as u64
}

#[rstest::fixture]
pub(crate) fn tempdir() -> tempfile::TempDir {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    tempfile::tempdir().expect("create temp dir")
}
