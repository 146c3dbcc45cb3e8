//! Pool lifecycle: creation (formatting), open (verify, recover, boot)
//! and the process-wide registry of open pools.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::heap::{Heap, HeapBootError};
use crate::layout::{
    self,
    LAYOUT_VERSION,
    POOL_MIN_SIZE,
    REDO_OFF,
    SUPERBLOCK_OFF,
    Superblock,
};
use crate::operation::OperationContext;
use crate::pmem::PmemMap;
use crate::redo_log::{RedoInvalidOffset, RedoLog};
use crate::utils;

/// Pool offsets of the superblock words the filesystem updates through
/// the redo log.
pub(crate) const SB_ROOT_TYPE_OFF: u64 = 8;
pub(crate) const SB_ROOT_OFF: u64 = 16;
pub(crate) const SB_ORPHAN_TYPE_OFF: u64 = 24;
pub(crate) const SB_ORPHAN_OFF: u64 = 32;
const SB_INITIALIZED_OFF: u64 = 40;

/// Pools open in this process, by canonical path. Cross-process access is
/// rejected by the advisory file lock instead.
static OPEN_POOLS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

#[derive(Debug, thiserror::Error)]
/// An error preventing a pool from being created.
pub enum PoolCreateError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("pool size {size} is below the {min}-byte minimum")]
    TooSmall { size: u64, min: u64 },
    #[error(transparent)]
    Open(#[from] PoolOpenError),
}

#[derive(Debug, thiserror::Error)]
/// An error preventing a pool from being opened.
pub enum PoolOpenError {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The pool is open in this process or locked by another one.
    #[error("pool is already open")]
    AlreadyOpen,
    #[error("pool file is smaller than a minimal pool")]
    TooSmall,
    /// Creation crashed before the final initialized byte was persisted.
    #[error("pool was never fully created")]
    Uninitialized,
    #[error("pool layout version {found} is unsupported (expected {expected})")]
    VersionMismatch { found: u64, expected: u64 },
    #[error("heap validation failed: {0}")]
    Heap(#[from] HeapBootError),
    #[error("redo log corruption: {0}")]
    Redo(#[from] RedoInvalidOffset),
}

/// Removes the pool from the process registry when the pool drops or an
/// open attempt fails partway.
#[derive(Debug)]
struct Registration {
    path: PathBuf,
}

impl Registration {
    fn acquire(path: PathBuf) -> Result<Self, PoolOpenError> {
        let mut registry = OPEN_POOLS.lock();
        if !registry.insert(path.clone()) {
            return Err(PoolOpenError::AlreadyOpen);
        }
        Ok(Self { path })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        OPEN_POOLS.lock().remove(&self.path);
    }
}

/// An open persistent-memory pool: the mapping, the booted heap and the
/// single operation lane.
#[derive(Debug)]
pub struct Pool {
    pmem: Arc<PmemMap>,
    heap: Heap,
    operation: Mutex<OperationContext>,
    pool_size: u64,
    _registration: Registration,
    _file: std::fs::File,
}

impl Pool {
    /// Create and format a pool file of `size` bytes, then open it.
    ///
    /// The superblock's initialized byte is the very last persist of the
    /// format; a crash anywhere before it leaves a file that
    /// [Pool::open] rejects as half-formatted.
    #[tracing::instrument("pool::create", skip_all, fields(size = size))]
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self, PoolCreateError> {
        let path = path.as_ref();
        if size < POOL_MIN_SIZE {
            return Err(PoolCreateError::TooSmall {
                size,
                min: POOL_MIN_SIZE,
            });
        }

        let file = utils::create_file(path, false)?;
        file.set_len(size)?;

        {
            let pmem = PmemMap::map(&file)?;
            pmem.memset_persist(SUPERBLOCK_OFF, 0, layout::HEAP_OFF as usize);
            Heap::format(&pmem, size);

            let sb: &mut Superblock = pmem.view_mut(SUPERBLOCK_OFF);
            sb.version = LAYOUT_VERSION;
            sb.root_inode = layout::PRef::NULL;
            sb.orphaned_inodes = layout::PRef::NULL;
            pmem.persist(SUPERBLOCK_OFF, size_of::<Superblock>());

            // The last word of creation: everything behind it is walkable.
            pmem.write::<u8>(SB_INITIALIZED_OFF, 1);
            pmem.persist(SB_INITIALIZED_OFF, 1);
        }
        drop(file);

        tracing::info!(path = %path.display(), size, "pool formatted");
        Ok(Self::open(path)?)
    }

    /// Open an existing pool: map it, verify the superblock, recover the
    /// redo log and rebuild the transient heap.
    #[tracing::instrument("pool::open", skip_all)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PoolOpenError> {
        let path = path.as_ref();
        let canonical = path.canonicalize()?;
        let registration = Registration::acquire(canonical)?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        file.try_lock().map_err(|_| PoolOpenError::AlreadyOpen)?;

        let pool_size = file.metadata()?.len();
        if pool_size < POOL_MIN_SIZE {
            return Err(PoolOpenError::TooSmall);
        }

        let pmem = Arc::new(PmemMap::map(&file)?);
        let sb: &Superblock = pmem.view(SUPERBLOCK_OFF);
        if sb.initialized == 0 {
            return Err(PoolOpenError::Uninitialized);
        }
        if sb.version != LAYOUT_VERSION {
            return Err(PoolOpenError::VersionMismatch {
                found: sb.version,
                expected: LAYOUT_VERSION,
            });
        }

        // Recovery must precede any client work; the heap walk below
        // already depends on the replayed chunk metadata.
        let mut redo = RedoLog::new(pmem.clone(), REDO_OFF);
        redo.recover(check_offset(pool_size))?;

        let heap = Heap::boot(pmem.clone(), pool_size)?;

        tracing::info!(path = %path.display(), pool_size, "pool open");
        Ok(Self {
            operation: Mutex::new(OperationContext::new(redo)),
            pmem,
            heap,
            pool_size,
            _registration: registration,
            _file: file,
        })
    }

    #[inline]
    pub(crate) fn pmem(&self) -> &Arc<PmemMap> {
        &self.pmem
    }

    #[inline]
    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Total pool size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.pool_size
    }

    /// Acquire the pool's operation lane. One logical transaction holds
    /// it from first entry to commit; commits are therefore serialized,
    /// and recovery observes them in their persist order.
    #[inline]
    pub(crate) fn operation(&self) -> MutexGuard<'_, OperationContext> {
        self.operation.lock()
    }

    #[inline]
    pub(crate) fn superblock(&self) -> &Superblock {
        self.pmem.view(SUPERBLOCK_OFF)
    }

    /// Number of live heap objects; used by pool statistics.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        self.heap.for_each_object(|_| count += 1);
        count
    }

    /// User offset of the first live heap object, or zero.
    pub fn first_object(&self) -> u64 {
        crate::palloc::palloc_first(&self.heap)
    }

    /// User offset of the live heap object following `off`, or zero.
    pub fn next_object(&self, off: u64) -> u64 {
        crate::palloc::palloc_next(&self.heap, off)
    }

    /// Bytes usable by the owner of the object at `off`.
    pub fn usable_size(&self, off: u64) -> u64 {
        crate::palloc::palloc_usable_size(&self.heap, off)
    }

    /// Validate the durable redo log without modifying it: every entry of
    /// a committed-but-unapplied batch must target a word inside the pool.
    pub fn check(&self) -> bool {
        let ctx = self.operation.lock();
        ctx.redo().check(check_offset(self.pool_size)).is_ok()
    }
}

/// The redo-log offset validator: words inside the pool, excluding the
/// log region itself.
fn check_offset(pool_size: u64) -> impl Fn(u64) -> bool {
    move |off| {
        off % 8 == 0
            && off + 8 <= pool_size
            && !(REDO_OFF..layout::HEAP_OFF).contains(&off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool_size() -> u64 {
        layout::HEAP_OFF + (layout::ZONE_META_SIZE + 8 * layout::CHUNK_SIZE) as u64
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");

        let pool = Pool::create(&path, small_pool_size()).expect("create");
        assert_eq!(pool.object_count(), 0);
        assert_eq!(pool.superblock().version, LAYOUT_VERSION);
        drop(pool);

        let pool = Pool::open(&path).expect("reopen");
        assert!(pool.superblock().root_inode.is_null());
    }

    #[test]
    fn test_double_open_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");

        let _pool = Pool::create(&path, small_pool_size()).expect("create");
        let err = Pool::open(&path).expect_err("second open must fail");
        assert!(matches!(err, PoolOpenError::AlreadyOpen));
    }

    #[test]
    fn test_half_formatted_pool_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");

        // A file of the right size that never finished formatting.
        let file = utils::create_file(&path, false).unwrap();
        file.set_len(small_pool_size()).unwrap();
        drop(file);

        let err = Pool::open(&path).expect_err("open must fail");
        assert!(matches!(err, PoolOpenError::Uninitialized));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");

        let pool = Pool::create(&path, small_pool_size()).expect("create");
        pool.pmem().write::<u64>(0, 999);
        drop(pool);

        let err = Pool::open(&path).expect_err("open must fail");
        assert!(matches!(
            err,
            PoolOpenError::VersionMismatch { found: 999, .. },
        ));
    }

    #[test]
    fn test_too_small_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");

        let err = Pool::create(&path, 4096).expect_err("create must fail");
        assert!(matches!(err, PoolCreateError::TooSmall { .. }));
    }
}
