//! A crash-consistent allocator and update protocol for byte-addressable
//! persistent memory, with a POSIX-style filesystem core on top.
//!
//! The pool is a memory-mapped file addressed by 64-bit offsets. The
//! redo log commits bounded batches of 8-byte word writes atomically;
//! the persistent allocator hands out offset-addressed blocks from a
//! transient bucketed index over on-media chunk metadata; the filesystem
//! consumes both to make every syscall-equivalent crash-atomic.

mod fs;
mod heap;
mod layout;
mod operation;
mod palloc;
mod pmem;
mod pool;
mod redo_log;
#[cfg(test)]
mod tests;
mod utils;

pub use self::fs::{
    FileHandle,
    Filesystem,
    FsCreateError,
    FsError,
    FsOpenError,
    Metadata,
};
pub use self::layout::fs::Timespec;
pub use self::pool::{Pool, PoolCreateError, PoolOpenError};
