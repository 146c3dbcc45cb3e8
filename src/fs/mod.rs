//! The POSIX-style filesystem built on the persistent heap.
//!
//! Every syscall-equivalent resolves its paths under the pool's path
//! lock, takes the affected vinode locks, and commits its durable word
//! writes in a single redo batch through a [transaction::Transaction].
//! Objects are allocated with constructors so a new inode, directory page
//! or data block is fully formed before anything durable references it.

pub(crate) mod dir;
pub(crate) mod file;
pub(crate) mod inode;
pub(crate) mod orphan;
pub(crate) mod transaction;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

pub use self::inode::Metadata;
use self::inode::Vinode;
use self::transaction::Transaction;
use crate::layout::fs::{INODE_NLINK_OFF, TYPE_INODE};
use crate::layout::PAGE_SIZE;
use crate::operation::OpKind;
use crate::palloc::{self, AllocError};
use crate::pool::{Pool, PoolCreateError, PoolOpenError, SB_ROOT_OFF, SB_ROOT_TYPE_OFF};

/// Depth cap when following symlinks during resolution.
const SYMLINK_MAX_DEPTH: u32 = 8;

#[derive(Debug, thiserror::Error)]
/// Errno-style filesystem errors.
pub enum FsError {
    #[error("no space left on pool")]
    NoSpace,
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("file name too long")]
    NameTooLong,
    #[error("unsupported open flag")]
    UnsupportedFlag,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("too many levels of symbolic links")]
    TooManySymlinks,
    #[error("file not open for this access")]
    BadAccess,
}

impl FsError {
    /// The errno value a libc surface would report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NoSpace => libc::ENOSPC,
            FsError::Cancelled => libc::ECANCELED,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::UnsupportedFlag => libc::EINVAL,
            FsError::NotPermitted => libc::EPERM,
            FsError::TooManySymlinks => libc::ELOOP,
            FsError::BadAccess => libc::EBADF,
        }
    }
}

impl From<AllocError> for FsError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfSpace => FsError::NoSpace,
            AllocError::Cancelled => FsError::Cancelled,
            AllocError::TxOverflow(_) => FsError::InvalidArgument,
        }
    }
}

#[derive(Debug, thiserror::Error)]
/// An error preventing a filesystem pool from being created.
pub enum FsCreateError {
    #[error(transparent)]
    Pool(#[from] PoolCreateError),
    #[error("failed to initialize the filesystem root: {0}")]
    Root(#[from] FsError),
}

#[derive(Debug, thiserror::Error)]
/// An error preventing a filesystem pool from being opened.
pub enum FsOpenError {
    #[error(transparent)]
    Pool(#[from] PoolOpenError),
    #[error("pool carries no filesystem root")]
    MissingRoot,
    #[error("root inode carries unsupported version {0}")]
    BadRootVersion(u32),
    #[error("orphaned-inode sweep failed: {0}")]
    Sweep(FsError),
}

/// A filesystem over a persistent-memory pool. Cheap to clone; all
/// clones share the pool.
#[derive(Clone)]
pub struct Filesystem {
    core: Arc<FsCore>,
}

/// An open file. The handle keeps its vinode referenced; dropping the
/// handle is the close.
pub struct FileHandle {
    core: Arc<FsCore>,
    vinode: Arc<Vinode>,
    flags: i32,
    pos: Mutex<u64>,
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.core.handle_closed(&self.vinode);
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.vinode.debug_path())
            .field("flags", &self.flags)
            .finish()
    }
}

struct FsCore {
    pool: Pool,
    vinodes: Mutex<HashMap<u64, Weak<Vinode>>>,
    /// Held for reading while resolving which parent directory a path
    /// refers to; rename takes it for writing.
    path_lock: RwLock<()>,
    orphan_locks: orphan::PageLocks,
    root: Arc<Vinode>,
    cwd: RwLock<Arc<Vinode>>,
}

impl Filesystem {
    /// Create a pool of `size` bytes at `path` and plant the root
    /// directory in it.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self, FsCreateError> {
        let pool = Pool::create(path, size)?;

        let root_off = {
            let mut ctx = pool.operation();
            let mut ctor = |data: &mut [u8]| {
                inode::init_inode(
                    data,
                    (libc::S_IFDIR | 0o777) as u64,
                    2,
                    inode::current_time(),
                );
                Ok(())
            };
            ctx.add_entry(SB_ROOT_TYPE_OFF, TYPE_INODE, OpKind::Set)
                .map_err(AllocError::from)
                .map_err(FsError::from)?;
            palloc::palloc_operation(
                pool.heap(),
                0,
                Some(SB_ROOT_OFF),
                PAGE_SIZE,
                Some(&mut ctor),
                &mut ctx,
            )
            .map_err(FsError::from)?
        };

        Ok(Self::assemble(pool, root_off))
    }

    /// Open an existing filesystem pool. Redo recovery has already run by
    /// the time the pool opens; the sweep below reclaims inodes orphaned
    /// by a crash.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FsOpenError> {
        let pool = Pool::open(path)?;
        let root = pool.superblock().root_inode;
        if root.is_null() {
            return Err(FsOpenError::MissingRoot);
        }
        let root_inode: &crate::layout::fs::Inode = pool.pmem().view(root.off);
        if root_inode.version != crate::layout::fs::INODE_VERSION {
            return Err(FsOpenError::BadRootVersion(root_inode.version));
        }

        let fs = Self::assemble(pool, root.off);
        fs.core.sweep_orphans().map_err(FsOpenError::Sweep)?;
        Ok(fs)
    }

    fn assemble(pool: Pool, root_off: u64) -> Self {
        let root = Vinode::new(root_off, "/".to_string());
        let core = FsCore {
            pool,
            vinodes: Mutex::new(HashMap::from([(root_off, Arc::downgrade(&root))])),
            path_lock: RwLock::new(()),
            orphan_locks: Mutex::new(HashMap::new()),
            cwd: RwLock::new(root.clone()),
            root,
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// The underlying pool, for statistics.
    pub fn pool(&self) -> &Pool {
        &self.core.pool
    }

    /// Open (and possibly create) a file relative to the working
    /// directory.
    pub fn open_file(
        &self,
        path: &str,
        flags: i32,
        mode: u32,
    ) -> Result<FileHandle, FsError> {
        self.openat(None, path, flags, mode)
    }

    /// Open (and possibly create) a file relative to an open directory
    /// handle, or to the working directory when `at` is `None`.
    #[tracing::instrument("fs::openat", skip_all, fields(path = path, flags = flags))]
    pub fn openat(
        &self,
        at: Option<&FileHandle>,
        path: &str,
        flags: i32,
        mode: u32,
    ) -> Result<FileHandle, FsError> {
        file::validate_open_flags(flags)?;
        let core = &self.core;
        let _resolve = core.path_lock.read();
        let start = core.start_dir(at);

        if file::is_tmpfile(flags) {
            if !file::is_writable(flags) {
                return Err(FsError::InvalidArgument);
            }
            let dir = core.resolve_vinode(&start, path, true, 0)?;
            if !dir.inode(core.pool.pmem()).is_dir() {
                return Err(FsError::NotADirectory);
            }
            return core.create_tmpfile(self, mode);
        }

        let (parent, name) = core.resolve_parent(&start, path)?;

        // An empty final component means the path names `start` or the
        // root itself; only a directory open makes sense there.
        if name.is_empty() {
            if flags & libc::O_CREAT != 0 {
                return Err(FsError::IsADirectory);
            }
            return core.finish_open(self, parent, flags);
        }

        let parent_guard = parent.lock.write();
        match dir::lookup(&core.pool, parent.ino(), &name) {
            Some(slot) => {
                if flags & (libc::O_CREAT | libc::O_EXCL)
                    == libc::O_CREAT | libc::O_EXCL
                {
                    return Err(FsError::Exists);
                }
                let vinode = core.vinode_for(slot.inode_off, &parent, &name);
                // The symlink walk re-enters the parent; release it first.
                drop(parent_guard);
                let vinode = core.follow_if_symlink(&parent, vinode, 0)?;
                core.finish_open(self, vinode, flags)
            },
            None => {
                if flags & libc::O_CREAT == 0 {
                    return Err(FsError::NotFound);
                }
                if flags & libc::O_DIRECTORY != 0 {
                    return Err(FsError::NotFound);
                }
                let vinode = core.create_entry(&parent, &name, || {
                    ((libc::S_IFREG | (mode & 0o7777)) as u64, 1)
                })?;
                drop(parent_guard);
                core.finish_open(self, vinode, flags)
            },
        }
    }

    /// Close an open file. Equivalent to dropping the handle.
    pub fn close(&self, handle: FileHandle) {
        drop(handle);
    }

    /// Read from the handle's position, advancing it.
    pub fn read(&self, handle: &FileHandle, buf: &mut [u8]) -> Result<usize, FsError> {
        if !file::is_readable(handle.flags) {
            return Err(FsError::BadAccess);
        }
        let core = &self.core;
        let _guard = handle.vinode.lock.read();
        let mut pos = handle.pos.lock();
        let n = file::read_at(&core.pool, &handle.vinode, *pos, buf);
        *pos += n as u64;

        if handle.flags & libc::O_NOATIME == 0 {
            let now = inode::current_time();
            let ino = handle.vinode.inode_mut(core.pool.pmem());
            ino.atime = now;
            core.pool.pmem().persist(handle.vinode.ino(), 96);
        }
        Ok(n)
    }

    /// Write at the handle's position (or the end with O_APPEND),
    /// advancing it.
    pub fn write(&self, handle: &FileHandle, data: &[u8]) -> Result<usize, FsError> {
        if !file::is_writable(handle.flags) {
            return Err(FsError::BadAccess);
        }
        let core = &self.core;
        let _guard = handle.vinode.lock.write();
        if !handle.vinode.inode(core.pool.pmem()).is_regular() {
            return Err(FsError::IsADirectory);
        }

        let mut pos = handle.pos.lock();
        if handle.flags & libc::O_APPEND != 0 {
            *pos = handle.vinode.inode(core.pool.pmem()).size;
        }
        let n = file::write_at(&core.pool, &handle.vinode, *pos, data)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Reposition the handle.
    pub fn seek(&self, handle: &FileHandle, from: SeekFrom) -> Result<u64, FsError> {
        let size = handle.vinode.inode(self.core.pool.pmem()).size;
        let mut pos = handle.pos.lock();
        let new = match from {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => size.checked_add_signed(delta),
            SeekFrom::Current(delta) => pos.checked_add_signed(delta),
        };
        match new {
            Some(new) => {
                *pos = new;
                Ok(new)
            },
            None => Err(FsError::InvalidArgument),
        }
    }

    /// Metadata of an open file.
    pub fn fstat(&self, handle: &FileHandle) -> Metadata {
        let _guard = handle.vinode.lock.read();
        Metadata::from_inode(
            handle.vinode.ino(),
            handle.vinode.inode(self.core.pool.pmem()),
        )
    }

    /// Metadata of the file at `path`, following a final symlink.
    pub fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        self.core.stat_impl(path, true)
    }

    /// Metadata of the file at `path` itself; a symlink reports `S_IFLNK`
    /// and the target length.
    pub fn lstat(&self, path: &str) -> Result<Metadata, FsError> {
        self.core.stat_impl(path, false)
    }

    /// Create a hard link `newpath` referring to the inode of `oldpath`.
    #[tracing::instrument("fs::link", skip_all)]
    pub fn link(&self, oldpath: &str, newpath: &str) -> Result<(), FsError> {
        let core = &self.core;
        let _resolve = core.path_lock.read();
        let cwd = core.cwd.read().clone();

        let source = core.resolve_vinode(&cwd, oldpath, false, 0)?;
        if source.inode(core.pool.pmem()).is_dir() {
            return Err(FsError::NotPermitted);
        }
        let (parent, name) = core.resolve_parent(&cwd, newpath)?;
        if name.is_empty() {
            return Err(FsError::Exists);
        }

        // Directory locks come before file locks everywhere, so the
        // parent is taken first; the source is never a directory here.
        let _parent_guard = parent.lock.write();
        let _source_guard = source.lock.write();
        if dir::lookup(&core.pool, parent.ino(), &name).is_some() {
            return Err(FsError::Exists);
        }

        let slot = dir::find_free_slot(&core.pool, parent.ino())?;
        dir::stage_name(&core.pool, &slot, &name);

        let nlink = source.inode(core.pool.pmem()).nlink;
        let elems = dir::num_elements(&core.pool, slot.page_off);

        let mut tx = Transaction::begin(&core.pool);
        tx.set(slot.inode_word_off(), source.ino())
            .map_err(AllocError::from)?;
        tx.set(dir::page_count_off(slot.page_off), elems + 1)
            .map_err(AllocError::from)?;
        tx.set(source.ino() + INODE_NLINK_OFF, nlink + 1)
            .map_err(AllocError::from)?;
        tx.commit();

        core.touch(&parent);
        Ok(())
    }

    /// Remove the directory entry at `path`, releasing the inode when the
    /// last link and the last open handle are gone.
    #[tracing::instrument("fs::unlink", skip_all)]
    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        let core = &self.core;
        let _resolve = core.path_lock.read();
        let cwd = core.cwd.read().clone();
        let (parent, name) = core.resolve_parent(&cwd, path)?;
        if name.is_empty() {
            return Err(FsError::IsADirectory);
        }

        let _parent_guard = parent.lock.write();
        let Some(slot) = dir::lookup(&core.pool, parent.ino(), &name) else {
            return Err(FsError::NotFound);
        };
        let target = core.vinode_for(slot.inode_off, &parent, &name);
        if target.inode(core.pool.pmem()).is_dir() {
            return Err(FsError::IsADirectory);
        }

        let _target_guard = target.lock.write();
        core.remove_entry(&parent, slot, &target)?;
        drop(_target_guard);
        drop(_parent_guard);

        core.maybe_reclaim(&target);
        Ok(())
    }

    /// Rename `oldpath` to `newpath`, atomically replacing any existing
    /// destination entry.
    #[tracing::instrument("fs::rename", skip_all)]
    pub fn rename(&self, oldpath: &str, newpath: &str) -> Result<(), FsError> {
        let core = &self.core;
        let _resolve = core.path_lock.write();
        let cwd = core.cwd.read().clone();

        let (src_parent, src_name) = core.resolve_parent(&cwd, oldpath)?;
        let (dst_parent, dst_name) = core.resolve_parent(&cwd, newpath)?;
        if src_name.is_empty() || dst_name.is_empty() {
            return Err(FsError::InvalidArgument);
        }

        let (_a, _b) = lock_pair_write(&src_parent, &dst_parent);

        let Some(src_slot) = dir::lookup(&core.pool, src_parent.ino(), &src_name)
        else {
            return Err(FsError::NotFound);
        };
        let source = core.vinode_for(src_slot.inode_off, &src_parent, &src_name);
        let source_is_dir = source.inode(core.pool.pmem()).is_dir();
        // Refuse moving a directory directly into itself.
        if source_is_dir && Arc::ptr_eq(&source, &dst_parent) {
            return Err(FsError::InvalidArgument);
        }

        match dir::lookup(&core.pool, dst_parent.ino(), &dst_name) {
            Some(dst_slot) => {
                if dst_slot.inode_off == src_slot.inode_off {
                    return Ok(());
                }
                let victim = core.vinode_for(dst_slot.inode_off, &dst_parent, &dst_name);
                let victim_is_dir = victim.inode(core.pool.pmem()).is_dir();
                if victim_is_dir && !source_is_dir {
                    return Err(FsError::IsADirectory);
                }
                if !victim_is_dir && source_is_dir {
                    return Err(FsError::NotADirectory);
                }
                if victim_is_dir && !dir::is_empty(&core.pool, victim.ino()) {
                    return Err(FsError::NotEmpty);
                }

                let _victim_guard = victim.lock.write();
                let nlink = victim.inode(core.pool.pmem()).nlink;
                let unlinked = if victim_is_dir { 0 } else { nlink - 1 };
                let reserved = (unlinked == 0)
                    .then(|| orphan::reserve_slot(&core.pool, &core.orphan_locks))
                    .transpose()?;

                let src_elems = dir::num_elements(&core.pool, src_slot.page_off);
                let mut tx = Transaction::begin(&core.pool);
                tx.set(dst_slot.inode_word_off(), src_slot.inode_off)
                    .map_err(AllocError::from)?;
                tx.set(src_slot.inode_word_off(), 0).map_err(AllocError::from)?;
                tx.set(dir::page_count_off(src_slot.page_off), src_elems - 1)
                    .map_err(AllocError::from)?;
                tx.set(victim.ino() + INODE_NLINK_OFF, unlinked)
                    .map_err(AllocError::from)?;
                // A directory moving between parents carries its notional
                // ".." link; replacing a directory victim keeps the
                // destination parent's count balanced.
                if source_is_dir && src_parent.ino() != dst_parent.ino() {
                    let src_parent_nlink = src_parent.inode(core.pool.pmem()).nlink;
                    tx.set(src_parent.ino() + INODE_NLINK_OFF, src_parent_nlink - 1)
                        .map_err(AllocError::from)?;
                }
                if let Some(reserved) = &reserved {
                    orphan::stage_insert(&core.pool, tx.ctx(), reserved, victim.ino())?;
                    *victim.orphan_slot.lock() =
                        Some((reserved.page_off, reserved.slot_off));
                    let undo = victim.clone();
                    tx.on_abort(move || *undo.orphan_slot.lock() = None);
                }
                tx.commit();

                // The reserved slot's page lock must go before the reclaim
                // relocks the same page.
                drop(reserved);
                drop(_victim_guard);
                core.maybe_reclaim(&victim);
            },
            None => {
                let slot = dir::find_free_slot(&core.pool, dst_parent.ino())?;
                dir::stage_name(&core.pool, &slot, &dst_name);

                let dst_elems = dir::num_elements(&core.pool, slot.page_off);
                let src_elems = dir::num_elements(&core.pool, src_slot.page_off);
                let mut tx = Transaction::begin(&core.pool);
                tx.set(slot.inode_word_off(), src_slot.inode_off)
                    .map_err(AllocError::from)?;
                tx.set(dir::page_count_off(slot.page_off), dst_elems + 1)
                    .map_err(AllocError::from)?;
                tx.set(src_slot.inode_word_off(), 0).map_err(AllocError::from)?;
                if slot.page_off != src_slot.page_off {
                    tx.set(dir::page_count_off(src_slot.page_off), src_elems - 1)
                        .map_err(AllocError::from)?;
                } else {
                    // Same page: the add and the remove cancel out; stage
                    // the unchanged count so the merged entry is right.
                    tx.set(dir::page_count_off(src_slot.page_off), src_elems)
                        .map_err(AllocError::from)?;
                }
                if source_is_dir && src_parent.ino() != dst_parent.ino() {
                    let src_parent_nlink = src_parent.inode(core.pool.pmem()).nlink;
                    let dst_parent_nlink = dst_parent.inode(core.pool.pmem()).nlink;
                    tx.set(src_parent.ino() + INODE_NLINK_OFF, src_parent_nlink - 1)
                        .map_err(AllocError::from)?;
                    tx.set(dst_parent.ino() + INODE_NLINK_OFF, dst_parent_nlink + 1)
                        .map_err(AllocError::from)?;
                }
                tx.commit();
            },
        }

        source.set_debug_path(String::from_utf8_lossy(&dst_name).into_owned());
        core.touch(&src_parent);
        core.touch(&dst_parent);
        Ok(())
    }

    /// Create a directory.
    #[tracing::instrument("fs::mkdir", skip_all, fields(path = path))]
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let core = &self.core;
        let _resolve = core.path_lock.read();
        let cwd = core.cwd.read().clone();
        let (parent, name) = core.resolve_parent(&cwd, path)?;
        if name.is_empty() {
            return Err(FsError::Exists);
        }

        let _parent_guard = parent.lock.write();
        if dir::lookup(&core.pool, parent.ino(), &name).is_some() {
            return Err(FsError::Exists);
        }

        let parent_nlink = parent.inode(core.pool.pmem()).nlink;
        core.create_entry_with(&parent, &name, parent_nlink + 1, || {
            ((libc::S_IFDIR | (mode & 0o7777)) as u64, 2)
        })?;
        Ok(())
    }

    /// Remove an empty directory.
    #[tracing::instrument("fs::rmdir", skip_all, fields(path = path))]
    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let core = &self.core;
        let _resolve = core.path_lock.read();
        let cwd = core.cwd.read().clone();
        let (parent, name) = core.resolve_parent(&cwd, path)?;
        if name.is_empty() {
            return Err(FsError::InvalidArgument);
        }

        let _parent_guard = parent.lock.write();
        let Some(slot) = dir::lookup(&core.pool, parent.ino(), &name) else {
            return Err(FsError::NotFound);
        };
        let target = core.vinode_for(slot.inode_off, &parent, &name);
        if !target.inode(core.pool.pmem()).is_dir() {
            return Err(FsError::NotADirectory);
        }
        if !dir::is_empty(&core.pool, target.ino()) {
            return Err(FsError::NotEmpty);
        }

        let _target_guard = target.lock.write();
        let reserved = orphan::reserve_slot(&core.pool, &core.orphan_locks)?;
        let elems = dir::num_elements(&core.pool, slot.page_off);
        let parent_nlink = parent.inode(core.pool.pmem()).nlink;

        let mut tx = Transaction::begin(&core.pool);
        tx.set(slot.inode_word_off(), 0).map_err(AllocError::from)?;
        tx.set(dir::page_count_off(slot.page_off), elems - 1)
            .map_err(AllocError::from)?;
        tx.set(target.ino() + INODE_NLINK_OFF, 0)
            .map_err(AllocError::from)?;
        tx.set(parent.ino() + INODE_NLINK_OFF, parent_nlink - 1)
            .map_err(AllocError::from)?;
        orphan::stage_insert(&core.pool, tx.ctx(), &reserved, target.ino())?;
        *target.orphan_slot.lock() = Some((reserved.page_off, reserved.slot_off));
        let undo = target.clone();
        tx.on_abort(move || *undo.orphan_slot.lock() = None);
        tx.commit();

        drop(reserved);
        drop(_target_guard);
        drop(_parent_guard);

        core.touch(&parent);
        core.maybe_reclaim(&target);
        Ok(())
    }

    /// Create a symbolic link at `path` whose target is stored inside the
    /// inode payload.
    pub fn symlink(&self, target: &str, path: &str) -> Result<(), FsError> {
        if target.is_empty() || target.len() >= crate::layout::fs::INODE_PAYLOAD_SIZE {
            return Err(FsError::InvalidArgument);
        }
        let core = &self.core;
        let _resolve = core.path_lock.read();
        let cwd = core.cwd.read().clone();
        let (parent, name) = core.resolve_parent(&cwd, path)?;
        if name.is_empty() {
            return Err(FsError::Exists);
        }

        let _parent_guard = parent.lock.write();
        if dir::lookup(&core.pool, parent.ino(), &name).is_some() {
            return Err(FsError::Exists);
        }

        let slot = dir::find_free_slot(&core.pool, parent.ino())?;
        dir::stage_name(&core.pool, &slot, &name);
        let elems = dir::num_elements(&core.pool, slot.page_off);
        let target_bytes = target.as_bytes().to_vec();

        let mut tx = Transaction::begin(&core.pool);
        tx.set(dir::page_count_off(slot.page_off), elems + 1)
            .map_err(AllocError::from)?;
        let mut ctor = |data: &mut [u8]| {
            inode::init_symlink(data, 0o777, &target_bytes, inode::current_time());
            Ok(())
        };
        palloc::palloc_operation(
            core.pool.heap(),
            0,
            Some(slot.inode_word_off()),
            PAGE_SIZE,
            Some(&mut ctor),
            tx.ctx(),
        )?;
        tx.committed_by_alloc();

        core.touch(&parent);
        Ok(())
    }

    /// Names in the directory at `path`.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let core = &self.core;
        let _resolve = core.path_lock.read();
        let cwd = core.cwd.read().clone();
        let dir_v = core.resolve_vinode(&cwd, path, true, 0)?;
        if !dir_v.inode(core.pool.pmem()).is_dir() {
            return Err(FsError::NotADirectory);
        }

        let _guard = dir_v.lock.read();
        Ok(dir::list(&core.pool, dir_v.ino())
            .into_iter()
            .map(|(name, _)| String::from_utf8_lossy(&name).into_owned())
            .collect())
    }

    /// Change the working directory the relative paths resolve against.
    pub fn chdir(&self, path: &str) -> Result<(), FsError> {
        let core = &self.core;
        let _resolve = core.path_lock.read();
        let cwd = core.cwd.read().clone();
        let dir_v = core.resolve_vinode(&cwd, path, true, 0)?;
        if !dir_v.inode(core.pool.pmem()).is_dir() {
            return Err(FsError::NotADirectory);
        }
        *core.cwd.write() = dir_v;
        Ok(())
    }
}

impl FsCore {
    fn start_dir(&self, at: Option<&FileHandle>) -> Arc<Vinode> {
        match at {
            Some(handle) => handle.vinode.clone(),
            None => self.cwd.read().clone(),
        }
    }

    /// Get or build the vinode handle for an inode offset.
    fn vinode_for(&self, ino_off: u64, parent: &Arc<Vinode>, name: &[u8]) -> Arc<Vinode> {
        let mut registry = self.vinodes.lock();
        if let Some(existing) = registry.get(&ino_off).and_then(Weak::upgrade) {
            return existing;
        }
        let path = format!(
            "{}/{}",
            parent.debug_path().trim_end_matches('/'),
            String::from_utf8_lossy(name),
        );
        let vinode = Vinode::new(ino_off, path);
        registry.insert(ino_off, Arc::downgrade(&vinode));
        vinode
    }

    /// Split `path` into its parent directory and final component,
    /// walking every intermediate directory. A leading slash selects the
    /// root as the starting point; an empty final component means the
    /// path names the starting directory itself.
    fn resolve_parent(
        &self,
        start: &Arc<Vinode>,
        path: &str,
    ) -> Result<(Arc<Vinode>, Vec<u8>), FsError> {
        let (mut current, rest) = if let Some(stripped) = path.strip_prefix('/') {
            (self.root.clone(), stripped.trim_start_matches('/'))
        } else {
            (start.clone(), path)
        };

        let mut components: Vec<&str> =
            rest.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
        let Some(last) = components.pop() else {
            return Ok((current, Vec::new()));
        };
        // Parent traversal is not supported: inodes carry no parent link.
        if last == ".." {
            return Err(FsError::InvalidArgument);
        }
        dir::validate_name(last.as_bytes())?;

        for component in components {
            dir::validate_name(component.as_bytes())?;
            if component == ".." {
                return Err(FsError::InvalidArgument);
            }
            if !current.inode(self.pool.pmem()).is_dir() {
                return Err(FsError::NotADirectory);
            }
            let _guard = current.lock.read();
            let Some(slot) = dir::lookup(&self.pool, current.ino(), component.as_bytes())
            else {
                return Err(FsError::NotFound);
            };
            let next = self.vinode_for(slot.inode_off, &current, component.as_bytes());
            drop(_guard);
            current = next;
        }

        if !current.inode(self.pool.pmem()).is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok((current, last.as_bytes().to_vec()))
    }

    /// Resolve `path` to a vinode, optionally following a final symlink.
    fn resolve_vinode(
        &self,
        start: &Arc<Vinode>,
        path: &str,
        follow: bool,
        depth: u32,
    ) -> Result<Arc<Vinode>, FsError> {
        let (parent, name) = self.resolve_parent(start, path)?;
        if name.is_empty() {
            return Ok(parent);
        }

        let slot = {
            let _guard = parent.lock.read();
            dir::lookup(&self.pool, parent.ino(), &name).ok_or(FsError::NotFound)?
        };
        let vinode = self.vinode_for(slot.inode_off, &parent, &name);
        if follow {
            self.follow_if_symlink(&parent, vinode, depth)
        } else {
            Ok(vinode)
        }
    }

    /// Follow `vinode` when it is a symlink, resolving the stored target
    /// relative to `parent`.
    fn follow_if_symlink(
        &self,
        parent: &Arc<Vinode>,
        vinode: Arc<Vinode>,
        depth: u32,
    ) -> Result<Arc<Vinode>, FsError> {
        if !vinode.inode(self.pool.pmem()).is_symlink() {
            return Ok(vinode);
        }
        if depth >= SYMLINK_MAX_DEPTH {
            return Err(FsError::TooManySymlinks);
        }
        let target = {
            let _guard = vinode.lock.read();
            vinode
                .inode(self.pool.pmem())
                .symlink_target()
                .to_vec()
        };
        let target = String::from_utf8_lossy(&target).into_owned();
        self.resolve_vinode(parent, &target, true, depth + 1)
    }

    fn stat_impl(&self, path: &str, follow: bool) -> Result<Metadata, FsError> {
        let _resolve = self.path_lock.read();
        let cwd = self.cwd.read().clone();
        let vinode = self.resolve_vinode(&cwd, path, follow, 0)?;
        let _guard = vinode.lock.read();
        Ok(Metadata::from_inode(
            vinode.ino(),
            vinode.inode(self.pool.pmem()),
        ))
    }

    /// Allocate an inode and link it under `parent` in one transaction.
    /// `init` returns the flags word and initial link count.
    fn create_entry(
        &self,
        parent: &Arc<Vinode>,
        name: &[u8],
        init: impl FnOnce() -> (u64, u64),
    ) -> Result<Arc<Vinode>, FsError> {
        let parent_nlink = parent.inode(self.pool.pmem()).nlink;
        self.create_entry_with(parent, name, parent_nlink, init)
    }

    /// As [Self::create_entry], also staging `parent_nlink` as the
    /// parent's new link count (directories add one for the child).
    fn create_entry_with(
        &self,
        parent: &Arc<Vinode>,
        name: &[u8],
        parent_nlink: u64,
        init: impl FnOnce() -> (u64, u64),
    ) -> Result<Arc<Vinode>, FsError> {
        let slot = dir::find_free_slot(&self.pool, parent.ino())?;
        dir::stage_name(&self.pool, &slot, name);
        let elems = dir::num_elements(&self.pool, slot.page_off);
        let (flags, nlink) = init();

        let mut tx = Transaction::begin(&self.pool);
        tx.set(dir::page_count_off(slot.page_off), elems + 1)
            .map_err(AllocError::from)?;
        if parent_nlink != parent.inode(self.pool.pmem()).nlink {
            tx.set(parent.ino() + INODE_NLINK_OFF, parent_nlink)
                .map_err(AllocError::from)?;
        }
        let mut ctor = |data: &mut [u8]| {
            inode::init_inode(data, flags, nlink, inode::current_time());
            Ok(())
        };
        let ino_off = palloc::palloc_operation(
            self.pool.heap(),
            0,
            Some(slot.inode_word_off()),
            PAGE_SIZE,
            Some(&mut ctor),
            tx.ctx(),
        )?;
        tx.committed_by_alloc();

        self.touch(parent);
        Ok(self.vinode_for(ino_off, parent, name))
    }

    /// Create an anonymous O_TMPFILE inode parked on the orphan list from
    /// birth; it disappears with its last handle.
    fn create_tmpfile(&self, fs: &Filesystem, mode: u32) -> Result<FileHandle, FsError> {
        let reserved = orphan::reserve_slot(&self.pool, &self.orphan_locks)?;

        let used = {
            use crate::layout::fs::InodeArrayPage;
            let page: &InodeArrayPage = self.pool.pmem().view(reserved.page_off);
            page.used
        };

        let mut tx = Transaction::begin(&self.pool);
        tx.set(reserved.slot_off, TYPE_INODE).map_err(AllocError::from)?;
        tx.set(
            crate::layout::fs::InodeArrayPage::used_off(reserved.page_off),
            used + 1,
        )
        .map_err(AllocError::from)?;
        let mut ctor = |data: &mut [u8]| {
            inode::init_inode(
                data,
                (libc::S_IFREG | (mode & 0o7777)) as u64,
                0,
                inode::current_time(),
            );
            Ok(())
        };
        let ino_off = palloc::palloc_operation(
            self.pool.heap(),
            0,
            Some(reserved.slot_off + 8),
            PAGE_SIZE,
            Some(&mut ctor),
            tx.ctx(),
        )?;
        tx.committed_by_alloc();

        let vinode = Vinode::new(ino_off, "<tmpfile>".to_string());
        *vinode.orphan_slot.lock() = Some((reserved.page_off, reserved.slot_off));
        self.vinodes.lock().insert(ino_off, Arc::downgrade(&vinode));
        drop(reserved);

        vinode.handle_opened();
        Ok(FileHandle {
            core: fs.core.clone(),
            vinode,
            flags: libc::O_RDWR,
            pos: Mutex::new(0),
        })
    }

    /// Final checks and bookkeeping shared by every successful open.
    fn finish_open(
        &self,
        fs: &Filesystem,
        vinode: Arc<Vinode>,
        flags: i32,
    ) -> Result<FileHandle, FsError> {
        let inode = vinode.inode(self.pool.pmem());
        if flags & libc::O_DIRECTORY != 0 && !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if inode.is_dir() && file::is_writable(flags) {
            return Err(FsError::IsADirectory);
        }

        if flags & libc::O_TRUNC != 0 && file::is_writable(flags) && inode.is_regular() {
            let _guard = vinode.lock.write();
            if vinode.inode(self.pool.pmem()).size > 0 {
                file::free_all_blocks(&self.pool, vinode.ino())?;
            }
        }

        vinode.handle_opened();
        Ok(FileHandle {
            core: fs.core.clone(),
            vinode,
            flags,
            pos: Mutex::new(0),
        })
    }

    /// Drop one dirent of `target` and stage the orphan insert when the
    /// last link goes away. Caller holds the parent and target write
    /// locks.
    fn remove_entry(
        &self,
        parent: &Arc<Vinode>,
        slot: dir::DirSlot,
        target: &Arc<Vinode>,
    ) -> Result<(), FsError> {
        let nlink = target.inode(self.pool.pmem()).nlink;
        let will_orphan = nlink == 1;
        let reserved = will_orphan
            .then(|| orphan::reserve_slot(&self.pool, &self.orphan_locks))
            .transpose()?;

        let elems = dir::num_elements(&self.pool, slot.page_off);
        let mut tx = Transaction::begin(&self.pool);
        tx.set(slot.inode_word_off(), 0).map_err(AllocError::from)?;
        tx.set(dir::page_count_off(slot.page_off), elems - 1)
            .map_err(AllocError::from)?;
        tx.set(target.ino() + INODE_NLINK_OFF, nlink - 1)
            .map_err(AllocError::from)?;
        if let Some(reserved) = &reserved {
            orphan::stage_insert(&self.pool, tx.ctx(), reserved, target.ino())?;
            *target.orphan_slot.lock() = Some((reserved.page_off, reserved.slot_off));
            let undo = target.clone();
            tx.on_abort(move || *undo.orphan_slot.lock() = None);
        }
        tx.commit();

        self.touch(parent);
        Ok(())
    }

    /// Reclaim `vinode` now if it is orphaned and nothing holds it open.
    fn maybe_reclaim(&self, vinode: &Arc<Vinode>) {
        if vinode.open_count() > 0 {
            return;
        }
        let slot = vinode.orphan_slot.lock().take();
        if let Some((page_off, slot_off)) = slot {
            if let Err(err) = self.reclaim_inode(vinode.ino(), page_off, slot_off) {
                tracing::warn!(
                    ino = vinode.ino(),
                    error = %err,
                    "failed to reclaim orphaned inode",
                );
                *vinode.orphan_slot.lock() = Some((page_off, slot_off));
                return;
            }
            self.vinodes.lock().remove(&vinode.ino());
        }
    }

    /// Called by the handle drop: the last close of an orphaned inode
    /// reclaims it.
    fn handle_closed(&self, vinode: &Arc<Vinode>) {
        if !vinode.handle_closed() {
            return;
        }
        let _guard = vinode.lock.write();
        if vinode.inode(self.pool.pmem()).nlink == 0 {
            drop(_guard);
            self.maybe_reclaim(vinode);
        }
    }

    /// Release the payload of an orphaned inode, then free the inode and
    /// clear its orphan slot in one final batch.
    fn reclaim_inode(
        &self,
        ino_off: u64,
        page_off: u64,
        slot_off: u64,
    ) -> Result<(), FsError> {
        let inode = {
            let view: &crate::layout::fs::Inode = self.pool.pmem().view(ino_off);
            (view.is_regular(), view.is_dir())
        };

        match inode {
            (true, _) => file::free_all_blocks(&self.pool, ino_off)?,
            (_, true) => self.free_dir_pages(ino_off)?,
            _ => {},
        }

        // Page lock before the operation lane, matching the reserve path.
        let _page_guard = orphan::lock_page(&self.orphan_locks, page_off);
        let mut ctx = self.pool.operation();
        orphan::stage_remove(&self.pool, &mut ctx, page_off, slot_off)?;
        palloc::palloc_free_batch(self.pool.heap(), [ino_off], &mut ctx)?;

        tracing::debug!(ino = ino_off, "orphaned inode reclaimed");
        Ok(())
    }

    /// Free the overflow pages of an (empty) directory, tail first.
    fn free_dir_pages(&self, ino_off: u64) -> Result<(), FsError> {
        for (page_off, owner_next_off) in dir::overflow_pages(&self.pool, ino_off) {
            let mut ctx = self.pool.operation();
            ctx.add_entry(owner_next_off, 0, OpKind::Set)
                .map_err(AllocError::from)?;
            ctx.add_entry(owner_next_off + 8, 0, OpKind::Set)
                .map_err(AllocError::from)?;
            palloc::palloc_free_batch(self.pool.heap(), [page_off], &mut ctx)?;
        }
        Ok(())
    }

    /// Reclaim everything left on the orphan list. Runs at open, before
    /// any handle can exist.
    fn sweep_orphans(&self) -> Result<(), FsError> {
        let parked = orphan::parked_inodes(&self.pool);
        if parked.is_empty() {
            return Ok(());
        }

        tracing::info!(count = parked.len(), "sweeping orphaned inodes");
        for (page_off, slot_off, ino_off) in parked {
            debug_assert_eq!(
                self.pool
                    .pmem()
                    .view::<crate::layout::fs::Inode>(ino_off)
                    .nlink,
                0,
            );
            self.reclaim_inode(ino_off, page_off, slot_off)?;
        }
        Ok(())
    }

    /// Non-transactional mtime/ctime refresh; timestamps are not
    /// crash-critical.
    fn touch(&self, vinode: &Arc<Vinode>) {
        let now = inode::current_time();
        let ino = vinode.inode_mut(self.pool.pmem());
        ino.mtime = now;
        ino.ctime = now;
        self.pool.pmem().persist(vinode.ino(), 96);
    }
}

/// Take the write locks of two vinodes in address order, deduplicating
/// when they are the same handle.
fn lock_pair_write<'a>(
    a: &'a Arc<Vinode>,
    b: &'a Arc<Vinode>,
) -> (
    parking_lot::RwLockWriteGuard<'a, ()>,
    Option<parking_lot::RwLockWriteGuard<'a, ()>>,
) {
    if Arc::ptr_eq(a, b) {
        return (a.lock.write(), None);
    }
    if (Arc::as_ptr(a) as usize) < (Arc::as_ptr(b) as usize) {
        let first = a.lock.write();
        let second = b.lock.write();
        (first, Some(second))
    } else {
        let second = b.lock.write();
        let first = a.lock.write();
        (first, Some(second))
    }
}
