//! Volatile inode handles and persistent inode initialization.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::layout::PAGE_SIZE;
use crate::layout::fs::{Inode, Timespec};
use crate::pmem::PmemMap;

/// Current wall-clock time as an on-media timestamp.
pub(crate) fn current_time() -> Timespec {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => Timespec {
            sec: elapsed.as_secs() as i64,
            nsec: elapsed.subsec_nanos() as i64,
        },
        Err(_) => Timespec::ZERO,
    }
}

/// A reference-counted volatile handle to a persistent inode.
///
/// The handle carries the reader/writer lock serializing mutation of the
/// inode and its payload, the number of open file handles, and the orphan
/// slot the inode occupies while unlinked-but-open.
pub(crate) struct Vinode {
    ino_off: u64,
    pub(crate) lock: RwLock<()>,
    open_count: AtomicU32,
    pub(crate) orphan_slot: Mutex<Option<(u64, u64)>>,
    debug_path: Mutex<String>,
}

impl Vinode {
    pub(crate) fn new(ino_off: u64, debug_path: String) -> Arc<Self> {
        Arc::new(Self {
            ino_off,
            lock: RwLock::new(()),
            open_count: AtomicU32::new(0),
            orphan_slot: Mutex::new(None),
            debug_path: Mutex::new(debug_path),
        })
    }

    #[inline]
    pub(crate) fn ino(&self) -> u64 {
        self.ino_off
    }

    /// Borrow the persistent inode behind this handle.
    #[inline]
    pub(crate) fn inode<'a>(&self, pmem: &'a PmemMap) -> &'a Inode {
        pmem.view(self.ino_off)
    }

    /// Mutable view of the persistent inode, for non-transactional fields
    /// only (times, free payload space). Structural changes hold the
    /// write half of [Self::lock]; timestamp refreshes may ride a read
    /// lock, last writer wins.
    #[inline]
    pub(crate) fn inode_mut<'a>(&self, pmem: &'a PmemMap) -> &'a mut Inode {
        pmem.view_mut(self.ino_off)
    }

    pub(crate) fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub(crate) fn handle_opened(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this was the last open handle.
    pub(crate) fn handle_closed(&self) -> bool {
        self.open_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn debug_path(&self) -> String {
        self.debug_path.lock().clone()
    }

    pub(crate) fn set_debug_path(&self, path: String) {
        *self.debug_path.lock() = path;
    }
}

impl std::fmt::Debug for Vinode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vinode")
            .field("ino", &self.ino_off)
            .field("path", &self.debug_path.lock())
            .finish()
    }
}

/// Initialize a freshly reserved inode buffer. Runs as an allocation
/// constructor, before anything durable references the block.
pub(crate) fn init_inode(data: &mut [u8], flags: u64, nlink: u64, time: Timespec) {
    data[..PAGE_SIZE].fill(0);
    let inode = overlay(data);
    inode.version = crate::layout::fs::INODE_VERSION;
    inode.uid = process_uid();
    inode.gid = process_gid();
    inode.atime = time;
    inode.ctime = time;
    inode.mtime = time;
    inode.nlink = nlink;
    inode.flags = flags;
}

/// Initialize a symlink inode; the target lives in the raw payload.
pub(crate) fn init_symlink(data: &mut [u8], mode: u32, target: &[u8], time: Timespec) {
    init_inode(data, (libc::S_IFLNK | mode) as u64, 1, time);
    let inode = overlay(data);
    inode.size = target.len() as u64;
    inode.payload[..target.len()].copy_from_slice(target);
}

fn overlay(data: &mut [u8]) -> &mut Inode {
    assert!(data.len() >= PAGE_SIZE);
    assert_eq!(data.as_ptr() as usize % align_of::<Inode>(), 0);
    unsafe { &mut *(data.as_mut_ptr() as *mut Inode) }
}

fn process_uid() -> u32 {
    #[cfg(unix)]
    unsafe {
        libc::getuid()
    }
    #[cfg(not(unix))]
    0
}

fn process_gid() -> u32 {
    #[cfg(unix)]
    unsafe {
        libc::getgid()
    }
    #[cfg(not(unix))]
    0
}

/// File metadata reported by stat and lstat.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// The inode's pool offset, which doubles as its inode number.
    pub ino: u64,
    pub size: u64,
    pub nlink: u64,
    /// `S_IF*`-encoded file type and permission bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
}

impl Metadata {
    pub(crate) fn from_inode(ino: u64, inode: &Inode) -> Self {
        Self {
            ino,
            size: inode.size,
            nlink: inode.nlink,
            mode: inode.flags as u32,
            uid: inode.uid,
            gid: inode.gid,
            atime: inode.atime,
            ctime: inode.ctime,
            mtime: inode.mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}
