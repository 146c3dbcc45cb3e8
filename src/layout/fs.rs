//! On-media layout of the filesystem objects consumed by the fs layer.
//!
//! Inodes are fixed 4 KiB objects whose payload is a union of the
//! directory page, the block-extent array, or raw bytes (symlink target).
//! Directory and block-array overflow pages share the inline shape and
//! chain through `next` references. Orphaned inodes are parked in
//! page-sized inode arrays forming a doubly-linked list.

use super::PRef;

pub(crate) const TYPE_INODE: u64 = 1;
pub(crate) const TYPE_DIR_PAGE: u64 = 2;
pub(crate) const TYPE_BLOCK_ARRAY: u64 = 3;
pub(crate) const TYPE_DATA_BLOCK: u64 = 4;
pub(crate) const TYPE_INODE_ARRAY: u64 = 5;

/// Maximum file-name length, excluding the terminating NUL.
pub(crate) const NAME_MAX: usize = 255;

/// Inode format version stamped into every inode.
pub(crate) const INODE_VERSION: u32 = 1;

/// Bytes of data carried by one allocated file block.
pub(crate) const BLOCK_DATA_SIZE: usize = 4096;

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// An on-media timestamp, seconds and nanoseconds since the epoch.
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };
}

/// Size of the fixed inode header preceding the payload union.
const INODE_HDR_SIZE: usize = 96;

/// Bytes available to the payload union.
pub(crate) const INODE_PAYLOAD_SIZE: usize = super::PAGE_SIZE - INODE_HDR_SIZE;

/// A 4 KiB persistent inode.
#[repr(C)]
pub(crate) struct Inode {
    pub version: u32,
    pub uid: u32,
    pub gid: u32,
    _pad: u32,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub nlink: u64,
    pub size: u64,
    /// File type and permission bits, `S_IF*`-encoded.
    pub flags: u64,
    pub last_block_fill: u64,
    pub payload: [u8; INODE_PAYLOAD_SIZE],
}

const _: () = assert!(size_of::<Inode>() == super::PAGE_SIZE);

/// Field offsets used when an inode word must change through the redo log.
pub(crate) const INODE_NLINK_OFF: u64 = 64;
pub(crate) const INODE_SIZE_OFF: u64 = 72;

impl Inode {
    #[inline]
    pub fn file_type(&self) -> u32 {
        self.flags as u32 & libc::S_IFMT
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    #[inline]
    pub fn is_regular(&self) -> bool {
        self.file_type() == libc::S_IFREG
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        self.file_type() == libc::S_IFLNK
    }

    /// The symlink target stored in the raw payload.
    pub fn symlink_target(&self) -> &[u8] {
        debug_assert!(self.is_symlink());
        let len = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        &self.payload[..len]
    }
}

/// One directory entry: an inode offset plus a NUL-terminated name.
#[repr(C)]
pub(crate) struct Dirent {
    pub inode_off: u64,
    pub name: [u8; 256],
}

const _: () = assert!(size_of::<Dirent>() == 264);

impl Dirent {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inode_off == 0
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len]
    }

    pub fn set_name(&mut self, name: &[u8]) {
        debug_assert!(name.len() <= NAME_MAX);
        self.name = [0; 256];
        self.name[..name.len()].copy_from_slice(name);
    }
}

/// Entries held by one directory page (inline or overflow).
pub(crate) const DIR_PAGE_ENTRIES: usize = 15;

/// A directory page: the inline shape inside a directory inode's payload
/// and the shape of every overflow page linked through `next`.
#[repr(C)]
pub(crate) struct DirPage {
    pub num_elements: u64,
    pub next: PRef,
    pub dentries: [Dirent; DIR_PAGE_ENTRIES],
}

const _: () = assert!(size_of::<DirPage>() <= INODE_PAYLOAD_SIZE);

impl DirPage {
    /// Pool offset of the `num_elements` word of the page at `page_off`.
    #[inline]
    pub fn num_elements_off(page_off: u64) -> u64 {
        page_off
    }

    /// Pool offset of entry `idx`'s inode word.
    #[inline]
    pub fn dirent_inode_off(page_off: u64, idx: usize) -> u64 {
        page_off + 24 + (idx * size_of::<Dirent>()) as u64
    }

    /// Pool offset of entry `idx`'s name bytes.
    #[inline]
    pub fn dirent_name_off(page_off: u64, idx: usize) -> u64 {
        Self::dirent_inode_off(page_off, idx) + 8
    }
}

/// One file-data extent.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct BlockExtent {
    pub block: PRef,
    pub size: u64,
}

const _: () = assert!(size_of::<BlockExtent>() == 24);

/// Extents held by one block-array page.
pub(crate) const BLOCK_ARRAY_ENTRIES: usize = 165;

/// The block-extent array: inline inside a regular file inode's payload,
/// with overflow pages linked through `next`.
#[repr(C)]
pub(crate) struct BlockArray {
    pub used: u64,
    pub next: PRef,
    pub extents: [BlockExtent; BLOCK_ARRAY_ENTRIES],
}

const _: () = assert!(size_of::<BlockArray>() <= INODE_PAYLOAD_SIZE);

impl BlockArray {
    #[inline]
    pub fn used_off(page_off: u64) -> u64 {
        page_off
    }

    /// Pool offset of extent `idx` (its `block` reference starts there).
    #[inline]
    pub fn extent_off(page_off: u64, idx: usize) -> u64 {
        page_off + 24 + (idx * size_of::<BlockExtent>()) as u64
    }
}

/// Orphan slots held by one inode-array page.
pub(crate) const INODE_ARRAY_ENTRIES: usize = 249;

/// A page of the orphaned-inode list. The leading 64 bytes are the
/// reserved area of the page's mutex; the runtime lock itself lives in a
/// volatile registry rebuilt at pool open.
#[repr(C)]
pub(crate) struct InodeArrayPage {
    pub mutex: [u8; 64],
    pub prev: PRef,
    pub next: PRef,
    pub used: u64,
    pub inodes: [PRef; INODE_ARRAY_ENTRIES],
    _pad: [u8; 8],
}

const _: () = assert!(size_of::<InodeArrayPage>() == super::PAGE_SIZE);

impl InodeArrayPage {
    #[inline]
    pub fn used_off(page_off: u64) -> u64 {
        page_off + 96
    }

    /// Pool offset of orphan slot `idx`.
    #[inline]
    pub fn slot_off(page_off: u64, idx: usize) -> u64 {
        page_off + 104 + (idx * size_of::<PRef>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_offsets_match_overlays() {
        assert_eq!(std::mem::offset_of!(Inode, nlink) as u64, INODE_NLINK_OFF);
        assert_eq!(std::mem::offset_of!(Inode, size) as u64, INODE_SIZE_OFF);
        assert_eq!(std::mem::offset_of!(Inode, payload), 96);

        assert_eq!(std::mem::offset_of!(DirPage, dentries), 24);
        assert_eq!(std::mem::offset_of!(BlockArray, extents), 24);
        assert_eq!(std::mem::offset_of!(InodeArrayPage, used), 96);
        assert_eq!(std::mem::offset_of!(InodeArrayPage, inodes), 104);
    }

    #[test]
    fn test_dirent_names() {
        let mut dirent = Dirent {
            inode_off: 0,
            name: [0; 256],
        };
        dirent.set_name(b"file.txt");
        assert_eq!(dirent.name_bytes(), b"file.txt");
        assert!(dirent.is_empty());

        dirent.set_name(b"x");
        assert_eq!(dirent.name_bytes(), b"x");
    }
}
