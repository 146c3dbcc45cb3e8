//! Directory pages: entry lookup, free-slot management and listing.
//!
//! A directory inode holds its first page inline in the payload; overflow
//! pages chain through `next`. A dirent is live when its inode word is
//! nonzero, so adding an entry is: write the name into a dead slot
//! (harmless if the transaction never commits), then flip the inode word
//! and the element count through the redo log.

use super::FsError;
use crate::layout::PAGE_SIZE;
use crate::layout::fs::{DirPage, NAME_MAX, TYPE_DIR_PAGE};
use crate::operation::OpKind;
use crate::palloc;
use crate::pool::Pool;

/// Pool offset of the directory page inlined in an inode's payload.
pub(crate) fn inline_page_off(ino_off: u64) -> u64 {
    ino_off + 96
}

/// Validate one path component.
pub(crate) fn validate_name(name: &[u8]) -> Result<(), FsError> {
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// A located directory entry.
#[derive(Debug, Copy, Clone)]
pub(crate) struct DirSlot {
    /// Pool offset of the owning page.
    pub page_off: u64,
    pub index: usize,
    /// Inode offset the entry points at (zero for a free slot).
    pub inode_off: u64,
}

impl DirSlot {
    /// Pool offset of the slot's inode word.
    pub(crate) fn inode_word_off(&self) -> u64 {
        DirPage::dirent_inode_off(self.page_off, self.index)
    }
}

/// Find the live entry named `name`.
pub(crate) fn lookup(pool: &Pool, dir_ino_off: u64, name: &[u8]) -> Option<DirSlot> {
    let mut page_off = inline_page_off(dir_ino_off);
    loop {
        let page: &DirPage = pool.pmem().view(page_off);
        for (index, dirent) in page.dentries.iter().enumerate() {
            if !dirent.is_empty() && dirent.name_bytes() == name {
                return Some(DirSlot {
                    page_off,
                    index,
                    inode_off: dirent.inode_off,
                });
            }
        }
        if page.next.is_null() {
            return None;
        }
        page_off = page.next.off;
    }
}

/// Find a dead slot, growing the page chain when every slot is live. A
/// chain-growing allocation commits on its own through the operation
/// lane, which the caller must not be holding yet.
pub(crate) fn find_free_slot(pool: &Pool, dir_ino_off: u64) -> Result<DirSlot, FsError> {
    let mut page_off = inline_page_off(dir_ino_off);
    loop {
        let page: &DirPage = pool.pmem().view(page_off);
        for (index, dirent) in page.dentries.iter().enumerate() {
            if dirent.is_empty() {
                return Ok(DirSlot {
                    page_off,
                    index,
                    inode_off: 0,
                });
            }
        }
        if page.next.is_null() {
            break;
        }
        page_off = page.next.off;
    }

    let new_page = append_dir_page(pool, page_off)?;
    Ok(DirSlot {
        page_off: new_page,
        index: 0,
        inode_off: 0,
    })
}

/// Allocate an empty overflow directory page and link it behind the
/// chain's tail.
fn append_dir_page(pool: &Pool, tail_off: u64) -> Result<u64, FsError> {
    let mut ctx = pool.operation();
    let mut ctor = |data: &mut [u8]| {
        data[..PAGE_SIZE].fill(0);
        Ok(())
    };
    ctx.add_entry(tail_off + 8, TYPE_DIR_PAGE, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    let page_off = palloc::palloc_operation(
        pool.heap(),
        0,
        Some(tail_off + 16),
        PAGE_SIZE,
        Some(&mut ctor),
        &mut ctx,
    )?;
    Ok(page_off)
}

/// Write `name` into a dead slot. Nothing references the slot until the
/// inode word flips, so this is a plain persisted store.
pub(crate) fn stage_name(pool: &Pool, slot: &DirSlot, name: &[u8]) {
    debug_assert!(name.len() <= NAME_MAX);
    let page: &mut DirPage = pool.pmem().view_mut(slot.page_off);
    page.dentries[slot.index].set_name(name);
    let name_off = DirPage::dirent_name_off(slot.page_off, slot.index);
    pool.pmem().persist(name_off, 256);
}

/// The current element count of the page owning `slot`, used to stage the
/// incremented or decremented count in a transaction.
pub(crate) fn num_elements(pool: &Pool, page_off: u64) -> u64 {
    let page: &DirPage = pool.pmem().view(page_off);
    page.num_elements
}

/// Pool offset of a page's element-count word.
pub(crate) fn page_count_off(page_off: u64) -> u64 {
    DirPage::num_elements_off(page_off)
}

/// Whether the directory holds no live entries at all.
pub(crate) fn is_empty(pool: &Pool, dir_ino_off: u64) -> bool {
    let mut page_off = inline_page_off(dir_ino_off);
    loop {
        let page: &DirPage = pool.pmem().view(page_off);
        if page.num_elements != 0 {
            return false;
        }
        if page.next.is_null() {
            return true;
        }
        page_off = page.next.off;
    }
}

/// List the live entries of a directory.
pub(crate) fn list(pool: &Pool, dir_ino_off: u64) -> Vec<(Vec<u8>, u64)> {
    let mut entries = Vec::new();
    let mut page_off = inline_page_off(dir_ino_off);
    loop {
        let page: &DirPage = pool.pmem().view(page_off);
        for dirent in page.dentries.iter() {
            if !dirent.is_empty() {
                entries.push((dirent.name_bytes().to_vec(), dirent.inode_off));
            }
        }
        if page.next.is_null() {
            return entries;
        }
        page_off = page.next.off;
    }
}

/// Overflow page offsets of a directory, tail first; reclaimed when the
/// directory inode is freed.
pub(crate) fn overflow_pages(pool: &Pool, dir_ino_off: u64) -> Vec<(u64, u64)> {
    let mut chain = Vec::new();
    let mut page_off = inline_page_off(dir_ino_off);
    loop {
        let page: &DirPage = pool.pmem().view(page_off);
        if page.next.is_null() {
            chain.reverse();
            return chain;
        }
        chain.push((page.next.off, page_off + 8));
        page_off = page.next.off;
    }
}
