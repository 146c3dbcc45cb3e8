//! Open-flag validation and the file data path: block-extent navigation,
//! reads, writes and truncation.

use std::sync::Arc;

use super::FsError;
use super::inode::Vinode;
use crate::layout::PAGE_SIZE;
use crate::operation::OpKind;
use crate::layout::fs::{
    BLOCK_ARRAY_ENTRIES,
    BLOCK_DATA_SIZE,
    BlockArray,
    BlockExtent,
    INODE_SIZE_OFF,
    TYPE_BLOCK_ARRAY,
    TYPE_DATA_BLOCK,
};
use crate::palloc;
use crate::pool::Pool;

/// Offset of the last-block-fill word within an inode.
const INODE_LAST_BLOCK_FILL_OFF: u64 = 88;

/// Flags whose semantics this filesystem implements.
const HONORED: i32 = libc::O_ACCMODE
    | libc::O_CREAT
    | libc::O_EXCL
    | libc::O_TRUNC
    | libc::O_APPEND
    | libc::O_NOATIME
    | libc::O_TMPFILE
    | libc::O_DIRECTORY;

/// Flags accepted but treated as no-ops: their guarantees are implicit in
/// persistent memory.
const IGNORED: i32 = libc::O_CLOEXEC
    | libc::O_DIRECT
    | libc::O_DSYNC
    | libc::O_NOCTTY
    | libc::O_NONBLOCK
    | libc::O_SYNC
    | libc::O_NOFOLLOW;

/// Validate an open-flag word: reject the unsupported flags and any bits
/// this filesystem does not know about.
pub(crate) fn validate_open_flags(flags: i32) -> Result<(), FsError> {
    if flags & (libc::O_ASYNC | libc::O_PATH) != 0 {
        return Err(FsError::UnsupportedFlag);
    }
    if flags & !(HONORED | IGNORED) != 0 {
        return Err(FsError::InvalidArgument);
    }
    if flags & libc::O_ACCMODE == libc::O_ACCMODE {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

/// O_TMPFILE carries O_DIRECTORY inside it, so a plain bit test is wrong.
pub(crate) fn is_tmpfile(flags: i32) -> bool {
    flags & libc::O_TMPFILE == libc::O_TMPFILE
}

pub(crate) fn is_writable(flags: i32) -> bool {
    matches!(flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
}

pub(crate) fn is_readable(flags: i32) -> bool {
    matches!(flags & libc::O_ACCMODE, libc::O_RDONLY | libc::O_RDWR)
}

/// Pool offset of the block array inlined in an inode's payload.
fn inline_array_off(ino_off: u64) -> u64 {
    ino_off + 96
}

/// Number of data blocks currently backing the file.
fn block_count(pool: &Pool, ino_off: u64) -> u64 {
    let mut count = 0;
    let mut page_off = inline_array_off(ino_off);
    loop {
        let array: &BlockArray = pool.pmem().view(page_off);
        count += array.used;
        if array.next.is_null() {
            return count;
        }
        page_off = array.next.off;
    }
}

/// Locate the array page and slot of block `index`.
fn nth_extent(pool: &Pool, ino_off: u64, mut index: u64) -> Option<(u64, usize)> {
    let mut page_off = inline_array_off(ino_off);
    loop {
        let array: &BlockArray = pool.pmem().view(page_off);
        if index < array.used {
            return Some((page_off, index as usize));
        }
        if array.next.is_null() {
            return None;
        }
        index -= array.used;
        page_off = array.next.off;
    }
}

/// Data-block extent of block `index`.
fn extent(pool: &Pool, ino_off: u64, index: u64) -> Option<BlockExtent> {
    let (page_off, slot) = nth_extent(pool, ino_off, index)?;
    let array: &BlockArray = pool.pmem().view(page_off);
    Some(array.extents[slot])
}

/// Append one data block to the file, allocating an overflow array page
/// first when the tail page is full. Each allocation commits through the
/// pool's operation lane, which the caller must not be holding.
fn append_block(pool: &Pool, ino_off: u64) -> Result<(), FsError> {
    // Find the tail page and how full it is.
    let mut page_off = inline_array_off(ino_off);
    loop {
        let array: &BlockArray = pool.pmem().view(page_off);
        if array.next.is_null() {
            break;
        }
        page_off = array.next.off;
    }

    let used = {
        let array: &BlockArray = pool.pmem().view(page_off);
        array.used
    };
    if used as usize == BLOCK_ARRAY_ENTRIES {
        page_off = append_array_page(pool, page_off)?;
    }

    let used = {
        let array: &BlockArray = pool.pmem().view(page_off);
        array.used
    };
    let slot_off = BlockArray::extent_off(page_off, used as usize);

    let mut ctx = pool.operation();
    let mut ctor = |data: &mut [u8]| {
        data[..BLOCK_DATA_SIZE].fill(0);
        Ok(())
    };
    ctx.add_entry(
        slot_off,
        TYPE_DATA_BLOCK,
        OpKind::Set,
    )
    .map_err(palloc::AllocError::from)?;
    ctx.add_entry(
        slot_off + 16,
        BLOCK_DATA_SIZE as u64,
        OpKind::Set,
    )
    .map_err(palloc::AllocError::from)?;
    ctx.add_entry(
        BlockArray::used_off(page_off),
        used + 1,
        OpKind::Set,
    )
    .map_err(palloc::AllocError::from)?;

    // The published destination is the extent's offset word; the whole
    // extent and the used counter become visible in one commit.
    palloc::palloc_operation(
        pool.heap(),
        0,
        Some(slot_off + 8),
        BLOCK_DATA_SIZE,
        Some(&mut ctor),
        &mut ctx,
    )?;
    Ok(())
}

/// Allocate and link an empty overflow block-array page behind `tail_off`.
fn append_array_page(pool: &Pool, tail_off: u64) -> Result<u64, FsError> {
    let mut ctx = pool.operation();
    let mut ctor = |data: &mut [u8]| {
        data[..PAGE_SIZE].fill(0);
        Ok(())
    };
    // tail.next.type_num precedes tail.next.off by one word.
    ctx.add_entry(tail_off + 8, TYPE_BLOCK_ARRAY, OpKind::Set)
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

/// Read up to `buf.len()` bytes at `pos`. The caller holds the vinode
/// read lock.
pub(crate) fn read_at(pool: &Pool, vinode: &Arc<Vinode>, pos: u64, buf: &mut [u8]) -> usize {
    let inode = vinode.inode(pool.pmem());
    if pos >= inode.size {
        return 0;
    }

    let len = buf.len().min((inode.size - pos) as usize);
    let mut copied = 0;
    while copied < len {
        let at = pos + copied as u64;
        let block_idx = at / BLOCK_DATA_SIZE as u64;
        let in_block = (at % BLOCK_DATA_SIZE as u64) as usize;
        let take = (BLOCK_DATA_SIZE - in_block).min(len - copied);

        match extent(pool, vinode.ino(), block_idx) {
            Some(ext) if (in_block as u64) < ext.size => {
                let avail = (ext.size as usize - in_block).min(take);
                let src = pool.pmem().slice(ext.block.off + in_block as u64, avail);
                buf[copied..copied + avail].copy_from_slice(src);
                buf[copied + avail..copied + take].fill(0);
            },
            _ => buf[copied..copied + take].fill(0),
        }
        copied += take;
    }

    len
}

/// Write `data` at `pos`, growing the file as needed. The caller holds
/// the vinode write lock. Returns the bytes written.
pub(crate) fn write_at(
    pool: &Pool,
    vinode: &Arc<Vinode>,
    pos: u64,
    data: &[u8],
) -> Result<usize, FsError> {
    if data.is_empty() {
        return Ok(0);
    }

    let ino_off = vinode.ino();
    let end = pos + data.len() as u64;
    let needed = end.div_ceil(BLOCK_DATA_SIZE as u64);
    let mut have = block_count(pool, ino_off);
    while have < needed {
        append_block(pool, ino_off)?;
        have += 1;
    }

    // Data stores are plain persisted writes; only the size words below
    // go through the redo log.
    let mut copied = 0;
    while copied < data.len() {
        let at = pos + copied as u64;
        let block_idx = at / BLOCK_DATA_SIZE as u64;
        let in_block = (at % BLOCK_DATA_SIZE as u64) as usize;
        let take = (BLOCK_DATA_SIZE - in_block).min(data.len() - copied);

        let ext = extent(pool, ino_off, block_idx)
            .expect("block allocated above");
        pool.pmem()
            .memcpy_persist(ext.block.off + in_block as u64, &data[copied..copied + take]);
        copied += take;
    }

    let inode = vinode.inode(pool.pmem());
    debug_assert!(inode.last_block_fill as usize <= BLOCK_DATA_SIZE);
    if end > inode.size {
        let fill = end % BLOCK_DATA_SIZE as u64;
        let mut ctx = pool.operation();
        ctx.add_entry(ino_off + INODE_SIZE_OFF, end, OpKind::Set)
            .map_err(palloc::AllocError::from)?;
        ctx.add_entry(
            ino_off + INODE_LAST_BLOCK_FILL_OFF,
            if fill == 0 { BLOCK_DATA_SIZE as u64 } else { fill },
            OpKind::Set,
        )
        .map_err(palloc::AllocError::from)?;
        ctx.process();
    }

    let now = super::inode::current_time();
    let inode = vinode.inode_mut(pool.pmem());
    inode.mtime = now;
    pool.pmem().persist(ino_off, 96);

    Ok(data.len())
}

/// Free every data block and overflow array page of a regular file,
/// leaving it zero-sized. Overflow pages are unlinked tail-first so a
/// crash between batches leaves a consistent shorter chain.
pub(crate) fn free_all_blocks(pool: &Pool, ino_off: u64) -> Result<(), FsError> {
    // Collect the chain: (array page offset, owner's next-field offset).
    let mut chain = Vec::new();
    let inline_off = inline_array_off(ino_off);
    let mut page_off = inline_off;
    loop {
        let array: &BlockArray = pool.pmem().view(page_off);
        if array.next.is_null() {
            break;
        }
        chain.push((array.next.off, page_off + 8));
        page_off = array.next.off;
    }

    for (page_off, owner_next_off) in chain.into_iter().rev() {
        let array: &BlockArray = pool.pmem().view(page_off);
        let blocks: Vec<u64> = array.extents[..array.used as usize]
            .iter()
            .map(|ext| ext.block.off)
            .collect();

        let mut ctx = pool.operation();
        ctx.add_entry(owner_next_off, 0, OpKind::Set)
            .map_err(palloc::AllocError::from)?;
        ctx.add_entry(owner_next_off + 8, 0, OpKind::Set)
            .map_err(palloc::AllocError::from)?;
        palloc::palloc_free_batch(
            pool.heap(),
            blocks.into_iter().chain([page_off]),
            &mut ctx,
        )?;
    }

    // The inline extents, the counters and the size words go in one batch.
    let array: &BlockArray = pool.pmem().view(inline_off);
    let blocks: Vec<u64> = array.extents[..array.used as usize]
        .iter()
        .map(|ext| ext.block.off)
        .collect();

    let mut ctx = pool.operation();
    ctx.add_entry(BlockArray::used_off(inline_off), 0, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    ctx.add_entry(ino_off + INODE_SIZE_OFF, 0, OpKind::Set)
        .map_err(palloc::AllocError::from)?;
    ctx.add_entry(
        ino_off + INODE_LAST_BLOCK_FILL_OFF,
        0,
        OpKind::Set,
    )
    .map_err(palloc::AllocError::from)?;
    if blocks.is_empty() {
        ctx.process();
    } else {
        palloc::palloc_free_batch(pool.heap(), blocks, &mut ctx)?;
    }

    Ok(())
}
