//! Memory blocks: the unit of reservation handed out by the heap.
//!
//! A block is either a span of whole chunks (huge) or a span of units
//! inside a run. Durable state transitions go through [MemoryBlock::prep_hdr],
//! which appends redo entries instead of writing the metadata directly;
//! the transition only becomes real when the owning operation context is
//! processed.

use crate::layout::{
    self,
    ALLOC_DATA_OFF,
    ALLOC_HDR_SIZE,
    AllocationHeader,
    CHUNK_SIZE,
    ChunkHeader,
    ChunkKind,
    RUN_DATA_OFF,
};
use crate::operation::{OpKind, OperationContext, OperationOverflow};
use crate::pmem::PmemMap;

/// Durable state a block can be flipped to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum BlockState {
    Free,
    Allocated,
    /// Only reported, never requested: the block's bitmap bits disagree.
    Corrupt,
}

/// Location of a block within the heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct BlockLoc {
    pub zone_id: u32,
    pub chunk_id: u32,
    /// Span in chunks (huge) or units (run).
    pub size_idx: u32,
    /// First unit index within the run; zero for huge blocks.
    pub block_off: u32,
}

/// A reserved or recovered memory block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum MemoryBlock {
    Huge(BlockLoc),
    Run { loc: BlockLoc, unit_size: u64 },
}

impl MemoryBlock {
    #[inline]
    pub(crate) fn loc(&self) -> BlockLoc {
        match self {
            MemoryBlock::Huge(loc) => *loc,
            MemoryBlock::Run { loc, .. } => *loc,
        }
    }

    #[inline]
    pub(crate) fn is_huge(&self) -> bool {
        matches!(self, MemoryBlock::Huge(_))
    }

    /// Size of one allocation unit of this block.
    #[inline]
    pub(crate) fn unit_size(&self) -> u64 {
        match self {
            MemoryBlock::Huge(_) => CHUNK_SIZE as u64,
            MemoryBlock::Run { unit_size, .. } => *unit_size,
        }
    }

    /// Total block size including the 64-byte prefix, always
    /// `size_idx * unit_size`.
    #[inline]
    pub(crate) fn total_size(&self) -> u64 {
        self.loc().size_idx as u64 * self.unit_size()
    }

    /// Pool offset of the first byte of the block.
    pub(crate) fn block_off_in_pool(&self) -> u64 {
        let loc = self.loc();
        let chunk = layout::chunk_off(loc.zone_id, loc.chunk_id);
        match self {
            MemoryBlock::Huge(_) => chunk,
            MemoryBlock::Run { unit_size, .. } => {
                chunk + RUN_DATA_OFF as u64 + loc.block_off as u64 * unit_size
            },
        }
    }

    /// Pool offset of the user data.
    #[inline]
    pub(crate) fn user_off(&self) -> u64 {
        self.block_off_in_pool() + ALLOC_DATA_OFF as u64
    }

    /// Bytes usable by the caller.
    #[inline]
    pub(crate) fn usable_size(&self) -> u64 {
        self.total_size() - ALLOC_DATA_OFF as u64
    }

    /// Current durable state of the block.
    pub(crate) fn state(&self, pmem: &PmemMap) -> BlockState {
        match self {
            MemoryBlock::Huge(loc) => {
                let hdr: ChunkHeader =
                    pmem.read(layout::chunk_hdr_off(loc.zone_id, loc.chunk_id));
                match hdr.kind() {
                    ChunkKind::Free => BlockState::Free,
                    ChunkKind::Used => BlockState::Allocated,
                    _ => BlockState::Corrupt,
                }
            },
            MemoryBlock::Run { .. } => {
                let word: u64 = pmem.read(self.bitmap_word_off());
                let mask = self.bitmap_mask();
                if word & mask == mask {
                    BlockState::Allocated
                } else if word & mask == 0 {
                    BlockState::Free
                } else {
                    BlockState::Corrupt
                }
            },
        }
    }

    /// Append the single-word metadata mutation flipping this block to
    /// `state`. For huge blocks that is the packed chunk header, for run
    /// blocks an And/Or over the owning bitmap word.
    pub(crate) fn prep_hdr(
        &self,
        state: BlockState,
        ctx: &mut OperationContext,
    ) -> Result<(), OperationOverflow> {
        match self {
            MemoryBlock::Huge(loc) => {
                let kind = match state {
                    BlockState::Allocated => ChunkKind::Used,
                    BlockState::Free => ChunkKind::Free,
                    BlockState::Corrupt => unreachable!("BUG: invalid target state"),
                };
                let hdr_off = layout::chunk_hdr_off(loc.zone_id, loc.chunk_id);
                let packed = ChunkHeader::new(kind, loc.size_idx).pack();
                ctx.add_entry(hdr_off, packed, OpKind::Set)
            },
            MemoryBlock::Run { .. } => {
                let word_off = self.bitmap_word_off();
                let mask = self.bitmap_mask();
                match state {
                    BlockState::Allocated => ctx.add_entry(word_off, mask, OpKind::Or),
                    BlockState::Free => ctx.add_entry(word_off, !mask, OpKind::And),
                    BlockState::Corrupt => unreachable!("BUG: invalid target state"),
                }
            },
        }
    }

    /// Write and persist the allocation header in front of the user data.
    pub(crate) fn write_alloc_header(&self, pmem: &PmemMap) {
        let loc = self.loc();
        let hdr_off = self.user_off() - ALLOC_HDR_SIZE as u64;
        pmem.write(
            hdr_off,
            AllocationHeader::new(loc.chunk_id, loc.zone_id, self.total_size()),
        );
        pmem.persist(hdr_off, ALLOC_HDR_SIZE);
    }

    /// Pool offset of the bitmap word owning this run block.
    pub(crate) fn bitmap_word_off(&self) -> u64 {
        let loc = self.loc();
        debug_assert!(!self.is_huge());
        let word = (loc.block_off / 64) as u64;
        layout::chunk_off(loc.zone_id, loc.chunk_id) + 8 + word * 8
    }

    /// Bit mask of this run block within its bitmap word. Reservations
    /// never cross a word, so the mask is always contiguous.
    pub(crate) fn bitmap_mask(&self) -> u64 {
        let loc = self.loc();
        debug_assert!(!self.is_huge());
        let shift = loc.block_off % 64;
        debug_assert!(shift + loc.size_idx <= 64, "BUG: mask crosses bitmap word");
        let bits = if loc.size_idx == 64 {
            u64::MAX
        } else {
            (1u64 << loc.size_idx) - 1
        };
        bits << shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_block(block_off: u32, size_idx: u32) -> MemoryBlock {
        MemoryBlock::Run {
            loc: BlockLoc {
                zone_id: 0,
                chunk_id: 2,
                size_idx,
                block_off,
            },
            unit_size: 256,
        }
    }

    #[test]
    fn test_bitmap_mask_shapes() {
        assert_eq!(run_block(0, 1).bitmap_mask(), 0b1);
        assert_eq!(run_block(0, 4).bitmap_mask(), 0b1111);
        assert_eq!(run_block(6, 2).bitmap_mask(), 0b11 << 6);
        assert_eq!(run_block(64, 64).bitmap_mask(), u64::MAX);
        assert_eq!(run_block(126, 2).bitmap_mask(), 0b11 << 62);
    }

    #[test]
    fn test_block_offsets() {
        let huge = MemoryBlock::Huge(BlockLoc {
            zone_id: 0,
            chunk_id: 1,
            size_idx: 2,
            block_off: 0,
        });
        assert_eq!(huge.block_off_in_pool(), layout::chunk_off(0, 1));
        assert_eq!(huge.user_off() % 64, 0);
        assert_eq!(huge.total_size(), 2 * CHUNK_SIZE as u64);
        assert_eq!(huge.usable_size(), 2 * CHUNK_SIZE as u64 - 64);

        let run = run_block(3, 2);
        assert_eq!(
            run.block_off_in_pool(),
            layout::chunk_off(0, 2) + RUN_DATA_OFF as u64 + 3 * 256,
        );
        assert_eq!(run.user_off() % 64, 0);
        assert_eq!(run.total_size(), 512);

        // The second bitmap word starts at unit 64.
        assert_eq!(
            run_block(64, 1).bitmap_word_off(),
            layout::chunk_off(0, 2) + 16,
        );
    }
}
