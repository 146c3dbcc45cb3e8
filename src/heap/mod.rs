//! The transient side of the heap: bucket rebuild at boot, best-fit
//! reservation, run creation and huge-chunk coalescing.
//!
//! Durable chunk metadata only ever changes through redo entries appended
//! by [MemoryBlock::prep_hdr]; the eager header writes performed here
//! (split remainders, fresh run headers) always target space that is still
//! covered by an older authoritative header, so a crash at any point keeps
//! the walk consistent.

mod block;
mod bucket;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub(crate) use self::block::{BlockLoc, BlockState, MemoryBlock};
pub(crate) use self::bucket::{
    Bucket,
    Container,
    HugeContainer,
    RUN_UNIT_SIZES,
    RunContainer,
    RunFragment,
    SizeClass,
};
use crate::layout::{
    self,
    ALLOC_DATA_OFF,
    ALLOC_HDR_SIZE,
    AllocationHeader,
    CHUNK_SIZE,
    ChunkHeader,
    ChunkKind,
    RunHeader,
    ZONE_MAGIC,
    ZoneHeader,
};
use crate::pmem::PmemMap;

#[derive(Debug, thiserror::Error)]
/// The on-media heap failed validation while rebuilding the transient
/// index. The pool is rejected rather than silently patched.
pub enum HeapBootError {
    #[error("zone {zone} carries bad magic {magic:#x}")]
    BadZoneMagic { zone: u32, magic: u64 },
    #[error("zone {zone} describes {found} chunks, the pool size implies {expect}")]
    ZoneSizeMismatch { zone: u32, found: u32, expect: u32 },
    #[error("zone {zone} chunk {chunk} has an unwalkable header")]
    UnwalkableChunk { zone: u32, chunk: u32 },
    #[error("zone {zone} chunk {chunk} is a run with unknown unit size {unit_size}")]
    BadRunUnitSize { zone: u32, chunk: u32, unit_size: u64 },
    #[error("zone {zone} chunks {chunk} and the one before it are both free")]
    AdjacentFreeChunks { zone: u32, chunk: u32 },
}

/// The volatile heap: buckets plus the per-run lock registry.
#[derive(Debug)]
pub(crate) struct Heap {
    pmem: Arc<PmemMap>,
    pool_size: u64,
    default_bucket: Bucket,
    run_buckets: [Bucket; RUN_UNIT_SIZES.len()],
    run_locks: Mutex<HashMap<(u32, u32), Arc<Mutex<()>>>>,
}

impl Heap {
    /// Format the heap area of a fresh pool: stamp zone headers and mark
    /// each zone as one spanning free chunk. Runs before the superblock's
    /// `initialized` byte, so nothing here needs the redo log.
    pub(crate) fn format(pmem: &PmemMap, pool_size: u64) {
        for zone_id in 0..layout::num_zones(pool_size) {
            let num_chunks = layout::zone_num_chunks(pool_size, zone_id);
            pmem.write(layout::zone_off(zone_id), ZoneHeader::new(num_chunks));

            // A reused file may carry stale headers; clear the whole array
            // before planting the spanning free chunk.
            pmem.memset_persist(
                layout::chunk_hdr_off(zone_id, 0),
                0,
                num_chunks as usize * size_of::<ChunkHeader>(),
            );
            pmem.write(
                layout::chunk_hdr_off(zone_id, 0),
                ChunkHeader::new(ChunkKind::Free, num_chunks),
            );
            pmem.persist(layout::zone_off(zone_id), layout::ZONE_META_SIZE);
        }
    }

    /// Rebuild the transient heap from the on-media chunk headers.
    #[tracing::instrument("heap::boot", skip_all)]
    pub(crate) fn boot(pmem: Arc<PmemMap>, pool_size: u64) -> Result<Self, HeapBootError> {
        let heap = Self {
            pmem,
            pool_size,
            default_bucket: Bucket::new_huge(),
            run_buckets: std::array::from_fn(|i| {
                Bucket::new_run(SizeClass::from_index(i))
            }),
            run_locks: Mutex::new(HashMap::new()),
        };

        for zone_id in 0..layout::num_zones(pool_size) {
            heap.walk_zone(zone_id)?;
        }

        {
            let mut guard = heap.default_bucket.lock();
            let huge = guard.as_huge();
            tracing::debug!(
                free_chunk_extents = huge.len(),
                largest_extent = huge.iter().map(|(_, size)| size).max().unwrap_or(0),
                "heap booted",
            );
        }
        Ok(heap)
    }

    fn walk_zone(&self, zone_id: u32) -> Result<(), HeapBootError> {
        let zone: &ZoneHeader = self.pmem.view(layout::zone_off(zone_id));
        if zone.magic != ZONE_MAGIC {
            return Err(HeapBootError::BadZoneMagic {
                zone: zone_id,
                magic: zone.magic,
            });
        }

        let num_chunks = layout::zone_num_chunks(self.pool_size, zone_id);
        if zone.num_chunks != num_chunks {
            return Err(HeapBootError::ZoneSizeMismatch {
                zone: zone_id,
                found: zone.num_chunks,
                expect: num_chunks,
            });
        }
        let mut chunk_id = 0u32;
        let mut prev_was_free = false;
        while chunk_id < num_chunks {
            let hdr: ChunkHeader = self.pmem.read(layout::chunk_hdr_off(zone_id, chunk_id));
            match hdr.kind() {
                ChunkKind::Free => {
                    if prev_was_free {
                        return Err(HeapBootError::AdjacentFreeChunks {
                            zone: zone_id,
                            chunk: chunk_id,
                        });
                    }
                    self.default_bucket
                        .lock()
                        .as_huge()
                        .insert(zone_id, chunk_id, hdr.size_idx);
                    prev_was_free = true;
                    chunk_id += hdr.size_idx;
                },
                ChunkKind::Used => {
                    prev_was_free = false;
                    chunk_id += hdr.size_idx;
                },
                ChunkKind::Run => {
                    prev_was_free = false;
                    self.register_run(zone_id, chunk_id)?;
                    chunk_id += 1;
                },
                ChunkKind::Uninit => {
                    return Err(HeapBootError::UnwalkableChunk {
                        zone: zone_id,
                        chunk: chunk_id,
                    });
                },
            }

            if hdr.size_idx == 0 && hdr.kind() != ChunkKind::Run {
                return Err(HeapBootError::UnwalkableChunk {
                    zone: zone_id,
                    chunk: chunk_id,
                });
            }
        }

        Ok(())
    }

    /// Rediscover the free fragments of an existing run and file them into
    /// the matching class bucket.
    fn register_run(&self, zone_id: u32, chunk_id: u32) -> Result<(), HeapBootError> {
        let run: &RunHeader = self.pmem.view(layout::chunk_off(zone_id, chunk_id));
        let unit_size = run.unit_size;
        let Some(class_idx) = RUN_UNIT_SIZES.iter().position(|u| *u == unit_size) else {
            return Err(HeapBootError::BadRunUnitSize {
                zone: zone_id,
                chunk: chunk_id,
                unit_size,
            });
        };

        let mut container = self.run_buckets[class_idx].lock();
        let run_container = container.as_run();
        for (word_idx, word) in run.bitmap.iter().enumerate() {
            let base = (word_idx * 64) as u32;
            let mut bit = 0u32;
            while bit < 64 {
                if word & (1 << bit) != 0 {
                    bit += 1;
                    continue;
                }
                let start = bit;
                while bit < 64 && word & (1 << bit) == 0 {
                    bit += 1;
                }
                run_container.insert(RunFragment {
                    zone_id,
                    chunk_id,
                    block_off: base + start,
                    size_idx: bit - start,
                });
            }
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn pmem(&self) -> &Arc<PmemMap> {
        &self.pmem
    }

    /// The bucket serving a header-inclusive size.
    pub(crate) fn get_best_bucket(&self, sizeh: usize) -> &Bucket {
        match SizeClass::best_for(sizeh) {
            Some(class) => &self.run_buckets[class.index],
            None => &self.default_bucket,
        }
    }

    /// The huge bucket backing whole-chunk allocations.
    #[inline]
    pub(crate) fn get_default_bucket(&self) -> &Bucket {
        &self.default_bucket
    }

    /// The run bucket owning blocks of `unit_size` units.
    pub(crate) fn run_bucket_for_unit(&self, unit_size: u64) -> &Bucket {
        let index = RUN_UNIT_SIZES
            .iter()
            .position(|u| *u == unit_size)
            .expect("heap corruption: unknown run unit size");
        &self.run_buckets[index]
    }

    /// The lock serializing bitmap updates of one run chunk. Huge blocks
    /// have no per-block lock.
    pub(crate) fn block_lock(&self, block: &MemoryBlock) -> Option<Arc<Mutex<()>>> {
        if block.is_huge() {
            return None;
        }
        let loc = block.loc();
        let mut registry = self.run_locks.lock();
        Some(
            registry
                .entry((loc.zone_id, loc.chunk_id))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        )
    }

    /// Recover the memory block backing a user offset from its allocation
    /// header.
    pub(crate) fn block_from_user_off(&self, user_off: u64) -> MemoryBlock {
        let alloc: AllocationHeader = self.pmem.read(user_off - ALLOC_HDR_SIZE as u64);
        let zone_id = alloc.zone_id;
        let chunk_id = alloc.chunk_id as u32;
        let hdr: ChunkHeader = self.pmem.read(layout::chunk_hdr_off(zone_id, chunk_id));

        match hdr.kind() {
            ChunkKind::Used => MemoryBlock::Huge(BlockLoc {
                zone_id,
                chunk_id,
                size_idx: (alloc.size / CHUNK_SIZE as u64) as u32,
                block_off: 0,
            }),
            ChunkKind::Run => {
                let run: &RunHeader = self.pmem.view(layout::chunk_off(zone_id, chunk_id));
                let unit_size = run.unit_size;
                let data_start = layout::chunk_off(zone_id, chunk_id)
                    + layout::RUN_DATA_OFF as u64;
                let block_start = user_off - ALLOC_DATA_OFF as u64;
                MemoryBlock::Run {
                    loc: BlockLoc {
                        zone_id,
                        chunk_id,
                        size_idx: (alloc.size / unit_size) as u32,
                        block_off: ((block_start - data_start) / unit_size) as u32,
                    },
                    unit_size,
                }
            },
            kind => panic!(
                "heap corruption: allocation at {user_off:#x} points at a \
                 {kind:?} chunk ({zone_id}/{chunk_id})",
            ),
        }
    }

    /// Reserve a best-fit block from `bucket`, whose container guard the
    /// caller already holds. Returns `None` when the heap cannot serve the
    /// request.
    pub(crate) fn get_bestfit_block(
        &self,
        bucket: &Bucket,
        container: &mut Container,
        size_idx: u32,
    ) -> Option<MemoryBlock> {
        match bucket.class {
            None => {
                let huge = container.as_huge();
                let (zone_id, chunk_id, found) = huge.best_fit(size_idx)?;
                if found > size_idx {
                    self.split_free_chunk(zone_id, chunk_id, size_idx, found);
                    huge.insert(zone_id, chunk_id + size_idx, found - size_idx);
                }
                Some(MemoryBlock::Huge(BlockLoc {
                    zone_id,
                    chunk_id,
                    size_idx,
                    block_off: 0,
                }))
            },
            Some(class) => {
                let run = container.as_run();
                let frag = match run.best_fit(size_idx) {
                    Some(frag) => frag,
                    None => {
                        if !self.create_run(class, run) {
                            return None;
                        }
                        run.best_fit(size_idx)?
                    },
                };

                if frag.size_idx > size_idx {
                    run.insert(RunFragment {
                        block_off: frag.block_off + size_idx,
                        size_idx: frag.size_idx - size_idx,
                        ..frag
                    });
                }

                Some(MemoryBlock::Run {
                    loc: BlockLoc {
                        zone_id: frag.zone_id,
                        chunk_id: frag.chunk_id,
                        size_idx,
                        block_off: frag.block_off,
                    },
                    unit_size: class.unit_size,
                })
            },
        }
    }

    /// Persist the remainder header of a split free chunk. The original
    /// spanning header still covers the remainder until the reservation
    /// commits, so this write is crash-safe on its own.
    fn split_free_chunk(&self, zone_id: u32, chunk_id: u32, taken: u32, found: u32) {
        let rem_off = layout::chunk_hdr_off(zone_id, chunk_id + taken);
        self.pmem
            .write(rem_off, ChunkHeader::new(ChunkKind::Free, found - taken));
        self.pmem.persist(rem_off, size_of::<ChunkHeader>());
    }

    /// Carve a fresh run for `class` out of a free chunk and file its
    /// fragments into `container`. Returns false when no chunk is free.
    fn create_run(&self, class: SizeClass, container: &mut RunContainer) -> bool {
        let (zone_id, chunk_id) = {
            let mut guard = self.default_bucket.lock();
            let huge = guard.as_huge();
            let Some((zone_id, chunk_id, found)) = huge.best_fit(1) else {
                return false;
            };
            if found > 1 {
                self.split_free_chunk(zone_id, chunk_id, 1, found);
                huge.insert(zone_id, chunk_id + 1, found - 1);
            }
            (zone_id, chunk_id)
        };

        tracing::debug!(
            zone_id,
            chunk_id,
            unit_size = class.unit_size,
            "creating run",
        );

        // Initialize the run header while the chunk header still says
        // free; the type flip is the last persist.
        let capacity = RunHeader::capacity(class.unit_size);
        let run_off = layout::chunk_off(zone_id, chunk_id);
        let run: &mut RunHeader = self.pmem.view_mut(run_off);
        run.unit_size = class.unit_size;
        for (word_idx, word) in run.bitmap.iter_mut().enumerate() {
            let base = (word_idx * 64) as u32;
            *word = if base + 64 <= capacity {
                0
            } else if base >= capacity {
                u64::MAX
            } else {
                !((1u64 << (capacity - base)) - 1)
            };
        }
        self.pmem.persist(run_off, size_of::<RunHeader>());

        let hdr_off = layout::chunk_hdr_off(zone_id, chunk_id);
        self.pmem.write(hdr_off, ChunkHeader::new(ChunkKind::Run, 1));
        self.pmem.persist(hdr_off, size_of::<ChunkHeader>());

        let mut unit = 0u32;
        while unit < capacity {
            let span = (64 - unit % 64).min(capacity - unit);
            container.insert(RunFragment {
                zone_id,
                chunk_id,
                block_off: unit,
                size_idx: span,
            });
            unit += span;
        }

        true
    }

    /// Merge `loc` with any free extents adjacent to it, removing them
    /// from the container. The merged extent is returned but not
    /// inserted; its durable header flip goes through `prep_hdr`.
    pub(crate) fn coalesce_huge(
        &self,
        container: &mut HugeContainer,
        loc: BlockLoc,
    ) -> BlockLoc {
        let mut start = loc.chunk_id;
        let mut size_idx = loc.size_idx;

        if let Some((prev_chunk, prev_size)) =
            container.adjacent_before(loc.zone_id, loc.chunk_id)
        {
            container.remove(loc.zone_id, prev_chunk);
            start = prev_chunk;
            size_idx += prev_size;
        }
        if let Some(next_size) =
            container.adjacent_after(loc.zone_id, loc.chunk_id, loc.size_idx)
        {
            container.remove(loc.zone_id, loc.chunk_id + loc.size_idx);
            size_idx += next_size;
        }

        BlockLoc {
            zone_id: loc.zone_id,
            chunk_id: start,
            size_idx,
            block_off: 0,
        }
    }

    /// Return a block to its transient container. Durable state is not
    /// touched; this is the post-commit (or unwind) half of a free.
    pub(crate) fn insert_block(&self, container: &mut Container, block: MemoryBlock) {
        let loc = block.loc();
        match block {
            MemoryBlock::Huge(_) => {
                container
                    .as_huge()
                    .insert(loc.zone_id, loc.chunk_id, loc.size_idx);
            },
            MemoryBlock::Run { .. } => {
                container.as_run().insert(RunFragment {
                    zone_id: loc.zone_id,
                    chunk_id: loc.chunk_id,
                    block_off: loc.block_off,
                    size_idx: loc.size_idx,
                });
            },
        }
    }

    /// Visit the user offset of every live allocation, zone by zone.
    pub(crate) fn for_each_object(&self, mut f: impl FnMut(u64)) {
        for zone_id in 0..layout::num_zones(self.pool_size) {
            let num_chunks = layout::zone_num_chunks(self.pool_size, zone_id);
            let mut chunk_id = 0u32;
            while chunk_id < num_chunks {
                let hdr: ChunkHeader =
                    self.pmem.read(layout::chunk_hdr_off(zone_id, chunk_id));
                match hdr.kind() {
                    ChunkKind::Used => {
                        let block = MemoryBlock::Huge(BlockLoc {
                            zone_id,
                            chunk_id,
                            size_idx: hdr.size_idx,
                            block_off: 0,
                        });
                        f(block.user_off());
                        chunk_id += hdr.size_idx;
                    },
                    ChunkKind::Run => {
                        self.for_each_run_object(zone_id, chunk_id, &mut f);
                        chunk_id += 1;
                    },
                    _ => chunk_id += hdr.size_idx.max(1),
                }
            }
        }
    }

    fn for_each_run_object(&self, zone_id: u32, chunk_id: u32, f: &mut impl FnMut(u64)) {
        let run: &RunHeader = self.pmem.view(layout::chunk_off(zone_id, chunk_id));
        let unit_size = run.unit_size;
        let capacity = RunHeader::capacity(unit_size);

        let mut unit = 0u32;
        while unit < capacity {
            let word = run.bitmap[(unit / 64) as usize];
            if word & (1 << (unit % 64)) == 0 {
                unit += 1;
                continue;
            }

            let block = MemoryBlock::Run {
                loc: BlockLoc {
                    zone_id,
                    chunk_id,
                    size_idx: 1,
                    block_off: unit,
                },
                unit_size,
            };
            let user_off = block.user_off();
            let alloc: AllocationHeader =
                self.pmem.read(user_off - ALLOC_HDR_SIZE as u64);
            let units = (alloc.size / unit_size) as u32;
            assert!(units > 0, "heap corruption: zero-sized run allocation");

            f(user_off);
            unit += units;
        }
    }
}
