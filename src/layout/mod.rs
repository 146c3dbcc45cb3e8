//! On-media layout of a pool.
//!
//! A pool file is structured as:
//!
//! - Superblock (4 KiB)
//!     * Layout version, root object reference, orphaned-inode list head
//!       and the `initialized` byte, which is the very last thing written
//!       during pool creation.
//! - Redo-log region (4 KiB)
//!     * A cache-line-aligned array of `{offset, value}` entries used to
//!       commit bounded batches of 8-byte writes atomically.
//!     * Entry 0 holds the checksum pair, the finish flag is bit 0 of an
//!       entry offset.
//! - Heap zones
//!     * Each zone is a 64-byte zone header, an array of 8-byte chunk
//!       headers and the chunk space itself (256 KiB chunks).
//!     * A chunk is either free, occupied by a single huge allocation, or
//!       subdivided into a run of fixed-size units tracked by a bitmap.
//!
//! Every persistent reference is a 64-bit pool-relative offset; the pool
//! may be remapped at any base address. Multi-byte fields are host-endian,
//! cross-endian portability is not a goal.

pub(crate) mod fs;

/// Current pool layout version.
pub(crate) const LAYOUT_VERSION: u64 = 1;

/// Granule used by the superblock and the fs objects.
pub(crate) const PAGE_SIZE: usize = 4096;

/// Offset of the superblock within the pool. The superblock is the durable
/// root and is fixed at the start of the mapping.
pub(crate) const SUPERBLOCK_OFF: u64 = 0;

/// Offset of the redo-log region.
pub(crate) const REDO_OFF: u64 = PAGE_SIZE as u64;

/// Number of payload entries the redo log can hold; entry 0 is the
/// checksum pair, so the whole region is `(1 + N) * 16` bytes within one
/// 4 KiB page.
pub(crate) const REDO_NUM_ENTRIES: usize = 254;

/// Offset of the first heap zone.
pub(crate) const HEAP_OFF: u64 = 2 * PAGE_SIZE as u64;

/// Fundamental unit of heap bookkeeping.
pub(crate) const CHUNK_SIZE: usize = 256 * 1024;

/// Size of the zone header at the start of each zone.
pub(crate) const ZONE_HDR_SIZE: usize = 64;

/// Maximum chunks a single zone can describe. Chosen so the zone metadata
/// (header plus chunk-header array) is exactly 16 KiB and the first chunk
/// starts page-aligned.
pub(crate) const MAX_CHUNKS_PER_ZONE: usize = 2040;

/// Zone header + chunk-header array.
pub(crate) const ZONE_META_SIZE: usize =
    ZONE_HDR_SIZE + MAX_CHUNKS_PER_ZONE * size_of::<ChunkHeader>();

/// Stride between the start offsets of two consecutive full zones.
pub(crate) const ZONE_FULL_SIZE: u64 =
    (ZONE_META_SIZE + MAX_CHUNKS_PER_ZONE * CHUNK_SIZE) as u64;

/// Marker stamped into every formatted zone header.
pub(crate) const ZONE_MAGIC: u64 = 0x504d_5a4f_4e45_0001;

/// Smallest pool this layout can express: metadata plus one zone with a
/// single chunk.
pub(crate) const POOL_MIN_SIZE: u64 =
    HEAP_OFF + (ZONE_META_SIZE + CHUNK_SIZE) as u64;

const _: () = assert!((1 + REDO_NUM_ENTRIES) * 16 <= PAGE_SIZE);
const _: () = assert!(ZONE_META_SIZE % PAGE_SIZE == 0);

/// A 16-byte persistent reference: a type number and a pool-relative
/// offset. References never carry virtual addresses; resolving one
/// requires the mapped pool.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct PRef {
    pub type_num: u64,
    pub off: u64,
}

impl PRef {
    pub const NULL: PRef = PRef { type_num: 0, off: 0 };

    pub const fn new(type_num: u64, off: u64) -> Self {
        Self { type_num, off }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.off == 0
    }
}

/// The durable root of a pool.
///
/// `initialized` is the final byte persisted by pool creation; a pool with
/// `initialized == 0` is half-formatted and must be rejected at open.
#[repr(C)]
pub(crate) struct Superblock {
    pub version: u64,
    pub root_inode: PRef,
    pub orphaned_inodes: PRef,
    pub initialized: u8,
    _pad: [u8; PAGE_SIZE - 41],
}

const _: () = assert!(size_of::<Superblock>() == PAGE_SIZE);

/// Live state of a chunk. `Uninit` headers are only ever found in the
/// shadow of a larger chunk and are skipped by the walker.
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ChunkKind {
    Uninit = 0,
    Free = 1,
    Used = 2,
    Run = 3,
}

/// 8-byte chunk header: type, flags and the span of the chunk in chunk
/// units. State transitions go through the redo log as a single word
/// store of the packed representation.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct ChunkHeader {
    pub kind: u16,
    pub flags: u16,
    pub size_idx: u32,
}

const _: () = assert!(size_of::<ChunkHeader>() == 8);

impl ChunkHeader {
    pub fn new(kind: ChunkKind, size_idx: u32) -> Self {
        Self {
            kind: kind as u16,
            flags: 0,
            size_idx,
        }
    }

    #[inline]
    pub fn kind(&self) -> ChunkKind {
        match self.kind {
            1 => ChunkKind::Free,
            2 => ChunkKind::Used,
            3 => ChunkKind::Run,
            _ => ChunkKind::Uninit,
        }
    }

    /// Packed representation matching the in-memory struct layout on
    /// little-endian hosts; this is the word the redo log stores to flip a
    /// chunk state atomically.
    #[inline]
    pub fn pack(&self) -> u64 {
        (self.kind as u64) | ((self.flags as u64) << 16) | ((self.size_idx as u64) << 32)
    }
}

/// Number of bitmap words in a run header.
pub(crate) const RUN_BITMAP_WORDS: usize = 16;

/// Maximum units a run can track.
pub(crate) const RUN_MAX_UNITS: usize = RUN_BITMAP_WORDS * 64;

/// Offset of the unit area within a run chunk; the run header is the unit
/// size plus the bitmap, rounded up so units stay cache-line aligned.
pub(crate) const RUN_DATA_OFF: usize = 192;

const _: () = assert!(size_of::<RunHeader>() <= RUN_DATA_OFF);
const _: () = assert!(RUN_DATA_OFF % 64 == 0);

/// Header at the start of a run chunk. A set bitmap bit means the unit is
/// allocated; bits past the last usable unit are pre-set at run creation.
#[repr(C)]
pub(crate) struct RunHeader {
    pub unit_size: u64,
    pub bitmap: [u64; RUN_BITMAP_WORDS],
}

impl RunHeader {
    /// Number of usable units for a given unit size.
    pub fn capacity(unit_size: u64) -> u32 {
        let space = (CHUNK_SIZE - RUN_DATA_OFF) as u64 / unit_size;
        space.min(RUN_MAX_UNITS as u64) as u32
    }
}

/// Size of the allocation header preceding user data.
pub(crate) const ALLOC_HDR_SIZE: usize = 24;

/// Distance from the start of a reserved block to the user data. The
/// header sits in the last 24 bytes of this prefix so the user pointer
/// stays cache-line aligned and the header is recoverable by subtracting
/// [ALLOC_HDR_SIZE] from any user offset.
pub(crate) const ALLOC_DATA_OFF: usize = 64;

/// 24-byte allocation header stored immediately before the user data.
/// `size` is the total block size including this prefix and always equals
/// `size_idx * unit_size` of the owning block.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct AllocationHeader {
    pub chunk_id: u64,
    pub size: u64,
    pub zone_id: u32,
    _pad: u32,
}

const _: () = assert!(size_of::<AllocationHeader>() == ALLOC_HDR_SIZE);

impl AllocationHeader {
    pub fn new(chunk_id: u32, zone_id: u32, size: u64) -> Self {
        Self {
            chunk_id: chunk_id as u64,
            size,
            zone_id,
            _pad: 0,
        }
    }
}

/// Start offset of a zone.
#[inline]
pub(crate) fn zone_off(zone_id: u32) -> u64 {
    HEAP_OFF + zone_id as u64 * ZONE_FULL_SIZE
}

/// Offset of a chunk header within its zone's header array.
#[inline]
pub(crate) fn chunk_hdr_off(zone_id: u32, chunk_id: u32) -> u64 {
    zone_off(zone_id) + ZONE_HDR_SIZE as u64 + chunk_id as u64 * 8
}

/// Offset of a chunk's data.
#[inline]
pub(crate) fn chunk_off(zone_id: u32, chunk_id: u32) -> u64 {
    zone_off(zone_id) + ZONE_META_SIZE as u64 + chunk_id as u64 * CHUNK_SIZE as u64
}

/// 64-byte zone header.
#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct ZoneHeader {
    pub magic: u64,
    pub num_chunks: u32,
    _pad: [u8; 52],
}

const _: () = assert!(size_of::<ZoneHeader>() == ZONE_HDR_SIZE);

impl ZoneHeader {
    pub fn new(num_chunks: u32) -> Self {
        Self {
            magic: ZONE_MAGIC,
            num_chunks,
            _pad: [0; 52],
        }
    }
}

/// Number of zones a pool of `pool_size` bytes holds.
pub(crate) fn num_zones(pool_size: u64) -> u32 {
    let heap_space = pool_size - HEAP_OFF;
    heap_space.div_ceil(ZONE_FULL_SIZE) as u32
}

/// Number of whole chunks zone `zone_id` of a pool of `pool_size` bytes
/// can describe.
pub(crate) fn zone_num_chunks(pool_size: u64, zone_id: u32) -> u32 {
    let start = zone_off(zone_id);
    let space = pool_size.saturating_sub(start).min(ZONE_FULL_SIZE);
    if space <= ZONE_META_SIZE as u64 {
        return 0;
    }
    ((space - ZONE_META_SIZE as u64) / CHUNK_SIZE as u64) as u32
}
