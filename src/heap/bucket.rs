//! Transient per-size-class containers of free blocks.
//!
//! Buckets are rebuilt from the on-media chunk headers at pool open and
//! discarded at close; they are never persisted. The default bucket backs
//! whole-chunk (huge) allocations, the run buckets back the fixed unit
//! size classes.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, MutexGuard};

/// Run unit sizes, one bucket each. Units are cache-line multiples so the
/// user data behind the 64-byte block prefix stays aligned.
pub(crate) const RUN_UNIT_SIZES: [u64; 5] = [128, 256, 512, 1024, 2048];

/// Maximum units a single run allocation may span. Keeps every run
/// reservation inside one 64-bit bitmap word, so a state flip is always a
/// single-word redo entry.
pub(crate) const RUN_UNIT_MAX_ALLOC: u32 = 8;

/// Largest header-inclusive size served from a run; anything bigger goes
/// to the default (huge) bucket.
pub(crate) const MAX_RUN_ALLOC_SIZE: usize =
    (RUN_UNIT_SIZES[RUN_UNIT_SIZES.len() - 1] * RUN_UNIT_MAX_ALLOC as u64) as usize;

/// A run size class: its bucket index and unit size.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct SizeClass {
    pub index: usize,
    pub unit_size: u64,
}

impl SizeClass {
    pub(crate) fn from_index(index: usize) -> Self {
        Self {
            index,
            unit_size: RUN_UNIT_SIZES[index],
        }
    }

    /// Smallest class able to serve `sizeh` within the per-allocation unit
    /// cap, or `None` when the request must go to the huge bucket.
    pub(crate) fn best_for(sizeh: usize) -> Option<Self> {
        if sizeh > MAX_RUN_ALLOC_SIZE {
            return None;
        }
        RUN_UNIT_SIZES
            .iter()
            .position(|unit| {
                (sizeh as u64).div_ceil(*unit) <= RUN_UNIT_MAX_ALLOC as u64
            })
            .map(Self::from_index)
    }
}

/// A free-block bucket: a mutex plus a best-fit container.
#[derive(Debug)]
pub(crate) struct Bucket {
    /// `None` for the default (huge) bucket.
    pub class: Option<SizeClass>,
    container: Mutex<Container>,
}

impl Bucket {
    pub(crate) fn new_huge() -> Self {
        Self {
            class: None,
            container: Mutex::new(Container::Huge(HugeContainer::default())),
        }
    }

    pub(crate) fn new_run(class: SizeClass) -> Self {
        Self {
            class: Some(class),
            container: Mutex::new(Container::Run(RunContainer::default())),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, Container> {
        self.container.lock()
    }

    /// Units needed to serve a header-inclusive size from this bucket.
    pub(crate) fn calc_units(&self, sizeh: usize) -> u32 {
        (sizeh as u64).div_ceil(self.unit_size()) as u32
    }

    /// Size of one allocation unit of this bucket.
    pub(crate) fn unit_size(&self) -> u64 {
        match self.class {
            Some(class) => class.unit_size,
            None => crate::layout::CHUNK_SIZE as u64,
        }
    }
}

/// The free-block container behind a bucket lock.
#[derive(Debug)]
pub(crate) enum Container {
    Huge(HugeContainer),
    Run(RunContainer),
}

impl Container {
    pub(crate) fn as_huge(&mut self) -> &mut HugeContainer {
        match self {
            Container::Huge(c) => c,
            Container::Run(_) => unreachable!("BUG: huge container expected"),
        }
    }

    pub(crate) fn as_run(&mut self) -> &mut RunContainer {
        match self {
            Container::Run(c) => c,
            Container::Huge(_) => unreachable!("BUG: run container expected"),
        }
    }
}

/// Free chunk extents, indexed both by location (for coalescing) and by
/// size (for best-fit).
#[derive(Debug, Default)]
pub(crate) struct HugeContainer {
    by_addr: BTreeMap<(u32, u32), u32>,
    by_size: BTreeSet<(u32, u32, u32)>,
}

impl HugeContainer {
    pub(crate) fn insert(&mut self, zone_id: u32, chunk_id: u32, size_idx: u32) {
        debug_assert!(size_idx > 0);
        let prev = self.by_addr.insert((zone_id, chunk_id), size_idx);
        assert!(prev.is_none(), "BUG: duplicate free chunk insert");
        self.by_size.insert((size_idx, zone_id, chunk_id));
    }

    /// Remove the extent starting exactly at `(zone_id, chunk_id)`.
    pub(crate) fn remove(&mut self, zone_id: u32, chunk_id: u32) -> Option<u32> {
        let size_idx = self.by_addr.remove(&(zone_id, chunk_id))?;
        self.by_size.remove(&(size_idx, zone_id, chunk_id));
        Some(size_idx)
    }

    /// Best-fit: the smallest free extent spanning at least `size_idx`
    /// chunks. The extent is removed; the caller splits any remainder.
    pub(crate) fn best_fit(&mut self, size_idx: u32) -> Option<(u32, u32, u32)> {
        let found = *self.by_size.range((size_idx, 0, 0)..).next()?;
        let (found_size, zone_id, chunk_id) = found;
        self.remove(zone_id, chunk_id);
        Some((zone_id, chunk_id, found_size))
    }

    /// The free extent immediately preceding `chunk_id` in its zone, if
    /// contiguous with it.
    pub(crate) fn adjacent_before(
        &self,
        zone_id: u32,
        chunk_id: u32,
    ) -> Option<(u32, u32)> {
        let ((prev_zone, prev_chunk), size_idx) = self
            .by_addr
            .range(..(zone_id, chunk_id))
            .next_back()
            .map(|(k, v)| (*k, *v))?;
        (prev_zone == zone_id && prev_chunk + size_idx == chunk_id)
            .then_some((prev_chunk, size_idx))
    }

    /// The free extent starting right behind `[chunk_id, chunk_id + size)`.
    pub(crate) fn adjacent_after(
        &self,
        zone_id: u32,
        chunk_id: u32,
        size_idx: u32,
    ) -> Option<u32> {
        self.by_addr.get(&(zone_id, chunk_id + size_idx)).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ((u32, u32), u32)> + '_ {
        self.by_addr.iter().map(|(k, v)| (*k, *v))
    }
}

/// A contiguous span of free units inside a single bitmap word of a run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct RunFragment {
    pub zone_id: u32,
    pub chunk_id: u32,
    /// First unit index within the run.
    pub block_off: u32,
    /// Number of free units.
    pub size_idx: u32,
}

/// Free-unit fragments of one size class, ordered by size for best-fit.
#[derive(Debug, Default)]
pub(crate) struct RunContainer {
    by_size: BTreeSet<(u32, u32, u32, u32)>,
}

impl RunContainer {
    pub(crate) fn insert(&mut self, frag: RunFragment) {
        debug_assert!(frag.size_idx > 0);
        debug_assert_eq!(
            frag.block_off / 64,
            (frag.block_off + frag.size_idx - 1) / 64,
            "BUG: run fragment crosses a bitmap word",
        );
        self.by_size
            .insert((frag.size_idx, frag.zone_id, frag.chunk_id, frag.block_off));
    }

    /// Best-fit: the smallest fragment of at least `units` units. The
    /// fragment is removed; the caller reinserts any remainder.
    pub(crate) fn best_fit(&mut self, units: u32) -> Option<RunFragment> {
        let found = *self.by_size.range((units, 0, 0, 0)..).next()?;
        self.by_size.remove(&found);
        let (size_idx, zone_id, chunk_id, block_off) = found;
        Some(RunFragment {
            zone_id,
            chunk_id,
            block_off,
            size_idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_class_selection() {
        assert_eq!(SizeClass::best_for(64).unwrap().unit_size, 128);
        assert_eq!(SizeClass::best_for(524).unwrap().unit_size, 128);
        // 128 * 8 = 1024 is the largest size the 128-byte class can serve.
        assert_eq!(SizeClass::best_for(1024).unwrap().unit_size, 128);
        assert_eq!(SizeClass::best_for(1025).unwrap().unit_size, 256);
        assert_eq!(SizeClass::best_for(4000).unwrap().unit_size, 512);
        assert_eq!(SizeClass::best_for(MAX_RUN_ALLOC_SIZE).unwrap().unit_size, 2048);
        assert_eq!(SizeClass::best_for(MAX_RUN_ALLOC_SIZE + 1), None);
    }

    #[test]
    fn test_huge_best_fit_prefers_smallest() {
        let mut container = HugeContainer::default();
        container.insert(0, 0, 8);
        container.insert(0, 10, 3);
        container.insert(0, 20, 5);

        let (zone, chunk, size) = container.best_fit(2).unwrap();
        assert_eq!((zone, chunk, size), (0, 10, 3));

        let (_, chunk, size) = container.best_fit(4).unwrap();
        assert_eq!((chunk, size), (20, 5));

        assert!(container.best_fit(100).is_none());
    }

    #[test]
    fn test_huge_adjacency_lookups() {
        let mut container = HugeContainer::default();
        container.insert(0, 0, 4);
        container.insert(0, 10, 2);

        // [0..4) is not adjacent to chunk 5, [10..12) is adjacent to 12.
        assert_eq!(container.adjacent_before(0, 5), None);
        assert_eq!(container.adjacent_before(0, 4), Some((0, 4)));
        assert_eq!(container.adjacent_after(0, 8, 2), Some(2));
        assert_eq!(container.adjacent_after(0, 8, 1), None);

        // Zone boundaries never coalesce.
        assert_eq!(container.adjacent_before(1, 0), None);
    }

    #[test]
    fn test_run_fragment_best_fit() {
        let mut container = RunContainer::default();
        container.insert(RunFragment {
            zone_id: 0,
            chunk_id: 1,
            block_off: 0,
            size_idx: 64,
        });
        container.insert(RunFragment {
            zone_id: 0,
            chunk_id: 1,
            block_off: 70,
            size_idx: 4,
        });

        let frag = container.best_fit(3).unwrap();
        assert_eq!(frag.block_off, 70);
        assert_eq!(frag.size_idx, 4);

        let frag = container.best_fit(10).unwrap();
        assert_eq!(frag.block_off, 0);
        assert!(container.best_fit(1).is_none());
    }
}
