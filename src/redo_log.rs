//! The redo log atomically commits a bounded batch of 8-byte word writes
//! to arbitrary pool offsets.
//!
//! Entries are staged in a volatile shadow copy of the log region. On
//! commit the last entry is tagged with the finish flag (bit 0 of its
//! offset), a checksum over the used span is stored into entry 0, and the
//! whole dirty range is copied to the persistent log with write-combining
//! stores before any target word is touched. A crash therefore leaves the
//! durable log in exactly one of three shapes: empty, complete, or torn
//! (checksum mismatch), and recovery either replays the whole batch or
//! none of it.

use std::sync::Arc;

use crate::layout::REDO_NUM_ENTRIES;
use crate::pmem::{CACHELINE, PmemMap};
use crate::utils::align_up;

/// Finish flag at the least significant bit of an entry offset.
pub(crate) const REDO_FINISH_FLAG: u64 = 1 << 0;
pub(crate) const REDO_FLAG_MASK: u64 = !REDO_FINISH_FLAG;

/// One durable log entry. Entry 0 reuses the fields for the checksum pair.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub(crate) struct RedoEntry {
    pub offset: u64,
    pub value: u64,
}

const ENTRY_SIZE: usize = size_of::<RedoEntry>();

/// Shadow length in entries: the checksum entry, the payload entries, and
/// enough spare slots that the cache-line rounding of the dirty span never
/// reads past the buffer.
const SHADOW_ENTRIES: usize =
    ((1 + REDO_NUM_ENTRIES) * ENTRY_SIZE).div_ceil(CACHELINE) * CACHELINE / ENTRY_SIZE;

#[derive(Debug, thiserror::Error)]
/// A recovered or checked log referenced an offset outside the pool's
/// data area. This is corruption, not a torn write; the pool is rejected.
#[error("redo entry {index} targets offset {offset:#x} outside the pool data area")]
pub struct RedoInvalidOffset {
    pub index: usize,
    pub offset: u64,
}

#[derive(Debug, Eq, PartialEq)]
enum LogState {
    /// Entry 0 is zeroed or no finish flag exists within the region.
    Empty,
    /// A finish flag exists but the checksum does not match: the commit
    /// copy was interrupted.
    Torn,
    /// The checksum matches the span up to the finish entry.
    Complete { finish: usize },
}

/// The redo log: a persistent entry array plus its volatile shadow.
#[derive(Debug)]
pub(crate) struct RedoLog {
    pmem: Arc<PmemMap>,
    log_off: u64,
    shadow: Box<[RedoEntry; SHADOW_ENTRIES]>,
}

impl RedoLog {
    pub(crate) fn new(pmem: Arc<PmemMap>, log_off: u64) -> Self {
        assert_eq!(log_off % CACHELINE as u64, 0, "redo log must be line aligned");
        Self {
            pmem,
            log_off,
            shadow: Box::new([RedoEntry::default(); SHADOW_ENTRIES]),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        REDO_NUM_ENTRIES
    }

    #[inline]
    pub(crate) fn pmem(&self) -> &Arc<PmemMap> {
        &self.pmem
    }

    /// Stage an entry at `index` in the shadow.
    pub(crate) fn store(&mut self, index: usize, offset: u64, value: u64) {
        assert_eq!(offset & REDO_FINISH_FLAG, 0, "BUG: unaligned redo offset");
        assert!(index < self.capacity(), "BUG: redo index out of range");
        self.shadow[index + 1] = RedoEntry { offset, value };
    }

    /// Stage the final entry of the batch and persist the shadow to the
    /// durable log. After this returns the batch will survive a crash.
    pub(crate) fn store_last(&mut self, index: usize, offset: u64, value: u64) {
        assert_eq!(offset & REDO_FINISH_FLAG, 0, "BUG: unaligned redo offset");
        assert!(index < self.capacity(), "BUG: redo index out of range");
        self.shadow[index + 1] = RedoEntry {
            offset: offset | REDO_FINISH_FLAG,
            value,
        };
        self.persist_shadow(index + 1);
    }

    /// Apply the staged batch to its target words and clear the durable
    /// log head. Must follow [Self::store_last].
    pub(crate) fn process(&mut self) {
        self.apply_shadow();
    }

    /// Recover the durable log at pool open: replay a complete batch,
    /// zero a torn one, leave an empty one alone.
    #[tracing::instrument("redo::recover", skip_all)]
    pub(crate) fn recover(
        &mut self,
        check_offset: impl Fn(u64) -> bool,
    ) -> Result<(), RedoInvalidOffset> {
        match self.verify_durable() {
            LogState::Empty => Ok(()),
            LogState::Torn => {
                tracing::warn!("torn redo log detected, zeroing");
                self.pmem.memset_wc(self.log_off, 0, CACHELINE);
                Ok(())
            },
            LogState::Complete { finish } => {
                self.check_entries(finish, check_offset)?;
                tracing::debug!(entries = finish, "replaying complete redo log");

                // Sync the shadow from media and replay exactly as a
                // commit would have.
                for i in 0..=finish {
                    self.shadow[i] = self.read_durable(i);
                }
                self.apply_shadow();
                Ok(())
            },
        }
    }

    /// Validate the durable log without side effects. Returns an error if
    /// a complete batch references an out-of-range offset.
    pub(crate) fn check(
        &self,
        check_offset: impl Fn(u64) -> bool,
    ) -> Result<(), RedoInvalidOffset> {
        match self.verify_durable() {
            LogState::Complete { finish } => self.check_entries(finish, check_offset),
            _ => Ok(()),
        }
    }

    fn check_entries(
        &self,
        finish: usize,
        check_offset: impl Fn(u64) -> bool,
    ) -> Result<(), RedoInvalidOffset> {
        for i in 1..=finish {
            let entry = self.read_durable(i);
            let offset = entry.offset & REDO_FLAG_MASK;
            if !check_offset(offset) {
                return Err(RedoInvalidOffset { index: i, offset });
            }
        }
        Ok(())
    }

    #[inline]
    fn read_durable(&self, index: usize) -> RedoEntry {
        self.pmem
            .read(self.log_off + (index * ENTRY_SIZE) as u64)
    }

    /// Checksum entry 0, round the dirty span up to the cache line filling
    /// the slack with 0xFF, and copy the shadow to the persistent log.
    fn persist_shadow(&mut self, nentries: usize) {
        let csum = calc_csum(entries_as_bytes(&self.shadow[1..=nentries]));
        self.shadow[0] = RedoEntry {
            offset: csum,
            value: csum,
        };

        let dirty = (1 + nentries) * ENTRY_SIZE;
        let copy_len = align_up(dirty, CACHELINE);
        for slack in self.shadow[..copy_len / ENTRY_SIZE]
            .iter_mut()
            .skip(1 + nentries)
        {
            *slack = RedoEntry {
                offset: u64::MAX,
                value: u64::MAX,
            };
        }

        let bytes = entries_as_bytes(&self.shadow[..copy_len / ENTRY_SIZE]);
        self.pmem.memcpy_wc(self.log_off, bytes);
    }

    /// Walk the shadow from entry 1, writing each value to its target
    /// word. Every write is flushed, the finish-flagged write is fully
    /// persisted, and the log head is cleared last.
    fn apply_shadow(&mut self) {
        let mut index = 1;
        loop {
            assert!(index <= self.capacity(), "BUG: unterminated redo batch");
            let entry = self.shadow[index];
            let target = entry.offset & REDO_FLAG_MASK;

            if entry.offset & REDO_FINISH_FLAG != 0 {
                self.pmem.write_u64_persist(target, entry.value);
                break;
            }

            self.pmem.write::<u64>(target, entry.value);
            self.pmem.flush(target, size_of::<u64>());
            index += 1;
        }

        self.pmem.memset_wc(self.log_off, 0, CACHELINE);
    }

    /// Classify the durable log as empty, torn or complete.
    fn verify_durable(&self) -> LogState {
        let head = self.read_durable(0);
        if head == RedoEntry::default() {
            return LogState::Empty;
        }

        let Some(finish) = self.find_finish() else {
            // Head is nonzero but no batch was ever terminated; the log
            // was never used for a full commit.
            return LogState::Empty;
        };

        let span = self
            .pmem
            .slice(self.log_off + ENTRY_SIZE as u64, finish * ENTRY_SIZE);
        let csum = calc_csum(span);
        if csum != head.offset || csum != head.value {
            return LogState::Torn;
        }

        LogState::Complete { finish }
    }

    /// Index of the first finish-flagged durable entry, if any.
    fn find_finish(&self) -> Option<usize> {
        (1..=self.capacity())
            .find(|i| self.read_durable(*i).offset & REDO_FINISH_FLAG != 0)
    }
}

fn entries_as_bytes(entries: &[RedoEntry]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            entries.as_ptr() as *const u8,
            entries.len() * ENTRY_SIZE,
        )
    }
}

/// Checksum over the used entry span, widened to the 64-bit checksum pair.
/// A computed value of zero is mapped to one so `{0, 0}` uniquely means
/// "already processed".
fn calc_csum(bytes: &[u8]) -> u64 {
    let csum = crc32fast::hash(bytes) as u64;
    if csum == 0 { 1 } else { csum }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG_OFF: u64 = 4096;
    const DATA_OFF: u64 = 8192;

    fn make_log(len: u64) -> (tempfile::TempDir, RedoLog) {
        let dir = tempfile::tempdir().unwrap();
        let file = crate::utils::create_file(&dir.path().join("pool"), false).unwrap();
        file.set_len(len).unwrap();
        let pmem = Arc::new(PmemMap::map(&file).unwrap());
        (dir, RedoLog::new(pmem, LOG_OFF))
    }

    fn reopen(dir: &tempfile::TempDir) -> RedoLog {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("pool"))
            .unwrap();
        let pmem = Arc::new(PmemMap::map(&file).unwrap());
        RedoLog::new(pmem, LOG_OFF)
    }

    #[test]
    fn test_commit_applies_all_entries() {
        let (_dir, mut log) = make_log(16384);

        log.store(0, DATA_OFF, 11);
        log.store(1, DATA_OFF + 8, 22);
        log.store_last(2, DATA_OFF + 16, 33);
        log.process();

        let pmem = log.pmem().clone();
        assert_eq!(pmem.read::<u64>(DATA_OFF), 11);
        assert_eq!(pmem.read::<u64>(DATA_OFF + 8), 22);
        assert_eq!(pmem.read::<u64>(DATA_OFF + 16), 33);

        // The log head is cleared after processing.
        assert_eq!(pmem.read::<RedoEntry>(LOG_OFF), RedoEntry::default());
    }

    #[test]
    fn test_recover_replays_complete_log() {
        let (dir, mut log) = make_log(16384);

        // Persist the batch but "crash" before applying it.
        log.store(0, DATA_OFF, 0xAB);
        log.store_last(1, DATA_OFF + 8, 0xCD);
        drop(log);

        let mut log = reopen(&dir);
        let pmem = log.pmem().clone();
        assert_eq!(pmem.read::<u64>(DATA_OFF), 0);

        log.recover(|off| off >= DATA_OFF).expect("recover");
        assert_eq!(pmem.read::<u64>(DATA_OFF), 0xAB);
        assert_eq!(pmem.read::<u64>(DATA_OFF + 8), 0xCD);

        // Replay is idempotent: a second recovery sees an empty log.
        log.recover(|off| off >= DATA_OFF).expect("recover again");
        assert_eq!(pmem.read::<u64>(DATA_OFF), 0xAB);
    }

    #[test]
    fn test_torn_log_is_zeroed() {
        let (dir, log) = make_log(16384);
        let pmem = log.pmem().clone();

        // Write payload entries and a bogus checksum directly to media,
        // simulating a crash mid-copy (payload landed, checksum did not).
        pmem.write::<RedoEntry>(
            LOG_OFF,
            RedoEntry {
                offset: 0xBAAD,
                value: 0xF00D,
            },
        );
        pmem.write::<RedoEntry>(
            LOG_OFF + 16,
            RedoEntry {
                offset: (DATA_OFF) | REDO_FINISH_FLAG,
                value: 77,
            },
        );
        drop(log);

        let mut log = reopen(&dir);
        log.recover(|_| true).expect("recover");

        // No side effects, head zeroed.
        assert_eq!(pmem.read::<u64>(DATA_OFF), 0);
        assert_eq!(pmem.read::<RedoEntry>(LOG_OFF), RedoEntry::default());
    }

    #[test]
    fn test_unterminated_log_is_ignored() {
        let (dir, log) = make_log(16384);
        let pmem = log.pmem().clone();

        // A checksum entry without any finish-flagged payload entry.
        pmem.write::<RedoEntry>(
            LOG_OFF,
            RedoEntry {
                offset: 123,
                value: 123,
            },
        );
        drop(log);

        let mut log = reopen(&dir);
        log.recover(|_| true).expect("recover");
        assert_eq!(pmem.read::<u64>(DATA_OFF), 0);
    }

    #[test]
    fn test_recover_rejects_out_of_range_offset() {
        let (dir, mut log) = make_log(16384);

        log.store_last(0, DATA_OFF, 1);
        drop(log);

        let mut log = reopen(&dir);
        let err = log
            .recover(|off| off < DATA_OFF)
            .expect_err("offset check must fail");
        assert_eq!(err.offset, DATA_OFF);
    }

    #[test]
    fn test_shadow_reuse_across_batches() {
        let (_dir, mut log) = make_log(16384);

        log.store(0, DATA_OFF, 1);
        log.store(1, DATA_OFF + 8, 2);
        log.store_last(2, DATA_OFF + 16, 3);
        log.process();

        // A shorter second batch must not resurrect stale entries.
        log.store_last(0, DATA_OFF + 24, 4);
        log.process();

        let pmem = log.pmem().clone();
        assert_eq!(pmem.read::<u64>(DATA_OFF + 24), 4);
        assert_eq!(pmem.read::<RedoEntry>(LOG_OFF), RedoEntry::default());
    }
}
