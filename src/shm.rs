//! Cross-process shared-memory ring for live monitoring.
//!
//! The data task publishes every record into a named shared segment;
//! independent monitor processes attach read-only and poll at their own
//! pace. The writer never blocks and never waits for readers: when the
//! ring is full it overwrites the oldest slot. Readers that fall behind
//! resynchronize to the writer's last-good snapshot and accept the loss of
//! old records; that catch-up rule is the design, not an error path.
//!
//! Segment layout (all fields native endian, fixed `#[repr(C)]`):
//!
//! ```text
//! magic | slot_count | slot_size | write_index | write_count
//!       | last_index | last_count | pad
//! slots: slot_count x slot_size, each starting with a flag word
//!        bits 31:28 record kind, bits 27:0 payload length
//! ```

use std::{
    fs::OpenOptions,
    io,
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::register::RecordKind;

/// Segment identity/version check for attaching readers.
const MAGIC: u32 = 0x524C_4B31; // "RLK1"

/// Header size, padded so slot 0 starts word-aligned with room to grow.
const HEADER_BYTES: usize = 64;

const FLAG_BYTES: usize = 4;
const LEN_MASK: u32 = 0x0FFF_FFFF;

#[repr(C)]
struct RingHeader {
    magic: u32,
    slot_count: u32,
    slot_size: u32,
    write_index: u32,
    write_count: u32,
    /// Last-good snapshot: the writer's position immediately before its
    /// most recent publish. Readers jump here to resynchronize.
    last_index: u32,
    last_count: u32,
}

/// The header's shared-position fields, viewed as atomics. The segment is
/// shared with other processes by design, so exclusive access is never
/// assumed.
struct Positions<'a> {
    write_index: &'a AtomicU32,
    write_count: &'a AtomicU32,
    last_index: &'a AtomicU32,
    last_count: &'a AtomicU32,
}

/// SAFETY (callers): `header` must point into a mapping of at least
/// `HEADER_BYTES` that outlives `'a`. `AtomicU32` has the same layout as
/// the `u32` fields it overlays.
unsafe fn positions<'a>(header: *const RingHeader) -> Positions<'a> {
    unsafe {
        Positions {
            write_index: &*(&raw const (*header).write_index as *const AtomicU32),
            write_count: &*(&raw const (*header).write_count as *const AtomicU32),
            last_index: &*(&raw const (*header).last_index as *const AtomicU32),
            last_count: &*(&raw const (*header).last_count as *const AtomicU32),
        }
    }
}

/// Single-writer handle to a shared ring segment.
pub struct SharedRing {
    mmap: MmapMut,
    slot_count: u32,
    slot_size: u32,
}

// SAFETY: all shared-position fields are accessed through atomics and the
// publish path is only ever driven by one task; payload bytes are written
// before the count that makes them visible.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl SharedRing {
    /// Creates (or truncates) the segment at `path` and initializes the
    /// header. `path` conventionally lives under `/dev/shm` so readers can
    /// attach by name.
    pub fn create(path: impl AsRef<Path>, slot_count: u32, slot_size: u32) -> io::Result<Self> {
        if slot_count < 2 || (slot_size as usize) <= FLAG_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring needs at least 2 slots and room for the flag word",
            ));
        }

        let total = HEADER_BYTES + slot_count as usize * slot_size as usize;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total as u64)?;

        // SAFETY: freshly created file of exactly `total` bytes; the map is
        // dropped with self.
        let mut mmap = unsafe { MmapOptions::new().len(total).map_mut(&file)? };

        let header = mmap.as_mut_ptr() as *mut RingHeader;
        // SAFETY: the mapping is at least HEADER_BYTES and exclusively ours
        // until this function returns.
        unsafe {
            (*header).magic = MAGIC;
            (*header).slot_count = slot_count;
            (*header).slot_size = slot_size;
            (*header).write_index = 0;
            (*header).write_count = 0;
            (*header).last_index = 0;
            (*header).last_count = 0;
        }

        Ok(Self {
            mmap,
            slot_count,
            slot_size,
        })
    }

    fn header(&self) -> *mut RingHeader {
        self.mmap.as_ptr() as *mut RingHeader
    }

    /// Publishes one record. Never blocks; a full ring overwrites the
    /// oldest slot. Returns `false` when the payload cannot fit a slot and
    /// was dropped.
    pub fn publish(&self, kind: RecordKind, payload: &[u8]) -> bool {
        if payload.len() + FLAG_BYTES > self.slot_size as usize {
            return false;
        }

        // SAFETY: header points into our live mapping.
        let pos = unsafe { positions(self.header()) };

        let index = pos.write_index.load(Ordering::Relaxed);
        let count = pos.write_count.load(Ordering::Relaxed);

        // Record the last-good snapshot before touching the slot so a
        // resynchronizing reader always lands on a fully written record.
        pos.last_index.store(index, Ordering::Release);
        pos.last_count.store(count, Ordering::Release);

        let flag = ((kind as u32) << 28) | (payload.len() as u32 & LEN_MASK);
        let offset = HEADER_BYTES + index as usize * self.slot_size as usize;
        // SAFETY: offset/len are bounded by the geometry checked in
        // create(); the writer is the only mutator of slot bytes.
        unsafe {
            let slot = self.mmap.as_ptr().add(offset) as *mut u8;
            (slot as *mut u32).write_volatile(flag);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), slot.add(FLAG_BYTES), payload.len());
        }

        // Count before index, both after the payload: a reader that sees
        // the new count can safely read the slot it maps to.
        pos.write_count.store(count.wrapping_add(1), Ordering::Release);
        pos.write_index.store((index + 1) % self.slot_count, Ordering::Release);
        true
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    /// Total records published since the segment was created.
    pub fn write_count(&self) -> u32 {
        // SAFETY: header points into our live mapping.
        unsafe { positions(self.header()) }
            .write_count
            .load(Ordering::Acquire)
    }
}

/// One record pulled out of the ring by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingRecord {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl RingRecord {
    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_tag(self.tag)
    }
}

/// Independent, lock-free reader over a shared ring segment.
///
/// Any process knowing the segment name may attach; no coordination with
/// the writer is required. Each reader keeps its own cursor.
pub struct SharedRingReader {
    mmap: Mmap,
    slot_count: u32,
    slot_size: u32,
    index: u32,
    count: u32,
}

// SAFETY: the reader only loads shared positions through atomics and never
// writes the mapping.
unsafe impl Send for SharedRingReader {}

impl SharedRingReader {
    fn header(&self) -> *const RingHeader {
        self.mmap.as_ptr() as *const RingHeader
    }

    /// Attaches read-only to an existing segment, starting from "never
    /// read" so the first poll resynchronizes to the writer.
    pub fn attach(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        // SAFETY: read-only map of a file sized by the writer; geometry is
        // validated below before any slot access.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "segment too small"));
        }
        let header = mmap.as_ptr() as *const RingHeader;
        // SAFETY: mapping holds at least HEADER_BYTES.
        let (magic, slot_count, slot_size) =
            unsafe { ((*header).magic, (*header).slot_count, (*header).slot_size) };
        if magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad segment magic"));
        }
        let total = HEADER_BYTES + slot_count as usize * slot_size as usize;
        if mmap.len() < total {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated segment"));
        }

        Ok(Self {
            mmap,
            slot_count,
            slot_size,
            index: 0,
            count: 0,
        })
    }

    /// Polls for the next record. `None` means the reader is caught up.
    ///
    /// A reader that is ahead of the writer, has never read, or has been
    /// lapped by more than half the ring jumps to the writer's last-good
    /// snapshot first; records between the old cursor and the snapshot are
    /// lost by design.
    pub fn try_read(&mut self) -> Option<RingRecord> {
        // SAFETY: header points into our live mapping.
        let pos = unsafe { positions(self.header()) };

        let wr_count = pos.write_count.load(Ordering::Acquire);

        let behind = wr_count.wrapping_sub(self.count);
        let stale = (self.count == 0 && wr_count != 0)
            || self.count > wr_count
            || behind >= self.slot_count / 2;
        if stale {
            let index = pos.last_index.load(Ordering::Acquire);
            let count = pos.last_count.load(Ordering::Acquire);
            tracing::debug!(
                wr_index = pos.write_index.load(Ordering::Acquire),
                wr_count,
                index,
                count,
                rd_index = self.index,
                rd_count = self.count,
                "reader resynchronizing to last-good snapshot"
            );
            self.index = index;
            self.count = count;
        }

        if self.count == pos.write_count.load(Ordering::Acquire) {
            return None;
        }

        let offset = HEADER_BYTES + self.index as usize * self.slot_size as usize;
        // SAFETY: index < slot_count (wrapped below) and the mapping spans
        // the full geometry validated in attach().
        let (flag, payload) = unsafe {
            let slot = self.mmap.as_ptr().add(offset);
            let flag = (slot as *const u32).read_volatile();
            let len = (flag & LEN_MASK) as usize;
            let len = len.min(self.slot_size as usize - FLAG_BYTES);
            let payload = std::slice::from_raw_parts(slot.add(FLAG_BYTES), len).to_vec();
            (flag, payload)
        };

        self.count = self.count.wrapping_add(1);
        self.index = (self.index + 1) % self.slot_count;

        Some(RingRecord {
            tag: (flag >> 28) as u8,
            payload,
        })
    }
}
