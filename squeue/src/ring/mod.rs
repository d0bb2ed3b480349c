//! Per-consumer cyclic byte buffer.
//!
//! A slot's ring holds records as `[u32 host-order length][payload]`. The
//! length word never leaves the host, so no byte-order conversion is done.
//! Records longer than the ring are pushed through in chunks, the consumer
//! reporting its progress by writing an offset word at the start of the ring.

use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::errors::{Result, SharedQueueError};
use crate::segment::NodeId;

pub(crate) const LEN_SIZE: usize = mem::size_of::<u32>();

/// Longest payload the length word can describe.
pub const MAX_RECORD_LEN: usize = u32::MAX as usize;

/// Length word for a payload of `len` bytes.
pub(crate) fn record_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| SharedQueueError::RecordTooLarge {
        len,
        max: MAX_RECORD_LEN,
    })
}

/// Raw tuple count value meaning "long record transfer in progress".
pub const LONG_RECORD_MARKER: i32 = -42;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SlotStatus {
    /// Both producer and consumer are working.
    Active = 0,
    /// Producer finished successfully and waits for the consumer.
    Eof = 1,
    /// Producer failed and waits for the consumer to disconnect.
    Error = 2,
    /// Consumer is finished, OK to unbind.
    Done = 3,
}

impl SlotStatus {
    fn from_raw(raw: u32) -> SlotStatus {
        match raw {
            0 => SlotStatus::Active,
            1 => SlotStatus::Eof,
            2 => SlotStatus::Error,
            _ => SlotStatus::Done,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotStatus::Active => "active",
            SlotStatus::Eof => "eof",
            SlotStatus::Error => "error",
            SlotStatus::Done => "done",
        };
        f.write_str(name)
    }
}

/// Number of records in a ring, or the long record marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TupleCount {
    Empty,
    Rows(u32),
    LongRecord,
}

impl TupleCount {
    pub fn from_raw(raw: i32) -> TupleCount {
        match raw {
            LONG_RECORD_MARKER => TupleCount::LongRecord,
            n if n > 0 => TupleCount::Rows(n as u32),
            _ => TupleCount::Empty,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            TupleCount::Empty => 0,
            TupleCount::Rows(n) => n as i32,
            TupleCount::LongRecord => LONG_RECORD_MARKER,
        }
    }

    /// Complete records ready to read; zero while a long record is pending.
    pub fn rows(self) -> u32 {
        match self {
            TupleCount::Rows(n) => n,
            _ => 0,
        }
    }
}

#[derive(Default)]
#[repr(C)]
pub(crate) struct SlotCounters {
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub overflow_writes: AtomicU64,
    pub overflow_reads: AtomicU64,
    pub overflow_returns: AtomicU64,
}

impl SlotCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SlotStats {
        SlotStats {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            overflow_writes: self.overflow_writes.load(Ordering::Relaxed),
            overflow_reads: self.overflow_reads.load(Ordering::Relaxed),
            overflow_returns: self.overflow_returns.load(Ordering::Relaxed),
        }
    }
}

/// Traffic counters of one slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub writes: u64,
    pub reads: u64,
    pub overflow_writes: u64,
    pub overflow_reads: u64,
    pub overflow_returns: u64,
}

/// State of a single consumer, stored in the queue entry right after the
/// header. Positions are offsets so every process can map the segment at
/// its own address.
#[repr(C)]
pub(crate) struct ConsumerState {
    pid: AtomicU32,
    node: AtomicI32,
    ntuples: AtomicI32,
    status: AtomicU32,
    qstart: AtomicUsize,
    qlength: AtomicUsize,
    readpos: AtomicUsize,
    writepos: AtomicUsize,
    pub stats: SlotCounters,
}

impl ConsumerState {
    pub fn new(qstart: usize, qlength: usize) -> ConsumerState {
        ConsumerState {
            pid: AtomicU32::new(0),
            node: AtomicI32::new(-1),
            ntuples: AtomicI32::new(0),
            status: AtomicU32::new(SlotStatus::Active as u32),
            qstart: AtomicUsize::new(qstart),
            qlength: AtomicUsize::new(qlength),
            readpos: AtomicUsize::new(0),
            writepos: AtomicUsize::new(0),
            stats: SlotCounters::default(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn node(&self) -> NodeId {
        self.node.load(Ordering::Acquire)
    }

    pub fn set_node(&self, node: NodeId) {
        self.node.store(node, Ordering::Release);
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SlotStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    pub fn tuple_count(&self) -> TupleCount {
        TupleCount::from_raw(self.ntuples.load(Ordering::Acquire))
    }

    fn set_tuple_count(&self, count: TupleCount) {
        self.ntuples.store(count.to_raw(), Ordering::Release);
    }

    pub fn qstart(&self) -> usize {
        self.qstart.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.qlength.load(Ordering::Relaxed)
    }

    pub fn read_pos(&self) -> usize {
        self.readpos.load(Ordering::Acquire)
    }

    pub fn write_pos(&self) -> usize {
        self.writepos.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SlotStats {
        self.stats.snapshot()
    }

    /// Drop everything buffered, keeping the count and cursors consistent.
    pub fn discard(&self) {
        self.set_tuple_count(TupleCount::Empty);
        self.readpos.store(0, Ordering::Release);
        self.writepos.store(0, Ordering::Release);
    }
}

/// Outcome of reading one chunk of a long record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Chunk {
    Complete,
    NeedMore,
}

/// Consumer-side assembly buffer of a long record.
pub(crate) struct LongRecord {
    data: Vec<u8>,
    offset: usize,
}

impl LongRecord {
    pub fn new(len: usize) -> LongRecord {
        LongRecord {
            data: vec![0u8; len],
            offset: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Ring operations over one slot. Only valid while the slot lock is held.
pub(crate) struct Ring<'a> {
    state: &'a ConsumerState,
    data: *mut u8,
}

impl<'a> Ring<'a> {
    /// # Safety
    ///
    /// `data` must point at `state.capacity()` writable bytes, and the caller
    /// must hold the slot lock for as long as the ring is used.
    pub unsafe fn new(state: &'a ConsumerState, data: *mut u8) -> Ring<'a> {
        Ring { state, data }
    }

    pub fn state(&self) -> &'a ConsumerState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity()
    }

    pub fn tuple_count(&self) -> TupleCount {
        self.state.tuple_count()
    }

    pub fn free_space(&self) -> usize {
        if self.tuple_count().rows() == 0 {
            return self.capacity();
        }
        let (read, write) = (self.state.read_pos(), self.state.write_pos());
        if read >= write {
            read - write
        } else {
            self.capacity() + read - write
        }
    }

    pub fn used_space(&self) -> usize {
        self.capacity() - self.free_space()
    }

    /// Whether a record with a `len` byte payload fits right now.
    pub fn fits(&self, len: usize) -> bool {
        self.free_space() >= LEN_SIZE + len
    }

    /// Whether a record with a `len` byte payload can never fit whole.
    pub fn is_long(&self, len: usize) -> bool {
        len > self.capacity() - LEN_SIZE
    }

    fn write_bytes(&self, bytes: &[u8]) {
        let cap = self.capacity();
        let pos = self.state.write_pos();
        let len = bytes.len();
        // SAFETY: every copy stays within [data, data + cap).
        unsafe {
            if pos + len <= cap {
                ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(pos), len);
                self.state.writepos.store((pos + len) % cap, Ordering::Release);
            } else {
                let part = cap - pos;
                ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(pos), part);
                ptr::copy_nonoverlapping(bytes.as_ptr().add(part), self.data, len - part);
                self.state.writepos.store(len - part, Ordering::Release);
            }
        }
    }

    fn read_bytes(&self, out: &mut [u8]) {
        let cap = self.capacity();
        let pos = self.state.read_pos();
        let len = out.len();
        // SAFETY: every copy stays within [data, data + cap).
        unsafe {
            if pos + len <= cap {
                ptr::copy_nonoverlapping(self.data.add(pos), out.as_mut_ptr(), len);
                self.state.readpos.store((pos + len) % cap, Ordering::Release);
            } else {
                let part = cap - pos;
                ptr::copy_nonoverlapping(self.data.add(pos), out.as_mut_ptr(), part);
                ptr::copy_nonoverlapping(self.data, out.as_mut_ptr().add(part), len - part);
                self.state.readpos.store(len - part, Ordering::Release);
            }
        }
    }

    /// Producers reject payloads over [`MAX_RECORD_LEN`] before they get here.
    fn write_len(&self, len: usize) {
        debug_assert!(len <= MAX_RECORD_LEN);
        self.write_bytes(&(len as u32).to_ne_bytes());
    }

    pub fn read_len(&self) -> usize {
        let mut word = [0u8; LEN_SIZE];
        self.read_bytes(&mut word);
        u32::from_ne_bytes(word) as usize
    }

    fn add_row(&self) -> bool {
        let rows = self.tuple_count().rows();
        self.state.set_tuple_count(TupleCount::Rows(rows + 1));
        rows == 0
    }

    /// Append a record the caller checked with [`Ring::fits`]. Returns true
    /// when the ring was empty, i.e. the consumer may be sleeping.
    pub fn push(&self, payload: &[u8]) -> bool {
        debug_assert!(self.fits(payload.len()));
        self.write_len(payload.len());
        self.write_bytes(payload);
        self.add_row()
    }

    /// Read a payload of `len` bytes whose length word was just consumed.
    pub fn read_payload(&self, len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len];
        self.read_bytes(&mut payload);
        payload
    }

    /// Account for one record handed to the reader.
    pub fn take_row(&self) {
        let rows = self.tuple_count().rows();
        let count = if rows > 1 {
            TupleCount::Rows(rows - 1)
        } else {
            TupleCount::Empty
        };
        self.state.set_tuple_count(count);
        debug_assert_eq!(
            count == TupleCount::Empty,
            self.state.read_pos() == self.state.write_pos()
        );
    }

    /// Producer side of the long record transfer. Only called while no
    /// complete record is queued. Returns true once the last byte is out.
    pub fn push_long(&self, payload: &[u8]) -> Result<bool> {
        let chunk = self.capacity() - LEN_SIZE;
        match self.tuple_count() {
            TupleCount::Empty => {
                // Full length first so the consumer can size its buffer.
                debug_assert!(payload.len() > chunk);
                self.write_len(payload.len());
                self.write_bytes(&payload[..chunk]);
                self.state.set_tuple_count(TupleCount::Rows(1));
                Ok(false)
            }
            TupleCount::LongRecord => {
                let offset = self.consumer_offset();
                if offset == 0 || offset >= payload.len() {
                    return Err(SharedQueueError::LongRecordMismatch {
                        expected: payload.len(),
                        actual: offset,
                    });
                }
                let remaining = payload.len() - offset;
                self.write_len(remaining);
                let len = remaining.min(chunk);
                self.write_bytes(&payload[offset..offset + len]);
                self.state.set_tuple_count(TupleCount::Rows(1));
                Ok(len == remaining)
            }
            TupleCount::Rows(_) => Ok(false),
        }
    }

    /// Consumer side: copy the next portion of `record` out of the ring,
    /// `remaining` being the length word that preceded it. On `NeedMore` the
    /// slot is switched to long record mode and the offset is left for the
    /// producer at the start of the ring.
    pub fn pull_chunk(&self, record: &mut LongRecord, remaining: usize) -> Chunk {
        let len = remaining.min(self.capacity() - LEN_SIZE);
        let start = record.offset;
        self.read_bytes(&mut record.data[start..start + len]);
        record.offset += len;
        if record.offset == record.data.len() {
            return Chunk::Complete;
        }
        debug_assert_eq!(self.tuple_count(), TupleCount::Rows(1));
        self.state.set_tuple_count(TupleCount::LongRecord);
        let word = (record.offset as u32).to_ne_bytes();
        // SAFETY: the ring is at least LEN_SIZE bytes long.
        unsafe { ptr::copy_nonoverlapping(word.as_ptr(), self.data, LEN_SIZE) };
        Chunk::NeedMore
    }

    /// Consumer side: read the remaining-length word of the next chunk and
    /// check it continues `record`.
    pub fn resume_long(&self, record: &LongRecord) -> Result<usize> {
        let remaining = self.read_len();
        let expected = record.data.len() - record.offset;
        if remaining != expected {
            return Err(SharedQueueError::LongRecordMismatch {
                expected,
                actual: remaining,
            });
        }
        Ok(remaining)
    }

    fn consumer_offset(&self) -> usize {
        let mut word = [0u8; LEN_SIZE];
        // SAFETY: the ring is at least LEN_SIZE bytes long.
        unsafe { ptr::copy_nonoverlapping(self.data, word.as_mut_ptr(), LEN_SIZE) };
        u32::from_ne_bytes(word) as usize
    }
}
