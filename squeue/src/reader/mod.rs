use tracing::{debug, error, trace};

use crate::errors::{Result, SharedQueueError};
use crate::registry::{QueueHandle, SlotGuard};
use crate::ring::{Chunk, LongRecord, SlotCounters, SlotStatus, TupleCount};
use crate::segment::Session;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Record(Vec<u8>),
    /// The producer finished and everything was read.
    Eof,
    /// Nothing queued and the caller asked not to wait.
    WouldBlock,
}

/// Reading side of a bound queue, attached to one consumer slot.
///
/// Dropping a consumer that has not reached EOF marks its slot done, so the
/// producer stops waiting for it.
pub struct Consumer<'a> {
    queue: QueueHandle<'a>,
    session: Session,
    index: usize,
    finished: bool,
}

impl<'a> Consumer<'a> {
    pub(crate) fn new(queue: QueueHandle<'a>, session: Session, index: usize) -> Consumer<'a> {
        Consumer {
            queue,
            session,
            index,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    pub fn session(&self) -> Session {
        self.session
    }

    /// Slot this consumer reads from.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Take the next record. With `can_wait` an empty ring puts the caller to
    /// sleep until the producer writes or finishes.
    pub fn read(&mut self, can_wait: bool) -> Result<ReadOutcome> {
        let index = self.index;
        let latch = self.queue.consumer_latch(index);
        let mut producer = self.queue.lock_producer_shared()?;
        let mut slot = self.queue.lock_slot(index)?;

        while slot.tuple_count().rows() == 0 {
            match slot.status() {
                SlotStatus::Eof => {
                    debug!(queue = %self.queue.name, index, node = slot.node(), "end of data, consumer done");
                    slot.set_status(SlotStatus::Done);
                    latch.disown();
                    drop(slot);
                    self.finished = true;
                    self.queue.producer_latch().set()?;
                    return Ok(ReadOutcome::Eof);
                }
                status @ (SlotStatus::Error | SlotStatus::Done) => {
                    return Err(self.fail(slot, status));
                }
                SlotStatus::Active => {}
            }
            if !can_wait {
                return Ok(ReadOutcome::WouldBlock);
            }
            // Reset under the slot lock so a write in between is not lost.
            latch.reset()?;
            drop(slot);
            trace!(queue = %self.queue.name, index, "queue empty, waiting for producer");
            self.queue.producer_latch().set()?;
            drop(producer);
            latch.wait(None, self.queue.liveness())?;
            producer = self.queue.lock_producer_shared()?;
            slot = self.queue.lock_slot(index)?;
        }

        let len = slot.read_len();
        let record = if slot.is_long(len) {
            let mut record = LongRecord::new(len);
            let mut remaining = len;
            while slot.pull_chunk(&mut record, remaining) == Chunk::NeedMore {
                trace!(queue = %self.queue.name, index, offset = record.offset(), len, "waiting for next part of long record");
                while slot.tuple_count() == TupleCount::LongRecord {
                    self.queue.producer_latch().set()?;
                    latch.reset()?;
                    drop(slot);
                    drop(producer);
                    latch.wait(None, self.queue.liveness())?;
                    producer = self.queue.lock_producer_shared()?;
                    slot = self.queue.lock_slot(index)?;
                    let status = slot.status();
                    if matches!(status, SlotStatus::Error | SlotStatus::Done) {
                        return Err(self.fail(slot, status));
                    }
                }
                remaining = slot.resume_long(&record)?;
            }
            record.into_inner()
        } else {
            slot.read_payload(len)
        };
        slot.take_row();
        SlotCounters::bump(&slot.state().stats.reads);
        drop(slot);
        drop(producer);
        Ok(ReadOutcome::Record(record))
    }

    /// Report a slot the producer gave up on, closing it on the way out.
    fn fail(&mut self, slot: SlotGuard<'_>, status: SlotStatus) -> SharedQueueError {
        let index = self.index;
        let name = self.queue.name.clone();
        if status == SlotStatus::Done {
            return SharedQueueError::SlotClosed { name, index };
        }
        debug!(queue = %name, index, node = slot.node(), pid = slot.pid(), %status, "producer failed");
        slot.set_status(SlotStatus::Done);
        slot.latch.disown();
        drop(slot);
        self.finished = true;
        if let Err(e) = self.queue.producer_latch().set() {
            return e;
        }
        SharedQueueError::ProducerFailed {
            name,
            index,
            status,
        }
    }

    /// Stop reading: the slot is done and whatever is still queued is ignored.
    pub fn reset(&mut self) -> Result<()> {
        self.finished = true;
        let _producer = self.queue.lock_producer_shared()?;
        let slot = self.queue.lock_slot(self.index)?;
        if slot.status() != SlotStatus::Done {
            debug!(queue = %self.queue.name, index = self.index, node = slot.node(), pid = slot.pid(), status = %slot.status(), "consumer reset, marking done");
            slot.set_status(SlotStatus::Done);
            if slot.pid() > 0 {
                slot.latch.disown();
            }
            self.queue.producer_latch().set()?;
        }
        Ok(())
    }
}

impl<'a> Drop for Consumer<'a> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.reset() {
            error!(queue = %self.queue.name, index = self.index, error = %e, "failed to reset consumer");
        }
    }
}
