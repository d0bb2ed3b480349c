use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::errors::{Result, SharedQueueError};
use crate::overflow::OverflowStore;
use crate::registry::{ConsumerMapping, QueueHandle, SlotGuard};
use crate::ring::{record_len, SlotCounters, SlotStats, SlotStatus};
use crate::segment::{Session, WaitResult};

/// Producing side of a bound queue.
///
/// Records a consumer ring has no room for are kept in a per-consumer
/// overflow store and pushed on later writes, [`Producer::finish`] or
/// [`Producer::drain`]. Dropping a producer that was never unbound unbinds
/// it as failed.
pub struct Producer<'a> {
    queue: QueueHandle<'a>,
    session: Session,
    consumer_map: Vec<ConsumerMapping>,
    overflow: Vec<Option<OverflowStore>>,
    unbound: bool,
}

impl<'a> Producer<'a> {
    pub(crate) fn new(
        queue: QueueHandle<'a>,
        session: Session,
        consumer_map: Vec<ConsumerMapping>,
    ) -> Producer<'a> {
        let overflow = (0..queue.nconsumers()).map(|_| None).collect();
        Producer {
            queue,
            session,
            consumer_map,
            overflow,
            unbound: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    pub fn session(&self) -> Session {
        self.session
    }

    /// Mapping of each distribution node, in the order they were passed to bind.
    pub fn consumer_map(&self) -> &[ConsumerMapping] {
        &self.consumer_map
    }

    pub fn consumers(&self) -> usize {
        self.queue.nconsumers()
    }

    /// Records waiting in the overflow store of consumer `index`.
    pub fn pending(&self, index: usize) -> usize {
        self.overflow
            .get(index)
            .and_then(Option::as_ref)
            .map_or(0, OverflowStore::len)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.consumers() {
            return Err(SharedQueueError::InvalidConsumerIndex {
                name: self.queue.name.clone(),
                index,
                consumers: self.consumers(),
            });
        }
        Ok(())
    }

    /// Queue `record` for consumer `index`. Never blocks: a full ring sends
    /// the record to the overflow store, a closed consumer drops it.
    pub fn write(&mut self, index: usize, record: &[u8]) -> Result<()> {
        self.check_index(index)?;
        record_len(record.len())?;
        let slot = self.queue.lock_slot(index)?;
        SlotCounters::bump(&slot.state().stats.writes);

        if slot.status() != SlotStatus::Active {
            trace!(queue = %self.queue.name, index, status = %slot.status(), "consumer is not active, discarding record");
            self.overflow[index] = None;
            return Ok(());
        }

        if let Some(store) = self.overflow[index].as_mut() {
            // Dumping is only worth it once the ring is half empty.
            let dumped = slot.free_space() > slot.capacity() / 2 && dump(&slot, store)?;
            if !dumped {
                SlotCounters::bump(&slot.state().stats.overflow_writes);
                drop(slot);
                return store.push(record);
            }
            self.overflow[index] = None;
        }

        if !slot.fits(record.len()) {
            SlotCounters::bump(&slot.state().stats.overflow_writes);
            let stats = slot.state().stats();
            let queued = slot.tuple_count().rows();
            drop(slot);
            let limit = self.queue.shared.config().overflow_memory_limit;
            let store = self.overflow[index].get_or_insert_with(|| {
                debug!(
                    queue = %self.queue.name,
                    index,
                    queued,
                    writes = stats.writes,
                    reads = stats.reads,
                    "start buffering"
                );
                OverflowStore::new(limit)
            });
            return store.push(record);
        }

        if slot.push(record) {
            slot.latch.set()?;
        }
        Ok(())
    }

    /// Mark every consumer without pending overflow as at EOF and push what
    /// overflow fits. Returns how many consumers still have records pending;
    /// call again once consumers made room.
    pub fn finish(&mut self) -> Result<usize> {
        let log_stats = self.queue.entry.mark_stats_logged();
        let mut pending = 0;
        for index in 0..self.queue.nconsumers() {
            let slot = self.queue.lock_slot(index)?;
            if log_stats {
                let stats = slot.state().stats();
                debug!(
                    queue = %self.queue.name,
                    node = slot.node(),
                    writes = stats.writes,
                    reads = stats.reads,
                    overflow_writes = stats.overflow_writes,
                    overflow_reads = stats.overflow_reads,
                    overflow_returns = stats.overflow_returns,
                    "finishing"
                );
            }
            let active = slot.status() == SlotStatus::Active;
            let drop_store = match self.overflow[index].as_mut() {
                None => {
                    if active {
                        slot.set_status(SlotStatus::Eof);
                        slot.latch.set()?;
                    }
                    false
                }
                Some(_) if !active => true,
                Some(store) => {
                    pending += 1;
                    let mut dumped = false;
                    if slot.free_space() > slot.capacity() / 2 {
                        dumped = dump(&slot, store)?;
                        if dumped {
                            slot.set_status(SlotStatus::Eof);
                            pending -= 1;
                        }
                        slot.latch.set()?;
                    }
                    dumped
                }
            };
            if drop_store {
                self.overflow[index] = None;
            }
        }
        trace!(queue = %self.queue.name, pending, "finish pass done");
        Ok(pending)
    }

    /// Run [`Producer::finish`] until nothing is pending, sleeping on the
    /// producer latch between passes. Returns the consumers still pending
    /// when a wait of `timeout` went unanswered.
    pub fn drain(&mut self, timeout: Duration) -> Result<usize> {
        loop {
            let pending = self.finish()?;
            if pending == 0 {
                return Ok(0);
            }
            if self.wait_on_producer_latch(Some(timeout))? {
                return Ok(pending);
            }
        }
    }

    /// Whether every active consumer has enough queued to keep reading while
    /// the producer sleeps.
    pub fn can_pause(&self) -> Result<bool> {
        let mut result = true;
        let mut used_space = 0;
        let mut active = 0;
        let mut capacity = 0;
        for index in 0..self.queue.nconsumers() {
            if !result {
                break;
            }
            let slot = self.queue.lock_slot(index)?;
            capacity = slot.capacity();
            if slot.status() == SlotStatus::Active {
                result = slot.tuple_count().rows() > 0;
                used_space += slot.used_space();
                active += 1;
            }
        }
        if active == 0 {
            return Ok(false);
        }
        let result = result && used_space / active > capacity / 2;
        if result {
            self.queue.entry.count_pause();
        }
        Ok(result)
    }

    /// Sleep until a consumer sets the producer latch. Returns true on timeout.
    pub fn wait_on_producer_latch(&self, timeout: Option<Duration>) -> Result<bool> {
        let latch = self.queue.producer_latch();
        let result = latch.wait(timeout, self.queue.liveness())?;
        latch.reset()?;
        Ok(result == WaitResult::TimedOut)
    }

    /// Abandon the queue: every consumer not at EOF or done gets an error and
    /// loses what is buffered for it.
    pub fn reset(&mut self) -> Result<()> {
        debug!(queue = %self.queue.name, node = self.session.node, pid = self.session.pid, "resetting producer");
        let _producer = self.queue.lock_producer_shared()?;
        for index in 0..self.queue.nconsumers() {
            let slot = self.queue.lock_slot(index)?;
            match slot.status() {
                SlotStatus::Eof | SlotStatus::Done => {}
                status => {
                    debug!(queue = %self.queue.name, index, node = slot.node(), %status, "marking consumer failed");
                    slot.set_status(SlotStatus::Error);
                    slot.state().discard();
                    slot.latch.set()?;
                    self.queue.producer_latch().set()?;
                }
            }
        }
        self.overflow.iter_mut().for_each(|store| *store = None);
        Ok(())
    }

    /// Assume consumers that have not attached yet never will. Returns how
    /// many were given up on.
    pub fn reset_not_connected(&self) -> Result<usize> {
        let _producer = self.queue.lock_producer()?;
        let mut reset = 0;
        for index in 0..self.queue.nconsumers() {
            let slot = self.queue.lock_slot(index)?;
            if slot.pid() == 0 && slot.status() != SlotStatus::Done {
                debug!(queue = %self.queue.name, index, node = slot.node(), status = %slot.status(), "consumer never connected, marking done");
                slot.set_status(SlotStatus::Done);
                slot.state().discard();
                slot.latch.set()?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Per-consumer traffic counters.
    pub fn stats(&self) -> Result<Vec<SlotStats>> {
        (0..self.queue.nconsumers())
            .map(|index| -> Result<SlotStats> { Ok(self.queue.lock_slot(index)?.state().stats()) })
            .collect()
    }

    pub fn paused(&self) -> u64 {
        self.queue.entry.paused()
    }

    /// Wait for every consumer to be done and drop the producer's reference.
    ///
    /// Without `failed`, buffered records are delivered first. With `failed`
    /// set, active consumers are switched to error instead of being waited
    /// for. Consumers that do not attach within the connect timeout are given
    /// up on. If the wait itself fails, the queue is abandoned as failed and
    /// the error returned.
    pub fn unbind(mut self, failed: bool) -> Result<()> {
        self.close(failed)
    }

    fn close(&mut self, failed: bool) -> Result<()> {
        let result = self.unbind_inner(failed);
        if let Err(e) = &result {
            warn!(queue = %self.queue.name, error = %e, "unbind failed, abandoning queue");
            if let Err(e) = self.abandon() {
                error!(queue = %self.queue.name, error = %e, "failed to abandon queue");
            }
        }
        self.unbound = true;
        result
    }

    fn unbind_inner(&mut self, failed: bool) -> Result<()> {
        let name = self.queue.name.clone();
        debug!(queue = %name, failed, node = self.session.node, pid = self.session.pid, "unbinding");
        if failed {
            self.overflow.iter_mut().for_each(|store| *store = None);
        } else {
            self.flush_overflow()?;
        }
        loop {
            self.wait_for_consumers(failed)?;

            let _registry = self.queue.shared.lock_registry()?;
            let _producer = self.queue.lock_producer()?;
            let mut running = 0;
            for index in 0..self.queue.nconsumers() {
                let slot = self.queue.lock_slot(index)?;
                if slot.status() == SlotStatus::Active && slot.pid() != 0 {
                    debug!(queue = %name, index, node = slot.node(), pid = slot.pid(), "consumer attached while unbinding");
                    running += 1;
                }
            }
            if running > 0 {
                continue;
            }

            self.queue.producer_latch().disown();
            debug!(queue = %name, pauses = self.queue.entry.paused(), "producer unbound");
            if self.queue.entry.drop_ref() == 0 {
                self.queue.shared.remove_entry(self.queue.index, &name);
            }
            return Ok(());
        }
    }

    /// Finish until no consumer has overflow left. Consumers that never
    /// attach within the connect timeout are given up on, which drops their
    /// overflow on the next pass.
    fn flush_overflow(&mut self) -> Result<()> {
        let timeout = self.queue.shared.config().connect_timeout();
        loop {
            let pending = self.finish()?;
            if pending == 0 {
                return Ok(());
            }
            trace!(queue = %self.queue.name, pending, "delivering overflow before unbind");
            if self.wait_on_producer_latch(Some(timeout))? {
                let reset = self.reset_not_connected()?;
                if reset > 0 {
                    warn!(queue = %self.queue.name, reset, "gave up on consumers that did not connect in time");
                }
            }
        }
    }

    /// Last resort when unbinding failed: fail the active consumers and drop
    /// the producer's reference without waiting or checking liveness.
    fn abandon(&mut self) -> Result<()> {
        self.overflow.iter_mut().for_each(|store| *store = None);
        let _registry = self.queue.shared.lock_registry_unchecked()?;
        let _producer = self.queue.lock_producer()?;
        for index in 0..self.queue.nconsumers() {
            let slot = self.queue.lock_slot(index)?;
            if slot.status() == SlotStatus::Active {
                slot.set_status(SlotStatus::Error);
                slot.latch.set()?;
            }
        }
        self.queue.producer_latch().disown();
        if self.queue.entry.drop_ref() == 0 {
            self.queue.shared.remove_entry(self.queue.index, &self.queue.name);
        }
        Ok(())
    }

    fn wait_for_consumers(&self, failed: bool) -> Result<()> {
        loop {
            let mut waiting = 0;
            let mut unbound = 0;
            {
                let _producer = self.queue.lock_producer()?;
                for index in 0..self.queue.nconsumers() {
                    let slot = self.queue.lock_slot(index)?;
                    let status = slot.status();
                    if failed {
                        if status == SlotStatus::Active {
                            debug!(queue = %self.queue.name, index, "operation failed, marking consumer failed");
                            slot.set_status(SlotStatus::Error);
                            slot.latch.set()?;
                        }
                    } else if status != SlotStatus::Done {
                        waiting += 1;
                        if slot.pid() == 0 {
                            unbound += 1;
                        }
                        slot.latch.set()?;
                        self.queue.producer_latch().reset()?;
                    }
                }
            }
            if waiting == 0 {
                return Ok(());
            }
            debug!(queue = %self.queue.name, waiting, unbound, "waiting for consumers to finish");
            let timeout = self.queue.shared.config().connect_timeout();
            let latch = self.queue.producer_latch();
            if latch.wait(Some(timeout), self.queue.liveness())? == WaitResult::TimedOut {
                let reset = self.reset_not_connected()?;
                if reset > 0 {
                    warn!(queue = %self.queue.name, reset, "gave up on consumers that did not connect in time");
                }
            }
        }
    }
}

impl<'a> Drop for Producer<'a> {
    fn drop(&mut self) {
        if self.unbound {
            return;
        }
        if let Err(e) = self.close(true) {
            error!(queue = %self.queue.name, error = %e, "failed to unbind producer");
        }
    }
}

/// Move records from `store` into the ring, pushing a long record through
/// chunk by chunk. Returns true once the store is empty.
fn dump(slot: &SlotGuard<'_>, store: &mut OverflowStore) -> Result<bool> {
    let stats = &slot.state().stats;
    while let Some(record) = store.front()? {
        SlotCounters::bump(&stats.overflow_reads);
        if !slot.fits(record.len()) {
            if slot.tuple_count().rows() == 0 {
                let done = slot.push_long(record)?;
                // Some of it went out either way.
                slot.latch.set()?;
                if done {
                    store.pop_front()?;
                    continue;
                }
            }
            SlotCounters::bump(&stats.overflow_returns);
            return Ok(false);
        }
        if slot.push(record) {
            slot.latch.set()?;
        }
        store.pop_front()?;
    }
    Ok(true)
}
