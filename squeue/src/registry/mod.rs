//! Fixed-capacity table of named queues living in the shared segment.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::{mem, ptr, thread};

use raw_sync::locks::{LockGuard, ReadLockGuard};
use tracing::{debug, error, trace, warn};

use crate::errors::{sync_error, Result, SharedQueueError};
use crate::reader::Consumer;
use crate::ring::{ConsumerState, Ring, SlotStats, SlotStatus, TupleCount, LEN_SIZE};
use crate::segment::layout::{queue_header_size, ring_length};
use crate::segment::sync::{Latch, Liveness, SyncBlock};
use crate::segment::{NodeId, Session, SharedQueues};
use crate::writer::Producer;

pub const KEY_SIZE: usize = 64;
/// Longest queue name; the key keeps one byte for its terminator.
pub const MAX_NAME_LEN: usize = KEY_SIZE - 1;

/// Header of one registry entry. The consumer states follow it directly,
/// the rings after those.
#[repr(C)]
pub(crate) struct QueueHeader {
    key: UnsafeCell<[u8; KEY_SIZE]>,
    in_use: AtomicU32,
    producer_pid: AtomicU32,
    producer_node: AtomicI32,
    sync_index: AtomicU32,
    refcnt: AtomicU32,
    nconsumers: AtomicU32,
    stats_logged: AtomicU32,
    paused: AtomicU64,
}

impl QueueHeader {
    /// # Safety
    ///
    /// `mem` points at an entry of the segment nobody else can see yet.
    pub unsafe fn format_unused(mem: *mut u8) {
        (mem as *mut QueueHeader).write(QueueHeader {
            key: UnsafeCell::new([0u8; KEY_SIZE]),
            in_use: AtomicU32::new(0),
            producer_pid: AtomicU32::new(0),
            producer_node: AtomicI32::new(-1),
            sync_index: AtomicU32::new(0),
            refcnt: AtomicU32::new(0),
            nconsumers: AtomicU32::new(0),
            stats_logged: AtomicU32::new(0),
            paused: AtomicU64::new(0),
        });
    }
}

/// View of one registry entry. Key and geometry change only under the
/// registry lock, slot state only under the slot lock.
#[derive(Clone, Copy)]
pub(crate) struct Entry<'a> {
    base: *mut u8,
    _segment: PhantomData<&'a SharedQueues>,
}

impl<'a> Entry<'a> {
    /// # Safety
    ///
    /// `base` is the start of an entry formatted by [`QueueHeader::format_unused`]
    /// inside a mapping that lives for `'a`.
    pub unsafe fn new(base: *mut u8) -> Entry<'a> {
        Entry {
            base,
            _segment: PhantomData,
        }
    }

    fn header(&self) -> &'a QueueHeader {
        // SAFETY: guaranteed by the contract of `Entry::new`.
        unsafe { &*(self.base as *const QueueHeader) }
    }

    pub fn in_use(&self) -> bool {
        self.header().in_use.load(Ordering::Acquire) != 0
    }

    pub fn name(&self) -> String {
        // SAFETY: the key is only written under the registry lock.
        let key = unsafe { &*self.header().key.get() };
        let len = key.iter().position(|&b| b == 0).unwrap_or(KEY_SIZE);
        String::from_utf8_lossy(&key[..len]).into_owned()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.in_use() && self.name() == name
    }

    pub fn producer_pid(&self) -> u32 {
        self.header().producer_pid.load(Ordering::Acquire)
    }

    pub fn producer_node(&self) -> NodeId {
        self.header().producer_node.load(Ordering::Acquire)
    }

    pub fn sync_index(&self) -> usize {
        self.header().sync_index.load(Ordering::Acquire) as usize
    }

    pub fn nconsumers(&self) -> usize {
        self.header().nconsumers.load(Ordering::Acquire) as usize
    }

    pub fn refcount(&self) -> u32 {
        self.header().refcnt.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) -> u32 {
        self.header().refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn drop_ref(&self) -> u32 {
        self.header().refcnt.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn paused(&self) -> u64 {
        self.header().paused.load(Ordering::Relaxed)
    }

    pub fn count_pause(&self) {
        self.header().paused.fetch_add(1, Ordering::Relaxed);
    }

    /// True only for the first caller.
    pub fn mark_stats_logged(&self) -> bool {
        self.header().stats_logged.swap(1, Ordering::AcqRel) == 0
    }

    fn bind_producer(&self, session: Session) {
        self.header().producer_pid.store(session.pid, Ordering::Release);
        self.header().producer_node.store(session.node, Ordering::Release);
    }

    pub fn slot(&self, index: usize) -> &'a ConsumerState {
        assert!(index < self.nconsumers());
        // SAFETY: the consumer states follow the header inside the entry.
        unsafe {
            &*(self.base.add(mem::size_of::<QueueHeader>()) as *const ConsumerState).add(index)
        }
    }

    /// # Safety
    ///
    /// The caller holds the slot lock for as long as the ring is used.
    pub unsafe fn ring(&self, index: usize) -> Ring<'a> {
        let state = self.slot(index);
        Ring::new(state, self.base.add(state.qstart()))
    }

    /// Lay the entry out for `consumers` slots. Caller holds the registry lock
    /// and has checked the ring length.
    fn format(&self, name: &str, consumers: usize, ring_len: usize, sync_index: usize) {
        let header = self.header();
        // SAFETY: the entry is not in use and the registry lock is held.
        unsafe {
            let key = &mut *header.key.get();
            key.fill(0);
            key[..name.len()].copy_from_slice(name.as_bytes());
        }
        header.producer_pid.store(0, Ordering::Relaxed);
        header.producer_node.store(-1, Ordering::Relaxed);
        header.sync_index.store(sync_index as u32, Ordering::Relaxed);
        header.refcnt.store(1, Ordering::Relaxed);
        header.nconsumers.store(consumers as u32, Ordering::Relaxed);
        header.stats_logged.store(0, Ordering::Relaxed);
        header.paused.store(0, Ordering::Relaxed);
        let mut qstart = queue_header_size(consumers);
        for i in 0..consumers {
            // SAFETY: slot i lies between the header and the first ring.
            unsafe {
                let state = (self.base.add(mem::size_of::<QueueHeader>()) as *mut ConsumerState).add(i);
                ptr::write(state, ConsumerState::new(qstart, ring_len));
            }
            qstart += ring_len;
        }
        header.in_use.store(1, Ordering::Release);
    }

    fn clear(&self) {
        self.header().in_use.store(0, Ordering::Release);
    }
}

/// Where the producer sends rows meant for a distribution node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsumerMapping {
    /// The producer's own node; rows never go through the queue.
    Myself,
    /// Consumer slot the node reads from.
    Slot(usize),
    /// The node will never read; rows for it are dropped.
    Absent,
}

pub enum Binding<'a> {
    Producer(Producer<'a>),
    Consumer(Consumer<'a>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub index: usize,
    pub node: NodeId,
    pub pid: u32,
    pub status: SlotStatus,
    pub tuple_count: TupleCount,
    pub capacity: usize,
    pub free_space: usize,
    pub read_pos: usize,
    pub write_pos: usize,
    pub stats: SlotStats,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub name: String,
    pub producer_pid: u32,
    pub producer_node: NodeId,
    pub sync_block: usize,
    pub refcount: u32,
    pub paused: u64,
    pub consumers: Vec<SlotSnapshot>,
}

/// A slot with its lock held.
pub(crate) struct SlotGuard<'a> {
    ring: Ring<'a>,
    pub latch: &'a Latch,
    _lock: LockGuard<'a>,
}

impl<'a> Deref for SlotGuard<'a> {
    type Target = Ring<'a>;

    fn deref(&self) -> &Ring<'a> {
        &self.ring
    }
}

impl<'a> SlotGuard<'a> {
    pub fn status(&self) -> SlotStatus {
        self.ring.state().status()
    }

    pub fn set_status(&self, status: SlotStatus) {
        self.ring.state().set_status(status)
    }

    pub fn pid(&self) -> u32 {
        self.ring.state().pid()
    }

    pub fn node(&self) -> NodeId {
        self.ring.state().node()
    }
}

/// A bound queue: the entry plus the sync block serving it.
pub(crate) struct QueueHandle<'a> {
    pub shared: &'a SharedQueues,
    pub index: usize,
    pub name: String,
    pub entry: Entry<'a>,
    pub sync: &'a SyncBlock,
}

impl<'a> QueueHandle<'a> {
    fn new(shared: &'a SharedQueues, index: usize) -> QueueHandle<'a> {
        let entry = shared.entry(index);
        QueueHandle {
            shared,
            index,
            name: entry.name(),
            entry,
            sync: shared.sync_block(entry.sync_index()),
        }
    }

    pub fn nconsumers(&self) -> usize {
        self.entry.nconsumers()
    }

    pub fn liveness(&self) -> &'a Liveness {
        self.shared.liveness()
    }

    pub fn producer_latch(&self) -> &'a Latch {
        &self.sync.producer_latch
    }

    pub fn consumer_latch(&self, index: usize) -> &'a Latch {
        &self.sync.consumers[index].latch
    }

    pub fn lock_producer(&self) -> Result<LockGuard<'a>> {
        let sync: &'a SyncBlock = self.sync;
        sync.producer_lock.lock().map_err(sync_error)
    }

    pub fn lock_producer_shared(&self) -> Result<ReadLockGuard<'a>> {
        let sync: &'a SyncBlock = self.sync;
        sync.producer_lock.rlock().map_err(sync_error)
    }

    pub fn lock_slot(&self, index: usize) -> Result<SlotGuard<'a>> {
        let sync: &'a SyncBlock = self.sync;
        let consumer = &sync.consumers[index];
        let lock = consumer.lock.lock().map_err(sync_error)?;
        Ok(SlotGuard {
            // SAFETY: the slot lock is held by the guard built alongside.
            ring: unsafe { self.entry.ring(index) },
            latch: &consumer.latch,
            _lock: lock,
        })
    }

    fn snapshot(&self) -> Result<QueueSnapshot> {
        let mut consumers = Vec::with_capacity(self.nconsumers());
        for index in 0..self.nconsumers() {
            let slot = self.lock_slot(index)?;
            let state = slot.state();
            consumers.push(SlotSnapshot {
                index,
                node: state.node(),
                pid: state.pid(),
                status: state.status(),
                tuple_count: state.tuple_count(),
                capacity: state.capacity(),
                free_space: slot.free_space(),
                read_pos: state.read_pos(),
                write_pos: state.write_pos(),
                stats: state.stats(),
            });
        }
        Ok(QueueSnapshot {
            name: self.name.clone(),
            producer_pid: self.entry.producer_pid(),
            producer_node: self.entry.producer_node(),
            sync_block: self.entry.sync_index(),
            refcount: self.entry.refcount(),
            paused: self.entry.paused(),
            consumers,
        })
    }
}

impl SharedQueues {
    /// Reserve the queue `name` for this process.
    ///
    /// The first caller creates and formats the entry; later callers join it.
    /// An entry still held by the producer of an earlier execution under the
    /// same name is waited out, up to `race_retry_limit` times.
    pub fn acquire(&self, session: Session, name: &str, consumers: usize) -> Result<()> {
        if name.len() > MAX_NAME_LEN || name.as_bytes().contains(&0) {
            return Err(SharedQueueError::NameTooLong {
                name: name.to_string(),
                max: MAX_NAME_LEN,
            });
        }
        if consumers == 0 || consumers > self.max_consumers() {
            return Err(SharedQueueError::InvalidConsumerCount {
                count: consumers,
                max: self.max_consumers(),
            });
        }
        let mut tries = 0;
        loop {
            let registry = self.lock_registry()?;
            let index = match self.find_entry(name) {
                Some(index) => index,
                None => {
                    self.create_entry(name, consumers)?;
                    return Ok(());
                }
            };
            let queue = QueueHandle::new(self, index);
            debug!(
                queue = name,
                producer_pid = queue.entry.producer_pid(),
                producer_node = queue.entry.producer_node(),
                consumers = queue.nconsumers(),
                "found existing shared queue"
            );
            if !self.is_stale(&queue, session)? {
                queue.entry.add_ref();
                return Ok(());
            }
            drop(registry);
            tries += 1;
            if tries >= self.config().race_retry_limit {
                return Err(SharedQueueError::RaceUnresolved {
                    name: name.to_string(),
                    tries,
                });
            }
            debug!(queue = name, tries, "shared queue still held by previous producer, retrying");
            thread::sleep(self.config().race_retry_delay());
        }
    }

    /// An entry with a bound producer in which the caller's node has no live
    /// slot was left over by an earlier execution.
    fn is_stale(&self, queue: &QueueHandle<'_>, session: Session) -> Result<bool> {
        if queue.entry.producer_pid() == 0 {
            return Ok(false);
        }
        for index in 0..queue.nconsumers() {
            if queue.entry.slot(index).node() == session.node {
                let slot = queue.lock_slot(index)?;
                return Ok(slot.status() == SlotStatus::Done);
            }
        }
        Ok(true)
    }

    /// Attach to an acquired queue. The first binder becomes the producer,
    /// everybody else a consumer.
    pub fn bind(
        &self,
        session: Session,
        name: &str,
        consumer_nodes: &[NodeId],
        distribution_nodes: &[NodeId],
    ) -> Result<Binding<'_>> {
        let registry = self.lock_registry()?;
        let index = self
            .find_entry(name)
            .ok_or_else(|| SharedQueueError::NotFound(name.to_string()))?;
        let queue = QueueHandle::new(self, index);
        let producer_lock = queue.lock_producer()?;
        drop(registry);

        if queue.entry.producer_pid() == 0 {
            queue.entry.bind_producer(session);
            queue.producer_latch().own(session.pid);
            let consumer_map = self.map_consumers(&queue, session, consumer_nodes, distribution_nodes)?;
            queue.entry.add_ref();
            debug!(queue = name, node = session.node, pid = session.pid, "bound as producer");
            drop(producer_lock);
            return Ok(Binding::Producer(Producer::new(queue, session, consumer_map)));
        }

        debug!(
            queue = name,
            producer_node = queue.entry.producer_node(),
            producer_pid = queue.entry.producer_pid(),
            node = session.node,
            "queue has a bound producer, binding as consumer"
        );
        let index = (0..queue.nconsumers())
            .find(|&i| queue.entry.slot(i).node() == session.node)
            .ok_or_else(|| SharedQueueError::NotAConsumer {
                name: name.to_string(),
                node: session.node,
            })?;
        let slot = queue.lock_slot(index)?;
        if slot.pid() != 0 {
            return Err(SharedQueueError::AlreadyBound {
                name: name.to_string(),
                index,
                pid: slot.pid(),
            });
        }
        match slot.status() {
            status @ (SlotStatus::Error | SlotStatus::Done) => {
                // Let the producer unbind, then report its failure.
                slot.set_status(SlotStatus::Done);
                queue.producer_latch().set()?;
                return Err(SharedQueueError::ProducerFailed {
                    name: name.to_string(),
                    index,
                    status,
                });
            }
            SlotStatus::Active | SlotStatus::Eof => {}
        }
        slot.state().set_pid(session.pid);
        slot.latch.own(session.pid);
        debug!(queue = name, index, status = %slot.status(), node = session.node, pid = session.pid, "bound as consumer");
        drop(slot);
        drop(producer_lock);
        Ok(Binding::Consumer(Consumer::new(queue, session, index)))
    }

    /// Hand out consumer slots to the distribution nodes. Caller holds the
    /// producer lock.
    fn map_consumers(
        &self,
        queue: &QueueHandle<'_>,
        session: Session,
        consumer_nodes: &[NodeId],
        distribution_nodes: &[NodeId],
    ) -> Result<Vec<ConsumerMapping>> {
        let mut consumer_map = Vec::with_capacity(distribution_nodes.len());
        for &node in distribution_nodes {
            let mapping = if node == session.node {
                ConsumerMapping::Myself
            } else if consumer_nodes.contains(&node) {
                self.assign_slot(queue, node)?
            } else {
                debug!(queue = %queue.name, node, "node is not a consumer and will never connect");
                ConsumerMapping::Absent
            };
            trace!(queue = %queue.name, node, ?mapping, "consumer mapped");
            consumer_map.push(mapping);
        }
        Ok(consumer_map)
    }

    fn assign_slot(&self, queue: &QueueHandle<'_>, node: NodeId) -> Result<ConsumerMapping> {
        for index in 0..queue.nconsumers() {
            let slot = queue.lock_slot(index)?;
            if slot.node() == node {
                debug!(queue = %queue.name, node, index, status = %slot.status(), "node released its slot already");
                return Ok(ConsumerMapping::Absent);
            }
            if slot.node() == -1 {
                slot.state().set_node(node);
                return Ok(ConsumerMapping::Slot(index));
            }
        }
        warn!(queue = %queue.name, node, "no consumer slot left for node");
        Ok(ConsumerMapping::Absent)
    }

    /// Give up this process's claim on `name`, for a node that will never
    /// read from it. A node that never bound leaves a Done slot behind so the
    /// producer does not wait for it.
    pub fn release(&self, session: Session, name: &str) -> Result<()> {
        let _registry = self.lock_registry()?;
        let index = match self.find_entry(name) {
            Some(index) => index,
            None => {
                debug!(queue = name, "nothing to release");
                return Ok(());
            }
        };
        let queue = QueueHandle::new(self, index);
        debug!(
            queue = name,
            producer_node = queue.entry.producer_node(),
            producer_pid = queue.entry.producer_pid(),
            node = session.node,
            "release requested"
        );
        {
            let _producer = queue.lock_producer()?;
            let producer_node = queue.entry.producer_node();
            if producer_node == -1 {
                debug!(queue = name, "producer not bound yet");
            } else if producer_node != session.node {
                self.release_consumer(&queue, session)?;
            }
        }
        if queue.entry.drop_ref() == 0 {
            self.remove_entry(index, name);
        }
        Ok(())
    }

    fn release_consumer(&self, queue: &QueueHandle<'_>, session: Session) -> Result<()> {
        let name = &queue.name;
        for index in 0..queue.nconsumers() {
            if queue.entry.slot(index).node() != session.node {
                continue;
            }
            let slot = queue.lock_slot(index)?;
            if slot.pid() == 0 {
                // A newer execution may be about to bind this slot.
                debug!(queue = %name, index, "consumer released already");
            } else if slot.status() != SlotStatus::Done {
                slot.set_status(SlotStatus::Done);
                slot.latch.disown();
                slot.state().set_pid(0);
                queue.producer_latch().set()?;
                debug!(queue = %name, index, node = session.node, "consumer released");
            }
            return Ok(());
        }
        debug!(queue = %name, node = session.node, "consumer never bound");
        let mut seeded = false;
        for index in 0..queue.nconsumers() {
            let slot = queue.lock_slot(index)?;
            if slot.node() != -1 {
                continue;
            }
            // Unassigned slots will never get a reader once the producer is bound.
            if !seeded {
                slot.state().set_node(session.node);
                seeded = true;
            }
            slot.set_status(SlotStatus::Done);
            debug!(queue = %name, index, "unused consumer marked done");
        }
        queue.producer_latch().set()
    }

    /// A remote reader closed its statement: every slot of its node is done.
    pub fn disconnect_consumer(&self, session: Session, name: &str) -> Result<()> {
        let registry = self.lock_registry()?;
        let index = match self.find_entry(name) {
            Some(index) => index,
            None => return Ok(()),
        };
        let queue = QueueHandle::new(self, index);
        if queue.entry.producer_pid() == 0 {
            return Ok(());
        }
        let _producer = queue.lock_producer()?;
        drop(registry);
        for index in 0..queue.nconsumers() {
            let slot = queue.lock_slot(index)?;
            if slot.node() == session.node {
                slot.set_status(SlotStatus::Done);
                slot.state().discard();
                debug!(queue = name, index, node = session.node, "consumer disconnected");
            }
        }
        queue.producer_latch().set()
    }

    /// Copy of the queue state for diagnostics.
    pub fn snapshot(&self, name: &str) -> Result<Option<QueueSnapshot>> {
        let _registry = self.lock_registry()?;
        match self.find_entry(name) {
            Some(index) => QueueHandle::new(self, index).snapshot().map(Some),
            None => Ok(None),
        }
    }

    /// Snapshots of every live queue.
    pub fn snapshot_all(&self) -> Result<Vec<QueueSnapshot>> {
        let _registry = self.lock_registry()?;
        let mut snapshots = Vec::new();
        for index in 0..self.max_queues() {
            if self.entry(index).in_use() {
                snapshots.push(QueueHandle::new(self, index).snapshot()?);
            }
        }
        Ok(snapshots)
    }

    /// Caller holds the registry lock.
    fn find_entry(&self, name: &str) -> Option<usize> {
        (0..self.max_queues()).find(|&index| self.entry(index).matches(name))
    }

    /// Caller holds the registry lock.
    fn create_entry(&self, name: &str, consumers: usize) -> Result<usize> {
        let ring_len = ring_length(self.queue_size(), consumers);
        if ring_len <= LEN_SIZE {
            return Err(SharedQueueError::SegmentTooSmall {
                queue_size: self.queue_size(),
                consumers,
            });
        }
        let index = (0..self.max_queues())
            .find(|&index| !self.entry(index).in_use())
            .ok_or_else(|| SharedQueueError::RegistryFull(self.max_queues()))?;
        let block = self
            .sync_blocks()
            .iter()
            .position(|sync| sync.queue().is_none())
            .ok_or_else(|| SharedQueueError::NoFreeSyncBlock(name.to_string()))?;
        self.sync_blocks()[block].assign(index, consumers)?;
        self.entry(index).format(name, consumers, ring_len, block);
        debug!(queue = name, index, sync_block = block, consumers, ring_len, "created shared queue");
        Ok(index)
    }

    /// Drop entry `index` and return its sync block to the pool. Caller holds
    /// the registry lock and saw the reference count reach zero.
    pub(crate) fn remove_entry(&self, index: usize, name: &str) {
        let entry = self.entry(index);
        let sync = self.sync_block(entry.sync_index());
        if !entry.matches(name) || sync.queue() != Some(index) {
            error!(queue = name, index, "shared queue data corruption");
            std::process::abort();
        }
        sync.release();
        entry.clear();
        debug!(queue = name, index, "removed shared queue");
    }
}
