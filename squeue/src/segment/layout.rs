use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};

use once_cell::sync::Lazy;
use raw_sync::events::{Event, EventInit};
use raw_sync::locks::{LockInit, Mutex, RwLock};

use crate::registry::QueueHeader;
use crate::ring::ConsumerState;

pub(crate) const SEGMENT_MAGIC: u64 = 0x5351_5545_5545_0001;
pub(crate) const CACHE_LINE: usize = 64;

/// Every lock and latch in the segment gets the same fixed-size cell.
///
/// `Event::new` reports its inner mutex on top of `Event::size_of`, and any
/// primitive may pad its start up to pointer alignment.
pub(crate) static PRIMITIVE_STRIDE: Lazy<usize> = Lazy::new(|| {
    let widest = [
        Mutex::size_of(None),
        RwLock::size_of(None),
        Event::size_of(None) + Mutex::size_of(None),
    ]
    .iter()
    .copied()
    .max()
    .unwrap_or(CACHE_LINE);
    align_up(widest + mem::align_of::<usize>(), CACHE_LINE)
});

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

#[repr(C)]
pub(crate) struct SegmentHeader {
    pub magic: AtomicU64,
    pub creator_pid: AtomicU32,
    pub max_queues: AtomicU32,
    pub max_consumers: AtomicU32,
    pub primitive_stride: AtomicU32,
    pub queue_size: AtomicU64,
}

#[repr(C)]
pub(crate) struct SyncHeader {
    /// Registry entry the block serves, -1 while it sits in the pool.
    pub queue: AtomicI32,
    pub producer_latch_owner: AtomicU32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub max_queues: usize,
    pub max_consumers: usize,
    pub queue_size: usize,
}

/// Byte offsets of everything in the segment, relative to its base.
///
/// ```text
/// | SegmentHeader | registry lock | sync block * max_queues | entry * max_queues |
/// sync block: | SyncHeader + latch owners | producer lock | producer latch | (lock, latch) * max_consumers |
/// entry:      | QueueHeader | ConsumerState * n | ring * n |
/// ```
#[derive(Clone, Copy, Debug)]
pub(crate) struct Layout {
    pub geometry: Geometry,
    pub stride: usize,
    pub registry_lock: usize,
    sync_pool: usize,
    sync_header_size: usize,
    sync_block_size: usize,
    entries: usize,
    entry_size: usize,
    pub total_size: usize,
}

impl Layout {
    pub fn new(geometry: Geometry, stride: usize) -> Layout {
        let registry_lock = align_up(mem::size_of::<SegmentHeader>(), CACHE_LINE);
        let sync_pool = registry_lock + stride;
        let sync_header_size = align_up(
            mem::size_of::<SyncHeader>() + geometry.max_consumers * mem::size_of::<AtomicU32>(),
            CACHE_LINE,
        );
        let sync_block_size = sync_header_size + (2 + 2 * geometry.max_consumers) * stride;
        let entries = sync_pool + geometry.max_queues * sync_block_size;
        // Unused entries still carry a header.
        let entry_size = align_up(
            geometry.queue_size.max(mem::size_of::<QueueHeader>()),
            CACHE_LINE,
        );
        Layout {
            geometry,
            stride,
            registry_lock,
            sync_pool,
            sync_header_size,
            sync_block_size,
            entries,
            entry_size,
            total_size: entries + geometry.max_queues * entry_size,
        }
    }

    pub fn sync_block(&self, block: usize) -> usize {
        self.sync_pool + block * self.sync_block_size
    }

    pub fn consumer_latch_owner(&self, block: usize, consumer: usize) -> usize {
        self.sync_block(block)
            + mem::size_of::<SyncHeader>()
            + consumer * mem::size_of::<AtomicU32>()
    }

    pub fn producer_lock(&self, block: usize) -> usize {
        self.sync_block(block) + self.sync_header_size
    }

    pub fn producer_latch(&self, block: usize) -> usize {
        self.producer_lock(block) + self.stride
    }

    pub fn consumer_lock(&self, block: usize, consumer: usize) -> usize {
        self.producer_latch(block) + self.stride + 2 * consumer * self.stride
    }

    pub fn consumer_latch(&self, block: usize, consumer: usize) -> usize {
        self.consumer_lock(block, consumer) + self.stride
    }

    pub fn entry(&self, index: usize) -> usize {
        self.entries + index * self.entry_size
    }
}

/// Size of an entry header formatted for `consumers` slots.
pub(crate) fn queue_header_size(consumers: usize) -> usize {
    mem::size_of::<QueueHeader>() + consumers * mem::size_of::<ConsumerState>()
}

/// Ring length each consumer gets when `queue_size` bytes are split `consumers` ways.
pub(crate) fn ring_length(queue_size: usize, consumers: usize) -> usize {
    queue_size.saturating_sub(queue_header_size(consumers)) / consumers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            max_queues: 3,
            max_consumers: 4,
            queue_size: 4000,
        }
    }

    #[test]
    fn regions_do_not_overlap() {
        let layout = Layout::new(geometry(), 128);
        assert!(layout.registry_lock >= mem::size_of::<SegmentHeader>());
        assert!(layout.sync_block(0) >= layout.registry_lock + layout.stride);
        for block in 0..3 {
            let last_latch = layout.consumer_latch(block, 3);
            assert!(layout.consumer_latch_owner(block, 3) + 4 <= layout.producer_lock(block));
            if block < 2 {
                assert!(last_latch + layout.stride <= layout.sync_block(block + 1));
            } else {
                assert!(last_latch + layout.stride <= layout.entry(0));
            }
        }
        assert_eq!(layout.entry(2) + align_up(4000, CACHE_LINE), layout.total_size);
    }

    #[test]
    fn primitives_are_cache_line_aligned() {
        let layout = Layout::new(geometry(), *PRIMITIVE_STRIDE);
        assert_eq!(layout.stride % CACHE_LINE, 0);
        assert_eq!(layout.producer_lock(1) % CACHE_LINE, 0);
        assert_eq!(layout.consumer_latch(2, 3) % CACHE_LINE, 0);
        assert_eq!(layout.entry(1) % CACHE_LINE, 0);
    }

    #[test]
    fn primitives_fit_their_cell_at_any_offset() {
        let stride = *PRIMITIVE_STRIDE;
        let mut cell = vec![0u64; (stride + 64) / mem::size_of::<u64>()];
        for offset in [0usize, 1, 3, 8, 13] {
            // SAFETY: every primitive starts inside `cell` and is dropped
            // before it.
            unsafe {
                let at = (cell.as_mut_ptr() as *mut u8).add(offset);
                let (event, used) = Event::new(at, false).unwrap();
                assert!(used <= stride, "event needs {} of {} at {}", used, stride, offset);
                drop(event);
                let (mutex, used) = Mutex::new(at, std::ptr::null_mut()).unwrap();
                assert!(used <= stride, "mutex needs {} of {} at {}", used, stride, offset);
                drop(mutex);
                let (rwlock, used) = RwLock::new(at, std::ptr::null_mut()).unwrap();
                assert!(used <= stride, "rwlock needs {} of {} at {}", used, stride, offset);
                drop(rwlock);
            }
        }
    }

    #[test]
    fn ring_length_splits_what_the_header_leaves() {
        let consumers = 3;
        let len = ring_length(4096, consumers);
        assert_eq!(len, (4096 - queue_header_size(consumers)) / consumers);
        assert!(queue_header_size(consumers) + len * consumers <= 4096);
        assert_eq!(ring_length(16, 2), 0);
    }
}
