use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::debug;

use crate::errors::{sync_error, Result, SharedQueueError};
use crate::registry::{Entry, QueueHeader};

pub mod config;
pub(crate) mod layout;
pub(crate) mod sync;

pub use config::{SharedQueueConfig, SharedQueueConfigBuilder};
pub use sync::WaitResult;

use layout::{Geometry, Layout, SegmentHeader, PRIMITIVE_STRIDE, SEGMENT_MAGIC};
use sync::{Liveness, SyncBlock};

pub type NodeId = i32;

/// Identity of the calling process: its pid and the node it works for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Session {
    pub pid: u32,
    pub node: NodeId,
}

impl Session {
    pub fn new(pid: u32, node: NodeId) -> Session {
        Session { pid, node }
    }

    pub fn current(node: NodeId) -> Session {
        Session::new(std::process::id(), node)
    }
}

fn create_segment(cfg: &SharedQueueConfig, size: usize) -> Result<Shmem> {
    match ShmemConf::new().size(size).flink(cfg.link_path()).create() {
        Ok(v) => Ok(v),
        Err(ShmemError::LinkExists) => open_segment(cfg),
        Err(e) => Err(e.into()),
    }
}

fn open_segment(cfg: &SharedQueueConfig) -> Result<Shmem> {
    Ok(ShmemConf::new().flink(cfg.link_path()).open()?)
}

/// This process's view of the shared queue segment: the mapping plus
/// process-local handles to every lock and latch in it.
///
/// Each process (or test thread standing in for one) attaches its own
/// instance; nothing in here is shared by reference across processes.
pub struct SharedQueues {
    // Handles must drop before the mapping they point into.
    syncs: Vec<SyncBlock>,
    registry_lock: Box<dyn LockImpl>,
    layout: Layout,
    config: SharedQueueConfig,
    liveness: Liveness,
    shmem: Shmem,
}

impl SharedQueues {
    /// Allocate and format the registry table and sync pool. Runs once, in the
    /// process that owns the segment for its whole lifetime.
    pub fn create(cfg: &SharedQueueConfig) -> Result<SharedQueues> {
        cfg.validate()?;
        let geometry = Geometry {
            max_queues: cfg.max_queues,
            max_consumers: cfg.max_consumers,
            queue_size: cfg.queue_size,
        };
        let layout = Layout::new(geometry, *PRIMITIVE_STRIDE);
        let shmem = create_segment(cfg, layout.total_size)?;
        if !shmem.is_owner() {
            debug!(link = %cfg.link_path().display(), "segment exists, attaching instead");
            drop(shmem);
            return SharedQueues::attach(cfg);
        }
        let base = shmem.as_ptr();
        let pid = std::process::id();

        // SAFETY: the mapping is fresh, `layout.total_size` bytes long, and
        // nobody else can see it until the magic is published below.
        let (registry_lock, syncs) = unsafe {
            (base as *mut SegmentHeader).write(SegmentHeader {
                magic: AtomicU64::new(0),
                creator_pid: AtomicU32::new(pid),
                max_queues: AtomicU32::new(geometry.max_queues as u32),
                max_consumers: AtomicU32::new(geometry.max_consumers as u32),
                primitive_stride: AtomicU32::new(layout.stride as u32),
                queue_size: AtomicU64::new(geometry.queue_size as u64),
            });
            let (registry_lock, _) =
                Mutex::new(base.add(layout.registry_lock), ptr::null_mut()).map_err(sync_error)?;
            let mut syncs = Vec::with_capacity(geometry.max_queues);
            for block in 0..geometry.max_queues {
                syncs.push(SyncBlock::init(base, &layout, block)?);
            }
            for index in 0..geometry.max_queues {
                QueueHeader::format_unused(base.add(layout.entry(index)));
            }
            (registry_lock, syncs)
        };
        let shared = SharedQueues {
            syncs,
            registry_lock,
            layout,
            config: cfg.clone(),
            liveness: Liveness::new(pid, Arc::new(AtomicBool::new(false))),
            shmem,
        };
        shared.header().magic.store(SEGMENT_MAGIC, Ordering::Release);
        debug!(
            os_id = shared.shmem.get_os_id(),
            size = layout.total_size,
            max_queues = geometry.max_queues,
            queue_size = geometry.queue_size,
            max_consumers = geometry.max_consumers,
            "shared queue segment created"
        );
        Ok(shared)
    }

    /// Map a segment created by another process. Geometry comes from the
    /// segment header, timings from `cfg`.
    pub fn attach(cfg: &SharedQueueConfig) -> Result<SharedQueues> {
        let shmem = open_segment(cfg)?;
        let base = shmem.as_ptr();
        let bad_segment = || SharedQueueError::BadSegment(cfg.link_path().display().to_string());
        if shmem.len() < std::mem::size_of::<SegmentHeader>() {
            return Err(bad_segment());
        }
        // SAFETY: the mapping is at least one header long.
        let header = unsafe { &*(base as *const SegmentHeader) };
        if header.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            return Err(bad_segment());
        }
        let geometry = Geometry {
            max_queues: header.max_queues.load(Ordering::Relaxed) as usize,
            max_consumers: header.max_consumers.load(Ordering::Relaxed) as usize,
            queue_size: header.queue_size.load(Ordering::Relaxed) as usize,
        };
        let stride = header.primitive_stride.load(Ordering::Relaxed) as usize;
        let host_pid = header.creator_pid.load(Ordering::Relaxed);
        let layout = Layout::new(geometry, stride);
        if shmem.len() < layout.total_size {
            return Err(bad_segment());
        }

        // SAFETY: the creator formatted every primitive before publishing the magic.
        let (registry_lock, syncs) = unsafe {
            let (registry_lock, _) =
                Mutex::from_existing(base.add(layout.registry_lock), ptr::null_mut())
                    .map_err(sync_error)?;
            let mut syncs = Vec::with_capacity(geometry.max_queues);
            for block in 0..geometry.max_queues {
                syncs.push(SyncBlock::open(base, &layout, block)?);
            }
            (registry_lock, syncs)
        };
        Ok(SharedQueues {
            syncs,
            registry_lock,
            layout,
            config: cfg.clone(),
            liveness: Liveness::new(host_pid, Arc::new(AtomicBool::new(false))),
            shmem,
        })
    }

    /// Abandon every wait of this process once `flag` is raised, e.g. by a
    /// termination signal handler.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> SharedQueues {
        let host_pid = self.header().creator_pid.load(Ordering::Relaxed);
        self.liveness = Liveness::new(host_pid, flag);
        self
    }

    pub fn config(&self) -> &SharedQueueConfig {
        &self.config
    }

    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    pub fn max_queues(&self) -> usize {
        self.layout.geometry.max_queues
    }

    pub fn max_consumers(&self) -> usize {
        self.layout.geometry.max_consumers
    }

    pub fn queue_size(&self) -> usize {
        self.layout.geometry.queue_size
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the header sits at the start of the mapping held by `self`.
        unsafe { &*(self.shmem.as_ptr() as *const SegmentHeader) }
    }

    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub(crate) fn lock_registry(&self) -> Result<LockGuard<'_>> {
        self.liveness.check()?;
        self.registry_lock.lock().map_err(sync_error)
    }

    /// Registry lock for cleanup that has to run even after an interrupt.
    pub(crate) fn lock_registry_unchecked(&self) -> Result<LockGuard<'_>> {
        self.registry_lock.lock().map_err(sync_error)
    }

    pub(crate) fn entry(&self, index: usize) -> Entry<'_> {
        assert!(index < self.layout.geometry.max_queues);
        // SAFETY: entry offsets stay inside the mapping held by `self`.
        unsafe { Entry::new(self.shmem.as_ptr().add(self.layout.entry(index))) }
    }

    pub(crate) fn sync_block(&self, block: usize) -> &SyncBlock {
        &self.syncs[block]
    }

    pub(crate) fn sync_blocks(&self) -> &[SyncBlock] {
        &self.syncs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_reads_geometry_from_creator() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let created = SharedQueueConfig::builder()
            .data_dir(dir.path().to_string_lossy())
            .segment_name("geometry")
            .max_queues(3)
            .queue_size(2048)
            .max_consumers(2)
            .build()?;
        let owner = SharedQueues::create(&created)?;

        let mut other = created.clone();
        other.max_queues = 99;
        other.queue_size = 1;
        let attached = SharedQueues::attach(&other)?;
        assert_eq!(attached.max_queues(), 3);
        assert_eq!(attached.queue_size(), 2048);
        assert_eq!(attached.max_consumers(), 2);
        assert_eq!(attached.os_id(), owner.os_id());
        Ok(())
    }

    #[test]
    fn attach_without_segment_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = SharedQueueConfig::builder()
            .data_dir(dir.path().to_string_lossy())
            .segment_name("missing")
            .build()?;
        assert!(SharedQueues::attach(&cfg).is_err());
        Ok(())
    }
}
