use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockImpl, LockInit, Mutex, RwLock};
use raw_sync::Timeout;

use super::layout::{Layout, SyncHeader};
use crate::errors::{sync_error, Result, SharedQueueError};

/// Longest a waiter sleeps before re-checking liveness.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    Set,
    TimedOut,
}

/// Conditions that abandon any wait: the segment owner exiting, or this
/// process being asked to shut down.
#[derive(Clone, Debug)]
pub(crate) struct Liveness {
    host_pid: u32,
    interrupt: Arc<AtomicBool>,
}

impl Liveness {
    pub fn new(host_pid: u32, interrupt: Arc<AtomicBool>) -> Liveness {
        Liveness {
            host_pid,
            interrupt,
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(SharedQueueError::Interrupted);
        }
        if !process_alive(self.host_pid) {
            return Err(SharedQueueError::HostDied(self.host_pid));
        }
        Ok(())
    }
}

pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Binary wakeup signal living in shared memory, plus the pid that owns it.
pub(crate) struct Latch {
    event: Box<dyn EventImpl>,
    owner: NonNull<AtomicU32>,
}

impl Latch {
    /// # Safety
    ///
    /// `mem` must point at a primitive cell of the segment and `owner` at its
    /// owner word; the mapping must outlive the latch.
    unsafe fn init(mem: *mut u8, owner: *mut u8, stride: usize) -> Result<Latch> {
        let (event, used) = Event::new(mem, false).map_err(sync_error)?;
        check_fits(used, stride)?;
        Ok(Latch {
            event,
            owner: owner_ptr(owner)?,
        })
    }

    /// # Safety
    ///
    /// Same contract as [`Latch::init`], on a cell already initialized.
    unsafe fn open(mem: *mut u8, owner: *mut u8) -> Result<Latch> {
        let (event, _) = Event::from_existing(mem).map_err(sync_error)?;
        Ok(Latch {
            event,
            owner: owner_ptr(owner)?,
        })
    }

    fn owner_word(&self) -> &AtomicU32 {
        // SAFETY: points into the mapping, which outlives every latch.
        unsafe { self.owner.as_ref() }
    }

    pub fn set(&self) -> Result<()> {
        self.event.set(EventState::Signaled).map_err(sync_error)
    }

    pub fn reset(&self) -> Result<()> {
        self.event.set(EventState::Clear).map_err(sync_error)
    }

    pub fn own(&self, pid: u32) {
        self.owner_word().store(pid, Ordering::Release);
    }

    pub fn disown(&self) {
        self.owner_word().store(0, Ordering::Release);
    }

    pub fn owner(&self) -> u32 {
        self.owner_word().load(Ordering::Acquire)
    }

    /// Sleep until the latch is set, `timeout` elapses, or liveness fails.
    ///
    /// The latch is not reset on return.
    pub fn wait(&self, timeout: Option<Duration>, liveness: &Liveness) -> Result<WaitResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            liveness.check()?;
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitResult::TimedOut);
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            // raw_sync reports an expired timed wait as an error.
            if self.event.wait(Timeout::Val(slice)).is_ok() {
                return Ok(WaitResult::Set);
            }
        }
    }
}

pub(crate) struct ConsumerSync {
    pub lock: Box<dyn LockImpl>,
    pub latch: Latch,
}

/// Per-queue producer lock and latch plus a lock and latch per consumer slot.
pub(crate) struct SyncBlock {
    header: NonNull<SyncHeader>,
    pub producer_lock: Box<dyn LockImpl>,
    pub producer_latch: Latch,
    pub consumers: Vec<ConsumerSync>,
}

impl SyncBlock {
    /// # Safety
    ///
    /// `base` is the start of a mapping laid out by `layout`. Must run exactly
    /// once per block, before any other process attaches.
    pub unsafe fn init(base: *mut u8, layout: &Layout, block: usize) -> Result<SyncBlock> {
        let stride = layout.stride;
        let header = base.add(layout.sync_block(block)) as *mut SyncHeader;
        header.write(SyncHeader {
            queue: AtomicI32::new(-1),
            producer_latch_owner: AtomicU32::new(0),
        });
        let (producer_lock, used) =
            RwLock::new(base.add(layout.producer_lock(block)), ptr::null_mut()).map_err(sync_error)?;
        check_fits(used, stride)?;
        let producer_latch = Latch::init(
            base.add(layout.producer_latch(block)),
            ptr::addr_of_mut!((*header).producer_latch_owner) as *mut u8,
            stride,
        )?;
        let mut consumers = Vec::with_capacity(layout.geometry.max_consumers);
        for i in 0..layout.geometry.max_consumers {
            let owner = base.add(layout.consumer_latch_owner(block, i));
            (owner as *mut AtomicU32).write(AtomicU32::new(0));
            let (lock, used) = Mutex::new(base.add(layout.consumer_lock(block, i)), ptr::null_mut())
                .map_err(sync_error)?;
            check_fits(used, stride)?;
            let latch = Latch::init(base.add(layout.consumer_latch(block, i)), owner, stride)?;
            consumers.push(ConsumerSync { lock, latch });
        }
        Ok(SyncBlock {
            header: NonNull::new_unchecked(header),
            producer_lock,
            producer_latch,
            consumers,
        })
    }

    /// # Safety
    ///
    /// `base` is the start of a mapping whose blocks were set up by [`SyncBlock::init`].
    pub unsafe fn open(base: *mut u8, layout: &Layout, block: usize) -> Result<SyncBlock> {
        let header = base.add(layout.sync_block(block)) as *mut SyncHeader;
        let (producer_lock, _) =
            RwLock::from_existing(base.add(layout.producer_lock(block)), ptr::null_mut())
                .map_err(sync_error)?;
        let producer_latch = Latch::open(
            base.add(layout.producer_latch(block)),
            ptr::addr_of_mut!((*header).producer_latch_owner) as *mut u8,
        )?;
        let mut consumers = Vec::with_capacity(layout.geometry.max_consumers);
        for i in 0..layout.geometry.max_consumers {
            let (lock, _) =
                Mutex::from_existing(base.add(layout.consumer_lock(block, i)), ptr::null_mut())
                    .map_err(sync_error)?;
            let latch = Latch::open(
                base.add(layout.consumer_latch(block, i)),
                base.add(layout.consumer_latch_owner(block, i)),
            )?;
            consumers.push(ConsumerSync { lock, latch });
        }
        Ok(SyncBlock {
            header: NonNull::new_unchecked(header),
            producer_lock,
            producer_latch,
            consumers,
        })
    }

    fn header(&self) -> &SyncHeader {
        // SAFETY: points into the mapping, which outlives every block handle.
        unsafe { self.header.as_ref() }
    }

    pub fn queue(&self) -> Option<usize> {
        let queue = self.header().queue.load(Ordering::Acquire);
        if queue < 0 {
            None
        } else {
            Some(queue as usize)
        }
    }

    /// Attach the block to registry entry `queue`, clearing stale signals.
    /// Caller holds the registry lock.
    pub fn assign(&self, queue: usize, consumers: usize) -> Result<()> {
        self.header().queue.store(queue as i32, Ordering::Release);
        self.producer_latch.disown();
        self.producer_latch.reset()?;
        for sync in self.consumers.iter().take(consumers) {
            sync.latch.disown();
            sync.latch.reset()?;
        }
        Ok(())
    }

    /// Return the block to the pool. Caller holds the registry lock.
    pub fn release(&self) {
        self.header().queue.store(-1, Ordering::Release);
    }
}

fn check_fits(used: usize, stride: usize) -> Result<()> {
    if used > stride {
        return Err(SharedQueueError::Sync(format!(
            "primitive needs {} bytes but its cell holds {}",
            used, stride
        )));
    }
    Ok(())
}

fn owner_ptr(owner: *mut u8) -> Result<NonNull<AtomicU32>> {
    NonNull::new(owner as *mut AtomicU32)
        .ok_or_else(|| SharedQueueError::Sync("null latch owner".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }

    #[test]
    fn interrupt_flag_stops_liveness() {
        let flag = Arc::new(AtomicBool::new(false));
        let liveness = Liveness::new(std::process::id(), flag.clone());
        assert!(liveness.check().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(liveness.check(), Err(SharedQueueError::Interrupted)));
    }
}
