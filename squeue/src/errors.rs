use std::io;

use thiserror::Error;

use crate::ring::SlotStatus;

#[derive(Debug, Error)]
pub enum SharedQueueError {
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    // raw_sync hands back Box<dyn Error> which is neither Send nor Sync.
    #[error("synchronization error: {0}")]
    Sync(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] confy::ConfyError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} is not a shared queue segment")]
    BadSegment(String),

    #[error("out of shared queues, please increase max_queues (currently {0})")]
    RegistryFull(usize),

    #[error("no free synchronization block for shared queue {0}")]
    NoFreeSyncBlock(String),

    #[error("shared queue name {name:?} is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },

    #[error("invalid consumer count {count}, must be between 1 and {max}")]
    InvalidConsumerCount { count: usize, max: usize },

    #[error("queue size {queue_size} leaves no room for {consumers} consumer buffers")]
    SegmentTooSmall { queue_size: usize, consumers: usize },

    #[error("shared queue {0} not found")]
    NotFound(String),

    #[error("couldn't resolve shared queue {name} race condition after {tries} tries")]
    RaceUnresolved { name: String, tries: u32 },

    #[error("producer of shared queue {name} failed, consumer {index} status was {status}")]
    ProducerFailed {
        name: String,
        index: usize,
        status: SlotStatus,
    },

    #[error("consumer {index} of shared queue {name} is already bound to pid {pid}")]
    AlreadyBound { name: String, index: usize, pid: u32 },

    #[error("node {node} has no consumer slot in shared queue {name}")]
    NotAConsumer { name: String, node: i32 },

    #[error("consumer {index} of shared queue {name} is already done")]
    SlotClosed { name: String, index: usize },

    #[error("record of {len} bytes exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },

    #[error("consumer {index} out of range, shared queue {name} has {consumers}")]
    InvalidConsumerIndex {
        name: String,
        index: usize,
        consumers: usize,
    },

    #[error("long record out of sequence: expected {expected} bytes, got {actual}")]
    LongRecordMismatch { expected: usize, actual: usize },

    #[error("wait interrupted by shutdown request")]
    Interrupted,

    #[error("segment owner process {0} has exited")]
    HostDied(u32),
}

pub type Result<T> = std::result::Result<T, SharedQueueError>;

pub(crate) fn sync_error(err: Box<dyn std::error::Error>) -> SharedQueueError {
    SharedQueueError::Sync(err.to_string())
}
