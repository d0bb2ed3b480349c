//! Shared-memory queues moving length-prefixed records from one producer
//! process to several consumer processes on the same host.

mod errors;
mod overflow;
pub mod reader;
pub mod registry;
pub mod ring;
pub mod segment;
pub mod writer;

#[cfg(test)]
mod tests;

pub use errors::{Result, SharedQueueError};
pub use reader::{Consumer, ReadOutcome};
pub use registry::{Binding, ConsumerMapping, QueueSnapshot, SlotSnapshot, MAX_NAME_LEN};
pub use ring::{SlotStats, SlotStatus, TupleCount, LONG_RECORD_MARKER, MAX_RECORD_LEN};
pub use segment::{NodeId, Session, SharedQueueConfig, SharedQueueConfigBuilder, SharedQueues, WaitResult};
pub use writer::Producer;
