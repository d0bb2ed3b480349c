use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use crate::segment::layout::queue_header_size;
use crate::{
    Binding, Consumer, Producer, QueueSnapshot, ReadOutcome, Result, SharedQueueConfig,
    SharedQueueConfigBuilder, SharedQueues,
};

mod lifecycle_tests;

/// A segment owned by the test thread; other threads attach through `cfg`.
pub(crate) struct TestSegment {
    pub owner: SharedQueues,
    pub cfg: SharedQueueConfig,
    _dir: TempDir,
}

impl TestSegment {
    pub fn attach(&self) -> Result<SharedQueues> {
        SharedQueues::attach(&self.cfg)
    }

    pub fn snapshot(&self, name: &str) -> QueueSnapshot {
        self.owner
            .snapshot(name)
            .unwrap()
            .unwrap_or_else(|| panic!("queue {} not found", name))
    }
}

/// Builder preset for tests: unique link file, short waits.
pub(crate) fn test_config() -> SharedQueueConfigBuilder {
    static SEGMENT_ID: AtomicUsize = AtomicUsize::new(0);
    SharedQueueConfig::builder()
        .segment_name(format!(
            "squeue_test_{}_{}",
            std::process::id(),
            SEGMENT_ID.fetch_add(1, Ordering::SeqCst)
        ))
        .max_queues(4)
        .queue_size(4096)
        .max_consumers(4)
        .connect_timeout(Duration::from_secs(2))
        .race_retry_delay(Duration::from_millis(20))
}

pub(crate) fn create_segment(builder: SharedQueueConfigBuilder) -> Result<TestSegment> {
    let dir = tempdir()?;
    let cfg = builder.data_dir(dir.path().to_string_lossy()).build()?;
    let owner = SharedQueues::create(&cfg)?;
    Ok(TestSegment {
        owner,
        cfg,
        _dir: dir,
    })
}

/// Queue size giving every one of `consumers` slots a ring of `ring` bytes.
pub(crate) fn queue_size_for(ring: usize, consumers: usize) -> usize {
    queue_header_size(consumers) + ring * consumers
}

pub(crate) fn producer(binding: Binding<'_>) -> Producer<'_> {
    match binding {
        Binding::Producer(producer) => producer,
        Binding::Consumer(consumer) => panic!("expected producer, bound consumer {}", consumer.index()),
    }
}

pub(crate) fn consumer(binding: Binding<'_>) -> Consumer<'_> {
    match binding {
        Binding::Consumer(consumer) => consumer,
        Binding::Producer(_) => panic!("expected consumer, bound producer"),
    }
}

/// Read everything available without waiting.
pub(crate) fn read_available(consumer: &mut Consumer<'_>) -> Result<(Vec<Vec<u8>>, bool)> {
    let mut records = Vec::new();
    loop {
        match consumer.read(false)? {
            ReadOutcome::Record(record) => records.push(record),
            ReadOutcome::Eof => return Ok((records, true)),
            ReadOutcome::WouldBlock => return Ok((records, false)),
        }
    }
}
