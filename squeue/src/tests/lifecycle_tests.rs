use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::{ConsumerMapping, Session, SharedQueueError, SlotStatus, TupleCount, MAX_NAME_LEN};

#[test]
fn concurrent_acquire_shares_one_entry() -> Result<()> {
    let seg = create_segment(test_config())?;
    let workers: Vec<_> = (0..8)
        .map(|node| {
            let cfg = seg.cfg.clone();
            thread::spawn(move || {
                let shared = SharedQueues::attach(&cfg).unwrap();
                shared.acquire(Session::new(200 + node as u32, node), "crowd", 2).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let all = seg.owner.snapshot_all()?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "crowd");
    assert_eq!(all[0].refcount, 8);
    assert_eq!(all[0].producer_pid, 0);
    assert_eq!(all[0].consumers.len(), 2);
    Ok(())
}

#[test]
fn acquire_rejects_bad_arguments() -> Result<()> {
    let seg = create_segment(test_config())?;
    let session = Session::new(100, 0);
    let long_name = "n".repeat(MAX_NAME_LEN + 1);
    assert!(matches!(
        seg.owner.acquire(session, &long_name, 1),
        Err(SharedQueueError::NameTooLong { max: MAX_NAME_LEN, .. })
    ));
    seg.owner.acquire(session, &"n".repeat(MAX_NAME_LEN), 1)?;
    assert!(matches!(
        seg.owner.acquire(session, "q", 0),
        Err(SharedQueueError::InvalidConsumerCount { count: 0, max: 4 })
    ));
    assert!(matches!(
        seg.owner.acquire(session, "q", 5),
        Err(SharedQueueError::InvalidConsumerCount { count: 5, max: 4 })
    ));
    assert!(seg.owner.snapshot("q")?.is_none());
    Ok(())
}

#[test]
fn tiny_queue_size_is_rejected() -> Result<()> {
    let seg = create_segment(test_config().queue_size(16))?;
    assert!(matches!(
        seg.owner.acquire(Session::new(100, 0), "tiny", 1),
        Err(SharedQueueError::SegmentTooSmall { queue_size: 16, consumers: 1 })
    ));
    assert!(seg.owner.snapshot_all()?.is_empty());
    Ok(())
}

#[test]
fn registry_fills_up() -> Result<()> {
    let seg = create_segment(test_config())?;
    let session = Session::new(100, 0);
    for i in 0..4 {
        seg.owner.acquire(session, &format!("q{}", i), 1)?;
    }
    assert!(matches!(
        seg.owner.acquire(session, "q4", 1),
        Err(SharedQueueError::RegistryFull(4))
    ));
    // Joining an existing queue still works.
    seg.owner.acquire(Session::new(101, 1), "q2", 1)?;
    assert_eq!(seg.snapshot("q2").refcount, 2);
    Ok(())
}

#[test]
fn released_entry_is_removed_and_reused() -> Result<()> {
    let seg = create_segment(test_config())?;
    let (p, c) = (Session::new(100, 0), Session::new(101, 1));
    seg.owner.acquire(p, "again", 2)?;
    seg.owner.acquire(c, "again", 2)?;
    seg.owner.release(c, "again")?;
    assert_eq!(seg.snapshot("again").refcount, 1);
    seg.owner.release(p, "again")?;
    assert!(seg.owner.snapshot("again")?.is_none());
    seg.owner.release(p, "again")?;

    seg.owner.acquire(p, "again", 3)?;
    let snapshot = seg.snapshot("again");
    assert_eq!(snapshot.refcount, 1);
    assert_eq!(snapshot.consumers.len(), 3);
    assert!(snapshot.consumers.iter().all(|slot| slot.node == -1 && slot.pid == 0));
    Ok(())
}

#[test]
fn bind_reports_misuse() -> Result<()> {
    let seg = create_segment(test_config())?;
    let shared = &seg.owner;
    let p = Session::new(100, 0);
    let sessions = [Session::new(101, 1), Session::new(102, 2), Session::new(109, 9)];
    assert!(matches!(
        shared.bind(p, "nowhere", &[1], &[0, 1]),
        Err(SharedQueueError::NotFound(_))
    ));

    shared.acquire(p, "misuse", 2)?;
    for session in sessions.iter() {
        shared.acquire(*session, "misuse", 2)?;
    }
    let mut producer = producer(shared.bind(p, "misuse", &[1, 2], &[0, 1, 2])?);

    assert!(matches!(
        shared.bind(sessions[2], "misuse", &[1, 2], &[0, 1, 2]),
        Err(SharedQueueError::NotAConsumer { node: 9, .. })
    ));

    let _first = consumer(shared.bind(sessions[0], "misuse", &[1, 2], &[0, 1, 2])?);
    assert!(matches!(
        shared.bind(sessions[0], "misuse", &[1, 2], &[0, 1, 2]),
        Err(SharedQueueError::AlreadyBound { index: 0, pid: 101, .. })
    ));

    producer.reset()?;
    assert!(matches!(
        shared.bind(sessions[1], "misuse", &[1, 2], &[0, 1, 2]),
        Err(SharedQueueError::ProducerFailed { index: 1, status: SlotStatus::Error, .. })
    ));
    assert_eq!(seg.snapshot("misuse").consumers[1].status, SlotStatus::Done);
    Ok(())
}

#[test]
fn unassigned_node_has_no_slot() -> Result<()> {
    let seg = create_segment(test_config())?;
    let shared = &seg.owner;
    let p = Session::new(100, 0);
    shared.acquire(p, "narrow", 1)?;
    let producer = producer(shared.bind(p, "narrow", &[1, 2], &[0, 1, 2])?);
    assert_eq!(
        producer.consumer_map(),
        &[ConsumerMapping::Myself, ConsumerMapping::Slot(0), ConsumerMapping::Absent]
    );
    Ok(())
}

#[test]
fn release_before_producer_binds_only_drops_reference() -> Result<()> {
    let seg = create_segment(test_config())?;
    let (p, c) = (Session::new(100, 0), Session::new(101, 1));
    seg.owner.acquire(p, "early", 2)?;
    seg.owner.acquire(c, "early", 2)?;
    let before = seg.snapshot("early");
    seg.owner.release(c, "early")?;
    let after = seg.snapshot("early");
    assert_eq!(after.refcount, before.refcount - 1);
    assert_eq!(after.consumers, before.consumers);
    Ok(())
}

#[test]
fn release_by_unknown_node_closes_unused_slots() -> Result<()> {
    let seg = create_segment(test_config())?;
    let shared = &seg.owner;
    let (p, late) = (Session::new(100, 0), Session::new(103, 3));
    shared.acquire(p, "spare", 3)?;
    shared.acquire(late, "spare", 3)?;
    let _producer = producer(shared.bind(p, "spare", &[1], &[0, 1])?);

    shared.release(late, "spare")?;
    let snapshot = seg.snapshot("spare");
    assert_eq!(snapshot.refcount, 2);
    assert_eq!((snapshot.consumers[0].node, snapshot.consumers[0].status), (1, SlotStatus::Active));
    assert_eq!((snapshot.consumers[1].node, snapshot.consumers[1].status), (3, SlotStatus::Done));
    assert_eq!((snapshot.consumers[2].node, snapshot.consumers[2].status), (-1, SlotStatus::Done));
    Ok(())
}

#[test]
fn release_by_bound_consumer_marks_slot_done() -> Result<()> {
    let seg = create_segment(test_config())?;
    let shared = &seg.owner;
    let (p, c1, c2) = (Session::new(100, 0), Session::new(101, 1), Session::new(102, 2));
    for session in [p, c1, c2] {
        shared.acquire(session, "leave", 2)?;
    }
    let _producer = producer(shared.bind(p, "leave", &[1, 2], &[0, 1, 2])?);
    let first = consumer(shared.bind(c1, "leave", &[1, 2], &[0, 1, 2])?);

    // Node 2 never bound: its slot is left for a newer execution.
    shared.release(c2, "leave")?;
    let slot = &seg.snapshot("leave").consumers[1];
    assert_eq!((slot.status, slot.pid), (SlotStatus::Active, 0));

    shared.release(c1, "leave")?;
    let slot = &seg.snapshot("leave").consumers[0];
    assert_eq!((slot.status, slot.pid), (SlotStatus::Done, 0));
    drop(first);
    assert_eq!(seg.snapshot("leave").refcount, 2);
    Ok(())
}

#[test]
fn disconnect_discards_queued_records() -> Result<()> {
    let seg = create_segment(test_config())?;
    let shared = &seg.owner;
    let (p, c) = (Session::new(100, 0), Session::new(101, 1));
    shared.acquire(p, "remote", 2)?;
    let mut producer = producer(shared.bind(p, "remote", &[1, 2], &[0, 1, 2])?);
    producer.write(0, b"one")?;
    producer.write(0, b"two")?;
    producer.write(1, b"kept")?;
    assert_eq!(seg.snapshot("remote").consumers[0].tuple_count, TupleCount::Rows(2));

    shared.disconnect_consumer(c, "remote")?;
    let snapshot = seg.snapshot("remote");
    assert_eq!(snapshot.consumers[0].status, SlotStatus::Done);
    assert_eq!(snapshot.consumers[0].tuple_count, TupleCount::Empty);
    assert_eq!(snapshot.consumers[1].tuple_count, TupleCount::Rows(1));

    producer.write(0, b"three")?;
    assert_eq!(seg.snapshot("remote").consumers[0].tuple_count, TupleCount::Empty);
    Ok(())
}

#[test]
fn unbind_gives_up_on_consumer_that_never_connects() -> Result<()> {
    let seg = create_segment(test_config().connect_timeout(Duration::from_millis(200)))?;
    let shared = &seg.owner;
    let p = Session::new(100, 0);
    let sessions = [Session::new(101, 1), Session::new(102, 2), Session::new(103, 3)];
    shared.acquire(p, "ghost", 3)?;
    for session in sessions.iter() {
        shared.acquire(*session, "ghost", 3)?;
    }
    let mut producer = producer(shared.bind(p, "ghost", &[1, 2, 3], &[0, 1, 2, 3])?);
    // Node 3 never binds.
    let mut readers = vec![
        consumer(shared.bind(sessions[0], "ghost", &[1, 2, 3], &[0, 1, 2, 3])?),
        consumer(shared.bind(sessions[1], "ghost", &[1, 2, 3], &[0, 1, 2, 3])?),
    ];
    producer.write(0, b"hello")?;
    producer.write(1, b"world")?;
    assert_eq!(producer.finish()?, 0);
    for (reader, expected) in readers.iter_mut().zip([b"hello", b"world"]) {
        let (records, eof) = read_available(reader)?;
        assert_eq!(records, vec![expected.to_vec()]);
        assert!(eof);
    }

    let started = Instant::now();
    producer.unbind(false)?;
    assert!(started.elapsed() >= Duration::from_millis(200));
    let snapshot = seg.snapshot("ghost");
    assert_eq!(snapshot.refcount, 4);
    assert_eq!(
        snapshot.consumers.iter().map(|slot| slot.status).collect::<Vec<_>>(),
        vec![SlotStatus::Done; 3]
    );
    assert_eq!(snapshot.consumers[2].pid, 0);
    Ok(())
}

#[test]
fn interrupted_unbind_still_drops_producer_reference() -> Result<()> {
    let seg = create_segment(test_config())?;
    let (p, c) = (Session::new(100, 0), Session::new(101, 1));
    seg.owner.acquire(p, "cut", 1)?;
    seg.owner.acquire(c, "cut", 1)?;

    let flag = Arc::new(AtomicBool::new(false));
    let shared = seg.attach()?.with_interrupt_flag(flag.clone());
    let mut producer = producer(shared.bind(p, "cut", &[1], &[0, 1])?);
    // Bound but never reads, so unbind waits on it.
    let _reader = consumer(seg.owner.bind(c, "cut", &[1], &[0, 1])?);
    assert_eq!(producer.finish()?, 0);
    assert_eq!(seg.snapshot("cut").refcount, 3);

    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    });
    assert!(matches!(producer.unbind(false), Err(SharedQueueError::Interrupted)));
    raiser.join().unwrap();

    let snapshot = seg.snapshot("cut");
    assert_eq!(snapshot.refcount, 2);
    assert_eq!(snapshot.consumers[0].status, SlotStatus::Eof);
    Ok(())
}

#[test]
fn stale_entry_exhausts_retries() -> Result<()> {
    let seg = create_segment(test_config().race_retry_limit(3))?;
    let shared = &seg.owner;
    let (p, c) = (Session::new(100, 0), Session::new(101, 1));
    shared.acquire(p, "stale", 1)?;
    shared.acquire(c, "stale", 1)?;
    let _producer = producer(shared.bind(p, "stale", &[1], &[0, 1])?);
    drop(consumer(shared.bind(c, "stale", &[1], &[0, 1])?));

    // Node 1 is done with this execution, node 5 never had a slot in it.
    for session in [Session::new(201, 1), Session::new(205, 5)] {
        let started = Instant::now();
        match shared.acquire(session, "stale", 1) {
            Err(SharedQueueError::RaceUnresolved { tries, .. }) => assert_eq!(tries, 3),
            other => panic!("unexpected acquire result {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
    assert_eq!(seg.snapshot("stale").refcount, 3);
    Ok(())
}

#[test]
fn stale_entry_clears_once_old_producer_leaves() -> Result<()> {
    let seg = create_segment(test_config().race_retry_limit(100))?;
    let (bound_tx, bound_rx) = mpsc::channel();
    let cfg = seg.cfg.clone();
    let old = thread::spawn(move || {
        let shared = SharedQueues::attach(&cfg).unwrap();
        let p = Session::new(100, 0);
        shared.acquire(p, "rerun", 1).unwrap();
        let producer = producer(shared.bind(p, "rerun", &[1], &[0, 1]).unwrap());
        bound_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(200));
        producer.unbind(true).unwrap();
        shared.release(p, "rerun").unwrap();
    });
    bound_rx.recv().unwrap();

    let shared = seg.attach()?;
    let started = Instant::now();
    shared.acquire(Session::new(300, 7), "rerun", 1)?;
    assert!(started.elapsed() >= Duration::from_millis(100));
    old.join().unwrap();

    let snapshot = seg.snapshot("rerun");
    assert_eq!(snapshot.refcount, 1);
    assert_eq!(snapshot.producer_pid, 0);
    Ok(())
}

#[test]
fn raised_interrupt_flag_ends_wait() -> Result<()> {
    let seg = create_segment(test_config())?;
    let (p, c) = (Session::new(100, 0), Session::new(101, 1));
    seg.owner.acquire(p, "stop", 1)?;
    seg.owner.acquire(c, "stop", 1)?;
    let _producer = producer(seg.owner.bind(p, "stop", &[1], &[0, 1])?);

    let flag = Arc::new(AtomicBool::new(false));
    let shared = seg.attach()?.with_interrupt_flag(flag.clone());
    let mut reader = consumer(shared.bind(c, "stop", &[1], &[0, 1])?);
    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    });
    assert!(matches!(reader.read(true), Err(SharedQueueError::Interrupted)));
    raiser.join().unwrap();
    Ok(())
}
