use std::error::Error;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use squeue::{
    Binding, ConsumerMapping, NodeId, QueueSnapshot, ReadOutcome, Session, SharedQueueConfig,
    SharedQueues,
};

#[derive(Parser)]
#[clap(name = "squeue", version)]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "squeue.toml")]
    config: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the segment and hold it until SIGINT or SIGTERM.
    Serve,
    /// Send stdin lines to the consumers of a queue, round robin.
    Produce {
        queue: String,
        #[clap(long, default_value_t = 0)]
        node: NodeId,
        /// Consumer node; repeat for every consumer.
        #[clap(long = "consumer", required = true)]
        consumers: Vec<NodeId>,
        #[clap(long = "drain-timeout-ms", default_value_t = 1000)]
        drain_timeout_ms: u64,
    },
    /// Print the records a queue holds for this node, one per line.
    Consume {
        queue: String,
        #[clap(long)]
        node: NodeId,
        /// Consumer count the queue is created with if this node comes first.
        #[clap(long = "consumers", default_value_t = 1)]
        consumers: usize,
    },
    /// Show the live queues.
    Inspect { queue: Option<String> },
    /// Print the effective configuration.
    Config,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg = SharedQueueConfig::load(&opts.config)?;
    let closing = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&closing))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&closing))?;

    match opts.command {
        Command::Serve => serve(&cfg, &closing),
        Command::Produce {
            queue,
            node,
            consumers,
            drain_timeout_ms,
        } => {
            let shared = SharedQueues::attach(&cfg)?.with_interrupt_flag(closing);
            produce(
                &shared,
                &queue,
                Session::current(node),
                &consumers,
                Duration::from_millis(drain_timeout_ms),
            )
        }
        Command::Consume {
            queue,
            node,
            consumers,
        } => {
            let shared = SharedQueues::attach(&cfg)?.with_interrupt_flag(closing);
            consume(&shared, &queue, Session::current(node), consumers)
        }
        Command::Inspect { queue } => {
            let shared = SharedQueues::attach(&cfg)?;
            let snapshots = match queue {
                Some(name) => shared
                    .snapshot(&name)?
                    .ok_or_else(|| format!("shared queue {} not found", name))
                    .map(|snapshot| vec![snapshot])?,
                None => shared.snapshot_all()?,
            };
            print_snapshots(&snapshots)?;
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}

fn serve(cfg: &SharedQueueConfig, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let shared = SharedQueues::create(cfg)?;
    info!(
        os_id = shared.os_id(),
        link = %cfg.link_path().display(),
        max_queues = shared.max_queues(),
        queue_size = shared.queue_size(),
        max_consumers = shared.max_consumers(),
        "serving shared queues"
    );
    while !closing.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    info!(live_queues = shared.snapshot_all()?.len(), "shutting down");
    Ok(())
}

fn produce(
    shared: &SharedQueues,
    queue: &str,
    session: Session,
    consumer_nodes: &[NodeId],
    drain_timeout: Duration,
) -> Result<(), Box<dyn Error>> {
    let distribution: Vec<NodeId> = std::iter::once(session.node)
        .chain(consumer_nodes.iter().copied())
        .collect();
    shared.acquire(session, queue, consumer_nodes.len())?;
    let mut producer = match shared.bind(session, queue, consumer_nodes, &distribution)? {
        Binding::Producer(producer) => producer,
        Binding::Consumer(_) => {
            shared.release(session, queue)?;
            return Err(format!("shared queue {} already has a producer", queue).into());
        }
    };
    let targets: Vec<usize> = producer
        .consumer_map()
        .iter()
        .filter_map(|mapping| match mapping {
            ConsumerMapping::Slot(index) => Some(*index),
            _ => None,
        })
        .collect();
    if targets.is_empty() {
        producer.unbind(false)?;
        shared.release(session, queue)?;
        return Err(format!("no consumer slot in shared queue {}", queue).into());
    }

    let start = Instant::now();
    let mut written = 0usize;
    for line in io::stdin().lock().lines() {
        let line = line?;
        producer.write(targets[written % targets.len()], line.as_bytes())?;
        written += 1;
    }
    loop {
        let pending = producer.drain(drain_timeout)?;
        if pending == 0 {
            break;
        }
        debug!(queue, pending, "consumers still have buffered records");
    }
    let stats = producer.stats()?;
    producer.unbind(false)?;
    shared.release(session, queue)?;

    for (index, slot) in stats.iter().enumerate() {
        info!(
            queue,
            index,
            writes = slot.writes,
            reads = slot.reads,
            overflow_writes = slot.overflow_writes,
            "consumer traffic"
        );
    }
    eprintln!("Wrote {} records in {:#?}", written, start.elapsed());
    Ok(())
}

fn consume(
    shared: &SharedQueues,
    queue: &str,
    session: Session,
    consumers: usize,
) -> Result<(), Box<dyn Error>> {
    shared.acquire(session, queue, consumers)?;
    let mut consumer = match shared.bind(session, queue, &[], &[]) {
        Ok(Binding::Consumer(consumer)) => consumer,
        Ok(Binding::Producer(producer)) => {
            warn!(queue, "no producer bound yet");
            producer.unbind(true)?;
            shared.release(session, queue)?;
            return Err(format!("shared queue {} has no producer", queue).into());
        }
        Err(e) => {
            shared.release(session, queue)?;
            return Err(e.into());
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut read = 0usize;
    loop {
        match consumer.read(true)? {
            ReadOutcome::Record(record) => {
                out.write_all(&record)?;
                out.write_all(b"\n")?;
                read += 1;
            }
            ReadOutcome::Eof => break,
            ReadOutcome::WouldBlock => continue,
        }
    }
    out.flush()?;
    drop(consumer);
    shared.release(session, queue)?;
    eprintln!("Read {} records", read);
    Ok(())
}

fn print_snapshots(snapshots: &[QueueSnapshot]) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for queue in snapshots {
        writeln!(
            out,
            "{} producer={}/{} sync_block={} refcount={} paused={}",
            queue.name,
            queue.producer_node,
            queue.producer_pid,
            queue.sync_block,
            queue.refcount,
            queue.paused
        )?;
        for slot in &queue.consumers {
            writeln!(
                out,
                "  [{}] node={} pid={} status={} tuples={:?} free={}/{} read={} write={} writes={} reads={} overflow={}",
                slot.index,
                slot.node,
                slot.pid,
                slot.status,
                slot.tuple_count,
                slot.free_space,
                slot.capacity,
                slot.read_pos,
                slot.write_pos,
                slot.stats.writes,
                slot.stats.reads,
                slot.stats.overflow_writes
            )?;
        }
    }
    Ok(())
}
