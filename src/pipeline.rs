//! Thread topology of the capture path.
//!
//! A packet thread classifies frames into the flow tree; a flow thread
//! serializes flushed nodes into data blocks; a worker pool hands completed
//! blocks to the file writer. Shutdown is cooperative: the `done` flag is set
//! by the signal handler, the packet thread flushes the flow tree and closes
//! the node list, and every queue is drained before its consumers exit so
//! the flow file stays valid.

use crate::flow_cache::{FlowTree, FlowTreeConfig, NodeList, PacketData};
use crate::record::{BlockWriter, DataBlock, RecordError};
use crate::stat::StatRecord;

use log::{debug, error};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Upper bound on the block-writer worker pool.
pub const MAX_WORKERS: usize = 64;

/// How often the packet thread sweeps the flow tree for idle flows.
const EXPIRE_INTERVAL_MS: u64 = 1000;

/// Resolves a requested worker count: 0 picks the number of cores, anything
/// else is clamped to [`MAX_WORKERS`].
pub fn num_workers(requested: usize) -> usize {
    if requested == 0 {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS)
    } else {
        requested.min(MAX_WORKERS)
    }
}

/// Capture device abstraction. The pcap/BPF plumbing implements this outside
/// the engine; tests drive it with canned packets.
pub trait PacketSource: Send {
    /// Next classified packet, or `None` at end of stream.
    fn next_packet(&mut self) -> Option<PacketData>;
}

/// File-writer abstraction: compression and on-disk framing of completed
/// blocks happen behind this interface.
pub trait BlockSink: Send {
    fn write_block(&mut self, block: &DataBlock);
}

/// Controller barrier: workers wait, the controller waits for all of them,
/// decides the next phase and releases.
#[derive(Debug)]
pub struct ControlBarrier {
    state: Mutex<BarrierState>,
    worker_cond: Condvar,
    controller_cond: Condvar,
    num_workers: usize,
}

#[derive(Debug, Default)]
struct BarrierState {
    waiting: usize,
    generation: u64,
}

impl ControlBarrier {
    pub fn new(num_workers: usize) -> Self {
        ControlBarrier {
            state: Mutex::new(BarrierState::default()),
            worker_cond: Condvar::new(),
            controller_cond: Condvar::new(),
            num_workers,
        }
    }

    /// Called by a worker: announces the phase is finished and blocks until
    /// the controller releases the barrier.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting += 1;
        if state.waiting == self.num_workers {
            self.controller_cond.notify_one();
        }
        let generation = state.generation;
        while state.generation == generation {
            state = self.worker_cond.wait(state).unwrap();
        }
    }

    /// Called by the controller: blocks until every worker sits at the
    /// barrier.
    pub fn controller_wait(&self) {
        let mut state = self.state.lock().unwrap();
        while state.waiting < self.num_workers {
            state = self.controller_cond.wait(state).unwrap();
        }
    }

    /// Called by the controller: starts the next phase.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting = 0;
        state.generation += 1;
        drop(state);
        self.worker_cond.notify_all();
    }
}

/// Outcome of a timed queue pop.
enum Popped {
    Block(DataBlock),
    Empty,
    Closed,
}

/// Queue of completed data blocks between the flow thread and the worker
/// pool.
#[derive(Debug, Default)]
pub struct BlockQueue {
    state: Mutex<BlockQueueState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct BlockQueueState {
    queue: VecDeque<DataBlock>,
    closed: bool,
}

impl BlockQueue {
    pub fn new() -> Self {
        BlockQueue::default()
    }

    pub fn push(&self, block: DataBlock) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(block);
        drop(state);
        self.cond.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Popped {
        let mut state = self.state.lock().unwrap();
        if let Some(block) = state.queue.pop_front() {
            return Popped::Block(block);
        }
        if state.closed {
            return Popped::Closed;
        }
        let (mut state, _) = self.cond.wait_timeout(state, timeout).unwrap();
        match state.queue.pop_front() {
            Some(block) => Popped::Block(block),
            None if state.closed => Popped::Closed,
            None => Popped::Empty,
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flushes completed blocks into the block queue.
struct QueueWriter<'a>(&'a BlockQueue);

impl BlockWriter for QueueWriter<'_> {
    fn flush(&mut self, block: &mut DataBlock) {
        if !block.is_empty() {
            self.0.push(block.take());
        }
    }
}

/// Spawns the packet thread: reads from the source, feeds the flow tree,
/// sweeps idle flows once a second. On end of stream or `done`, flushes the
/// tree and closes the node list.
pub fn spawn_packet_thread(
    mut source: Box<dyn PacketSource>,
    config: FlowTreeConfig,
    nodes: Arc<NodeList>,
    done: Arc<AtomicBool>,
) -> JoinHandle<u64> {
    thread::spawn(move || {
        let mut tree = FlowTree::new(config);
        let mut last_expire_ms = 0u64;
        while !done.load(Ordering::Relaxed) {
            let Some(pkt) = source.next_packet() else {
                break;
            };
            let now = pkt.received_ms;
            tree.insert(&pkt, &nodes);
            if now.saturating_sub(last_expire_ms) >= EXPIRE_INTERVAL_MS {
                tree.expire(now, &nodes);
                last_expire_ms = now;
            }
        }
        debug!("packet thread: draining flow tree");
        tree.flush_all(&nodes);
        nodes.close();
        tree.duplicates
    })
}

/// Spawns the flow thread: serializes flushed nodes into blocks, accounts
/// statistics, pushes full blocks into the block queue. Terminates on end of
/// the node queue, pushing the partial block and closing the block queue.
pub fn spawn_flow_thread(
    nodes: Arc<NodeList>,
    blocks: Arc<BlockQueue>,
    stat: Arc<Mutex<StatRecord>>,
) -> JoinHandle<u64> {
    thread::spawn(move || {
        let mut emitted = 0u64;
        let mut block = DataBlock::default();
        while let Some(node) = nodes.pop() {
            let mut writer = QueueWriter(&blocks);
            match node.emit(&mut block, &mut writer) {
                Ok(_) => {
                    emitted += 1;
                    let generic = crate::extensions::ExGenericFlow {
                        msec_first: node.msec_first,
                        msec_last: node.msec_last,
                        in_packets: node.packets,
                        in_bytes: node.bytes,
                        proto: node.key.proto,
                        ..Default::default()
                    };
                    stat.lock().unwrap().update(&generic, None);
                }
                Err(RecordError::BlockFull) => {
                    debug!("flow thread: node larger than an empty block, dropped");
                }
                Err(e) => error!("flow thread: emit failed: {}", e),
            }
        }
        if !block.is_empty() {
            blocks.push(block.take());
        }
        blocks.close();
        emitted
    })
}

/// Pool of block-writer workers with a rotation barrier.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    barrier: Arc<ControlBarrier>,
    rotate_pending: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `workers` threads consuming the block queue into the sink.
    /// Pending blocks are always written before a worker exits.
    pub fn spawn(
        workers: usize,
        blocks: Arc<BlockQueue>,
        sink: Arc<Mutex<dyn BlockSink>>,
    ) -> WorkerPool {
        let workers = num_workers(workers);
        let barrier = Arc::new(ControlBarrier::new(workers));
        let rotate_pending = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let blocks = Arc::clone(&blocks);
            let sink = Arc::clone(&sink);
            let barrier = Arc::clone(&barrier);
            let rotate_pending = Arc::clone(&rotate_pending);
            handles.push(thread::spawn(move || {
                loop {
                    if rotate_pending.load(Ordering::Acquire) {
                        barrier.wait();
                    }
                    match blocks.pop_timeout(Duration::from_millis(100)) {
                        Popped::Block(block) => {
                            sink.lock().unwrap().write_block(&block);
                        }
                        Popped::Empty => {}
                        Popped::Closed => break,
                    }
                }
            }));
        }

        WorkerPool {
            handles,
            barrier,
            rotate_pending,
        }
    }

    /// Parks every worker at the barrier, runs the phase change (e.g. file
    /// rotation inside the sink), then resumes the pool.
    pub fn rotate<F: FnOnce()>(&self, phase_change: F) {
        self.rotate_pending.store(true, Ordering::Release);
        self.barrier.controller_wait();
        phase_change();
        self.rotate_pending.store(false, Ordering::Release);
        self.barrier.release();
    }

    /// Waits for the pool to drain and exit; call after closing the queue.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
