//! The unchained-edge transport: bounded MPMC queues plus the routing and
//! batching logic that sits in front of them (spec.md §4, §4.3, §4.4).
//!
//! Chained edges never touch this module at all — they are plain nested
//! closures, see [`crate::chain`]. Everything here exists only for the
//! boundary between two stages that do *not* share a fused chain.

use crate::error::GraphError;
use crate::hash::KeyExtractor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Depth of each unchained lane's bounded queue. A `flume::Sender::send`
/// blocks once a lane is full, which is the back-pressure mechanism spec.md
/// §4 ("bounded queues... a full queue blocks") relies on instead of an
/// unbounded buffer.
pub(crate) const CHANNEL_CAPACITY: usize = 1024;

/// What travels on an unchained edge: an individual record, a batch (used
/// when a stage declares `output_batch_size > 0`), or the end-of-stream
/// marker. Batching is invisible on the receiving side — both arms are
/// unwrapped into the same per-record processing loop.
pub(crate) enum Envelope<T> {
    Record(T),
    Batch(Vec<T>),
    Eos,
}

/// Allocates one lane per downstream replica. Returns the sender half (to be
/// cloned once per upstream replica) and the receiver half (one per
/// downstream replica, consumed exactly once).
pub(crate) fn make_lanes<T>(
    parallelism: usize,
) -> (
    Vec<flume::Sender<Envelope<T>>>,
    Vec<flume::Receiver<Envelope<T>>>,
) {
    let mut senders = Vec::with_capacity(parallelism);
    let mut receivers = Vec::with_capacity(parallelism);
    for _ in 0..parallelism {
        let (tx, rx) = flume::bounded(CHANNEL_CAPACITY);
        senders.push(tx);
        receivers.push(rx);
    }
    (senders, receivers)
}

/// The downstream lanes and optional key extractor for one unchained edge,
/// as seen by a single upstream replica. Cheap to clone: senders are
/// reference-counted handles and the extractor is an `Arc`.
///
/// `Clone` is implemented by hand rather than derived: `#[derive(Clone)]`
/// would add a spurious `T: Clone` bound even though nothing here actually
/// owns a `T`.
pub(crate) struct EdgeTarget<T> {
    pub lanes: Vec<flume::Sender<Envelope<T>>>,
    pub key: Option<KeyExtractor<T>>,
}

impl<T> Clone for EdgeTarget<T> {
    fn clone(&self) -> Self {
        Self {
            lanes: self.lanes.clone(),
            key: self.key.clone(),
        }
    }
}

/// Where a producer replica's output ends up: a single unchained edge, or a
/// `split()` point fanning out over a discriminant into several edges.
pub(crate) enum Output<T> {
    Edge(EdgeTarget<T>),
    Split(SplitTarget<T>),
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        match self {
            Output::Edge(edge) => Output::Edge(edge.clone()),
            Output::Split(split) => Output::Split(split.clone()),
        }
    }
}

/// A `split()` point: lane groups, filled in lazily as `select(i).add(...)`
/// (or `.chain_sink(...)`) calls are made on the graph builder. By the time
/// any replica thread actually runs, every slot is guaranteed `Some` because
/// graph description (all builder calls) completes strictly before
/// [`crate::graph::PipeGraph::run`] spawns a single thread (spec.md §3
/// Lifecycle).
pub(crate) struct SplitTarget<T> {
    pub name: Arc<str>,
    pub slots: Arc<Mutex<Vec<Option<EdgeTarget<T>>>>>,
    pub discriminant: Arc<dyn Fn(&T) -> usize + Send + Sync>,
}

impl<T> Clone for SplitTarget<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            slots: self.slots.clone(),
            discriminant: self.discriminant.clone(),
        }
    }
}

/// Per-replica router: owns one producer replica's view of an unchained
/// edge, including its round-robin cursor and per-lane output batching
/// buffers. A fresh instance is built for every replica thread, never shared.
pub(crate) struct Router<T> {
    lanes: Vec<flume::Sender<Envelope<T>>>,
    key: Option<KeyExtractor<T>>,
    batch_size: usize,
    buffers: Vec<Vec<T>>,
    round_robin: usize,
    cancelled: Arc<AtomicBool>,
}

impl<T> Router<T> {
    pub fn new(target: EdgeTarget<T>, batch_size: usize, cancelled: Arc<AtomicBool>) -> Self {
        let lane_count = target.lanes.len();
        Self {
            lanes: target.lanes,
            key: target.key,
            batch_size,
            buffers: (0..lane_count).map(|_| Vec::new()).collect(),
            round_robin: 0,
            cancelled,
        }
    }

    fn lane_for(&mut self, value: &T) -> usize {
        match &self.key {
            Some(extract) => (extract(value) as usize) % self.lanes.len(),
            None => {
                let lane = self.round_robin % self.lanes.len();
                self.round_robin = self.round_robin.wrapping_add(1);
                lane
            }
        }
    }

    /// Routes a single record, buffering it if batching is enabled. Bails
    /// out once another replica has recorded a failure elsewhere in the
    /// graph, so a producer loop feeding a healthy downstream still stops
    /// within a bounded time (spec.md §4.8) rather than running to its own
    /// natural completion.
    pub fn route(&mut self, value: T) -> anyhow::Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("graph shutting down after an earlier failure"));
        }
        let lane = self.lane_for(&value);
        if self.batch_size == 0 {
            self.send_record(lane, value)
        } else {
            self.buffers[lane].push(value);
            if self.buffers[lane].len() >= self.batch_size {
                self.flush_lane(lane)?;
            }
            Ok(())
        }
    }

    fn send_record(&self, lane: usize, value: T) -> anyhow::Result<()> {
        self.lanes[lane]
            .send(Envelope::Record(value))
            .map_err(|_| anyhow::anyhow!("downstream lane {lane} closed"))
    }

    fn flush_lane(&mut self, lane: usize) -> anyhow::Result<()> {
        let batch = std::mem::take(&mut self.buffers[lane]);
        if batch.is_empty() {
            return Ok(());
        }
        self.lanes[lane]
            .send(Envelope::Batch(batch))
            .map_err(|_| anyhow::anyhow!("downstream lane {lane} closed"))
    }

    /// Flushes every lane's partial batch. Called on end-of-stream so a
    /// stage's last few buffered records are never silently dropped
    /// (spec.md §4.3 "flushed early when the upstream replica reaches EOS").
    pub fn flush_all(&mut self) -> anyhow::Result<()> {
        for lane in 0..self.lanes.len() {
            self.flush_lane(lane)?;
        }
        Ok(())
    }

    /// Flushes, then sends exactly one `Eos` on every outgoing lane.
    pub fn send_eos(&mut self) -> anyhow::Result<()> {
        self.flush_all()?;
        for lane in &self.lanes {
            lane.send(Envelope::Eos)
                .map_err(|_| anyhow::anyhow!("downstream lane closed before EOS"))?;
        }
        Ok(())
    }
}

/// Per-replica router for a `split()` point: dispatches each record to one
/// of several [`Router`]s by discriminant, and propagates EOS to all of them.
pub(crate) struct SplitRouter<T> {
    name: Arc<str>,
    discriminant: Arc<dyn Fn(&T) -> usize + Send + Sync>,
    routers: Vec<Router<T>>,
}

impl<T> SplitRouter<T> {
    pub fn new(target: SplitTarget<T>, batch_size: usize, cancelled: Arc<AtomicBool>) -> Self {
        let slots = target.slots.lock().expect("split slots poisoned");
        let routers = slots
            .iter()
            .map(|slot| {
                let edge = slot
                    .clone()
                    .expect("split lane connected after run() started");
                Router::new(edge, batch_size, cancelled.clone())
            })
            .collect();
        drop(slots);
        Self {
            name: target.name,
            discriminant: target.discriminant,
            routers,
        }
    }

    pub fn route(&mut self, value: T) -> anyhow::Result<()> {
        let lane = (self.discriminant)(&value);
        if lane >= self.routers.len() {
            return Err(GraphError::SplitDiscriminantOutOfRange {
                name: self.name.to_string(),
                lane,
                lanes: self.routers.len(),
            }
            .into());
        }
        self.routers[lane].route(value)
    }

    pub fn send_eos(&mut self) -> anyhow::Result<()> {
        for router in &mut self.routers {
            router.send_eos()?;
        }
        Ok(())
    }
}
