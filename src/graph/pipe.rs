//! [`Pipe`]: a handle to one or more not-yet-materialized producer segments,
//! returned by every builder call and consumed by the next one (spec.md §5).
//!
//! A `Pipe<T>` carries one [`PipeSegment<T>`] per independent upstream
//! lineage — almost always exactly one, except right after [`Pipe::merge`]
//! where several sibling lineages are carried side by side until the next
//! `add`/`add_sink`/`split` call fans them all into the same downstream
//! queue.

use super::split::SplitHandle;
use super::{DeferredSpawn, GraphHandle};
use crate::chain::{ChainItem, Downstream, SegmentDriver};
use crate::context::RuntimeContext;
use crate::error::GraphError;
use crate::kernel::{FilterKernel, FlatMapKernel, MapKernel, SinkKernel, SourceKernel};
use crate::shipper::Shipper;
use crate::transport::{make_lanes, EdgeTarget, Envelope, Output, Router, SplitRouter, SplitTarget};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One producer lineage: a stage name, its declared parallelism and output
/// batching, and the fused per-replica driver that runs it (spec.md §4.5).
pub(crate) struct PipeSegment<T> {
    pub name: String,
    pub parallelism: usize,
    pub output_batch_size: usize,
    pub driver: SegmentDriver<T>,
}

/// A handle to the as-yet-unconnected output of one or more stages.
///
/// Every builder method takes `self` by value and returns either a new
/// `Pipe` (for `add`/`chain`/`merge`) or nothing (for the two sink
/// variants) or a [`SplitHandle`] (for `split`) — there is no way to hold on
/// to a half-built pipe across two calls. A `Pipe` that is dropped without
/// being consumed by one of these is reported as a dangling pipe when
/// [`super::PipeGraph::run`] validates the graph.
pub struct Pipe<T> {
    handle: GraphHandle,
    segments: Vec<PipeSegment<T>>,
    finalized: Arc<AtomicBool>,
}

impl<T> Pipe<T> {
    fn new(handle: GraphHandle, segments: Vec<PipeSegment<T>>) -> Self {
        debug_assert!(!segments.is_empty());
        let label = segments
            .first()
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let finalized = handle.register_pending(&label);
        Self {
            handle,
            segments,
            finalized,
        }
    }

    fn take(self) -> (GraphHandle, Vec<PipeSegment<T>>) {
        self.finalized.store(true, Ordering::SeqCst);
        (self.handle, self.segments)
    }

    /// Wraps a single already-built segment, for use by [`SplitHandle`]'s
    /// lane connections which build a `PipeSegment` directly rather than
    /// going through one of the `add_*`/`chain_*` methods above.
    pub(crate) fn from_segment(handle: GraphHandle, segment: PipeSegment<T>) -> Self {
        Self::new(handle, vec![segment])
    }
}

impl<T: Send + 'static> Pipe<T> {
    /// `merge` (spec.md §5): combines several sibling pipes of the same
    /// record type into one, without introducing a queue. The combined
    /// pipe's next connection sees every merged replica as one upstream
    /// population for EOS-counting purposes.
    pub fn merge(pipes: Vec<Pipe<T>>) -> Pipe<T> {
        assert!(!pipes.is_empty(), "Pipe::merge requires at least one pipe");
        let mut iter = pipes.into_iter();
        let (handle, mut segments) = iter.next().unwrap().take();
        for pipe in iter {
            let (_, mut more) = pipe.take();
            segments.append(&mut more);
        }
        Pipe::new(handle, segments)
    }

    /// `add` (spec.md §5): appends a `Map` stage behind a queue.
    pub fn add_map<Out, F>(self, kernel: MapKernel<T, Out, F>) -> Pipe<Out>
    where
        Out: Send + 'static,
        F: FnMut(T, &RuntimeContext) -> anyhow::Result<Out> + Clone + Send + 'static,
    {
        let (handle, segments) = self.take();
        validate_parallelism(&handle, &kernel.name, kernel.parallelism);
        let MapKernel {
            name,
            parallelism,
            output_batch_size,
            key,
            functor,
            ..
        } = kernel;
        let (senders, receivers) = make_lanes::<T>(parallelism);
        let expected_eos = total_parallelism(&segments);
        wire_output(segments, &handle, Output::Edge(EdgeTarget { lanes: senders, key }));
        let receiver_slots = slotify(receivers);
        let segment = build_queued_map_segment(name, parallelism, output_batch_size, receiver_slots, expected_eos, functor);
        Pipe::new(handle, vec![segment])
    }

    /// `chain` (spec.md §5): fuses a `Map` stage into the same replica
    /// thread as its single upstream segment, with no queue in between.
    pub fn chain_map<Out, F>(self, kernel: MapKernel<T, Out, F>) -> Pipe<Out>
    where
        Out: Send + 'static,
        F: FnMut(T, &RuntimeContext) -> anyhow::Result<Out> + Clone + Send + 'static,
    {
        let (handle, segments) = self.take();
        let upstream = validate_chain(&handle, segments, &kernel.name, kernel.parallelism, kernel.key.is_some());
        let MapKernel { output_batch_size, functor, .. } = kernel;
        let segment = extend_chain_map(upstream, output_batch_size, functor);
        Pipe::new(handle, vec![segment])
    }

    /// `add` (spec.md §5): appends a `FlatMap` stage behind a queue.
    pub fn add_flat_map<Out, F>(self, kernel: FlatMapKernel<T, Out, F>) -> Pipe<Out>
    where
        Out: Send + 'static,
        F: FnMut(T, &mut Shipper<'_, Out>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    {
        let (handle, segments) = self.take();
        validate_parallelism(&handle, &kernel.name, kernel.parallelism);
        let FlatMapKernel {
            name,
            parallelism,
            output_batch_size,
            key,
            functor,
            ..
        } = kernel;
        let (senders, receivers) = make_lanes::<T>(parallelism);
        let expected_eos = total_parallelism(&segments);
        wire_output(segments, &handle, Output::Edge(EdgeTarget { lanes: senders, key }));
        let receiver_slots = slotify(receivers);
        let segment =
            build_queued_flat_map_segment(name, parallelism, output_batch_size, receiver_slots, expected_eos, functor);
        Pipe::new(handle, vec![segment])
    }

    /// `chain` (spec.md §5): fuses a `FlatMap` stage into the upstream
    /// replica thread, with no queue in between.
    pub fn chain_flat_map<Out, F>(self, kernel: FlatMapKernel<T, Out, F>) -> Pipe<Out>
    where
        Out: Send + 'static,
        F: FnMut(T, &mut Shipper<'_, Out>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    {
        let (handle, segments) = self.take();
        let upstream = validate_chain(&handle, segments, &kernel.name, kernel.parallelism, kernel.key.is_some());
        let FlatMapKernel { output_batch_size, functor, .. } = kernel;
        let segment = extend_chain_flat_map(upstream, output_batch_size, functor);
        Pipe::new(handle, vec![segment])
    }

    /// `add` (spec.md §5): appends a `Filter` stage behind a queue.
    pub fn add_filter<F>(self, kernel: FilterKernel<T, F>) -> Pipe<T>
    where
        F: FnMut(&T, &RuntimeContext) -> anyhow::Result<bool> + Clone + Send + 'static,
    {
        let (handle, segments) = self.take();
        validate_parallelism(&handle, &kernel.name, kernel.parallelism);
        let FilterKernel {
            name,
            parallelism,
            output_batch_size,
            key,
            functor,
            ..
        } = kernel;
        let (senders, receivers) = make_lanes::<T>(parallelism);
        let expected_eos = total_parallelism(&segments);
        wire_output(segments, &handle, Output::Edge(EdgeTarget { lanes: senders, key }));
        let receiver_slots = slotify(receivers);
        let segment =
            build_queued_filter_segment(name, parallelism, output_batch_size, receiver_slots, expected_eos, functor);
        Pipe::new(handle, vec![segment])
    }

    /// `chain` (spec.md §5): fuses a `Filter` stage into the upstream
    /// replica thread, with no queue in between.
    pub fn chain_filter<F>(self, kernel: FilterKernel<T, F>) -> Pipe<T>
    where
        F: FnMut(&T, &RuntimeContext) -> anyhow::Result<bool> + Clone + Send + 'static,
    {
        let (handle, segments) = self.take();
        let upstream = validate_chain(&handle, segments, &kernel.name, kernel.parallelism, kernel.key.is_some());
        let FilterKernel { output_batch_size, functor, .. } = kernel;
        let segment = extend_chain_filter(upstream, output_batch_size, functor);
        Pipe::new(handle, vec![segment])
    }

    /// `add_sink` (spec.md §5): appends the terminal `Sink` stage behind a
    /// queue, on its own dedicated replica threads.
    pub fn add_sink<F>(self, kernel: SinkKernel<T, F>)
    where
        F: FnMut(Option<T>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    {
        let (handle, segments) = self.take();
        validate_parallelism(&handle, &kernel.name, kernel.parallelism);
        handle.mark_sink_registered();
        let SinkKernel {
            name,
            parallelism,
            functor,
            ..
        } = kernel;
        let (senders, receivers) = make_lanes::<T>(parallelism);
        let expected_eos = total_parallelism(&segments);
        wire_output(segments, &handle, Output::Edge(EdgeTarget { lanes: senders, key: None }));
        let receiver_slots = slotify(receivers);
        spawn_sink_queue(&handle, name, parallelism, receiver_slots, expected_eos, functor);
    }

    /// `chain_sink` (spec.md §5): fuses the terminal `Sink` stage into the
    /// same replica thread as its single upstream segment.
    pub fn chain_sink<F>(self, kernel: SinkKernel<T, F>)
    where
        F: FnMut(Option<T>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    {
        let (handle, segments) = self.take();
        let upstream = validate_chain(&handle, segments, &kernel.name, kernel.parallelism, false);
        handle.mark_sink_registered();
        let SinkKernel { functor, .. } = kernel;
        spawn_chain_sink(&handle, upstream, functor);
    }

    /// `split` (spec.md §5): fans each record out to one of `lanes` groups
    /// according to `discriminant`, each materialized as its own queue once
    /// `select(i)` is connected downstream.
    pub fn split<D>(self, name: impl Into<String>, lanes: usize, discriminant: D) -> SplitHandle<T>
    where
        D: Fn(&T) -> usize + Send + Sync + 'static,
    {
        let (handle, segments) = self.take();
        let expected_eos = total_parallelism(&segments);
        let split_name: Arc<str> = Arc::from(name.into());
        let slots = Arc::new(Mutex::new((0..lanes).map(|_| None).collect::<Vec<_>>()));
        let target = SplitTarget {
            name: split_name.clone(),
            slots: slots.clone(),
            discriminant: Arc::new(discriminant),
        };
        wire_output(segments, &handle, Output::Split(target));
        SplitHandle::new(handle, split_name, slots, lanes, expected_eos)
    }
}

pub(crate) fn validate_parallelism(handle: &GraphHandle, name: &str, parallelism: usize) {
    if parallelism == 0 {
        handle.push_validation_error(GraphError::InvalidParallelism {
            name: name.to_string(),
            parallelism,
        });
    }
}

fn total_parallelism<T>(segments: &[PipeSegment<T>]) -> usize {
    segments.iter().map(|s| s.parallelism).sum()
}

pub(crate) fn slotify<T>(receivers: Vec<flume::Receiver<Envelope<T>>>) -> Arc<Mutex<Vec<Option<flume::Receiver<Envelope<T>>>>>> {
    Arc::new(Mutex::new(receivers.into_iter().map(Some).collect()))
}

fn take_receiver<T>(
    slots: &Mutex<Vec<Option<flume::Receiver<Envelope<T>>>>>,
    index: usize,
) -> flume::Receiver<Envelope<T>> {
    slots
        .lock()
        .expect("receiver slots poisoned")
        .get_mut(index)
        .and_then(Option::take)
        .expect("receiver already taken for this replica")
}

/// Validates the `chain()` contract (spec.md §4.5: equal parallelism, no
/// rekeying, exactly one upstream lineage) and returns the sole upstream
/// segment to extend. Violations are recorded on the graph rather than
/// panicking so they are reported uniformly at `run()`.
fn validate_chain<T>(
    handle: &GraphHandle,
    mut segments: Vec<PipeSegment<T>>,
    downstream_name: &str,
    downstream_parallelism: usize,
    downstream_keyed: bool,
) -> PipeSegment<T> {
    if segments.len() != 1 {
        handle.push_validation_error(GraphError::ChainAfterMerge {
            downstream: downstream_name.to_string(),
            upstream_count: segments.len(),
        });
    }
    let upstream = segments.remove(0);
    if upstream.parallelism != downstream_parallelism {
        handle.push_validation_error(GraphError::ChainParallelismMismatch {
            upstream: upstream.name.clone(),
            downstream: downstream_name.to_string(),
            upstream_parallelism: upstream.parallelism,
            downstream_parallelism,
        });
    }
    if downstream_keyed {
        handle.push_validation_error(GraphError::ChainKeyedNotAllowed {
            upstream: upstream.name.clone(),
            downstream: downstream_name.to_string(),
        });
    }
    upstream
}

/// How often a dequeue loop wakes from an otherwise-blocking receive to
/// check whether some other replica has failed (spec.md §4.8 "bounded
/// time"): short enough that a replica idling on an unrelated branch of the
/// graph still notices a failure promptly, long enough that it is never a
/// meaningful source of busy-waiting.
const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

/// The shared dequeue loop for any stage fed by an unchained edge: unwraps
/// batches transparently, counts `Eos` until every upstream replica has
/// reported in, then propagates exactly one `Eos` downstream (spec.md §3
/// "End-of-stream", §4.3 "Batching"). Polls rather than blocking outright so
/// a functor failure elsewhere in the graph is noticed within
/// `CANCEL_POLL_INTERVAL` even if this replica's own upstream is healthy and
/// silent (spec.md §4.8).
fn run_queue_head<In, Out>(
    rx: flume::Receiver<Envelope<In>>,
    expected_eos: usize,
    ctx: &RuntimeContext,
    downstream: &mut Downstream<'_, Out>,
    mut apply: impl FnMut(In, &RuntimeContext, &mut Downstream<'_, Out>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut eos_seen = 0usize;
    while eos_seen < expected_eos {
        match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(Envelope::Record(value)) => apply(value, ctx, downstream)?,
            Ok(Envelope::Batch(batch)) => {
                for value in batch {
                    apply(value, ctx, downstream)?;
                }
            }
            Ok(Envelope::Eos) => eos_seen += 1,
            Err(flume::RecvTimeoutError::Timeout) => {
                if ctx.is_cancelled() {
                    return Err(anyhow::anyhow!("graph shutting down after an earlier failure"));
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    downstream(ChainItem::Eos)
}

pub(crate) fn build_queued_map_segment<In, Out, F>(
    name: String,
    parallelism: usize,
    output_batch_size: usize,
    receiver_slots: Arc<Mutex<Vec<Option<flume::Receiver<Envelope<In>>>>>>,
    expected_eos: usize,
    functor: F,
) -> PipeSegment<Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: FnMut(In, &RuntimeContext) -> anyhow::Result<Out> + Clone + Send + 'static,
{
    let driver: SegmentDriver<Out> = Arc::new(move |ctx, downstream| {
        let mut local = functor.clone();
        let rx = take_receiver(&receiver_slots, ctx.replica_index());
        run_queue_head(rx, expected_eos, ctx, downstream, |value, ctx, downstream| {
            let out = local(value, ctx)?;
            downstream(ChainItem::Record(out))
        })
    });
    PipeSegment {
        name,
        parallelism,
        output_batch_size,
        driver,
    }
}

pub(crate) fn build_queued_flat_map_segment<In, Out, F>(
    name: String,
    parallelism: usize,
    output_batch_size: usize,
    receiver_slots: Arc<Mutex<Vec<Option<flume::Receiver<Envelope<In>>>>>>,
    expected_eos: usize,
    functor: F,
) -> PipeSegment<Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: FnMut(In, &mut Shipper<'_, Out>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
{
    let driver: SegmentDriver<Out> = Arc::new(move |ctx, downstream| {
        let mut local = functor.clone();
        let rx = take_receiver(&receiver_slots, ctx.replica_index());
        run_queue_head(rx, expected_eos, ctx, downstream, |value, ctx, downstream| {
            let mut shipper = Shipper::new(&mut |out| downstream(ChainItem::Record(out)));
            local(value, &mut shipper, ctx)
        })
    });
    PipeSegment {
        name,
        parallelism,
        output_batch_size,
        driver,
    }
}

pub(crate) fn build_queued_filter_segment<T, F>(
    name: String,
    parallelism: usize,
    output_batch_size: usize,
    receiver_slots: Arc<Mutex<Vec<Option<flume::Receiver<Envelope<T>>>>>>,
    expected_eos: usize,
    functor: F,
) -> PipeSegment<T>
where
    T: Send + 'static,
    F: FnMut(&T, &RuntimeContext) -> anyhow::Result<bool> + Clone + Send + 'static,
{
    let driver: SegmentDriver<T> = Arc::new(move |ctx, downstream| {
        let mut local = functor.clone();
        let rx = take_receiver(&receiver_slots, ctx.replica_index());
        run_queue_head(rx, expected_eos, ctx, downstream, |value, ctx, downstream| {
            if local(&value, ctx)? {
                downstream(ChainItem::Record(value))
            } else {
                Ok(())
            }
        })
    });
    PipeSegment {
        name,
        parallelism,
        output_batch_size,
        driver,
    }
}

fn extend_chain_map<In, Out, F>(upstream: PipeSegment<In>, output_batch_size: usize, functor: F) -> PipeSegment<Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: FnMut(In, &RuntimeContext) -> anyhow::Result<Out> + Clone + Send + 'static,
{
    let PipeSegment { name, parallelism, driver: prev, .. } = upstream;
    let driver: SegmentDriver<Out> = Arc::new(move |ctx, downstream| {
        let mut local = functor.clone();
        prev(ctx, &mut |item: ChainItem<In>| match item {
            ChainItem::Record(value) => {
                let out = local(value, ctx)?;
                downstream(ChainItem::Record(out))
            }
            ChainItem::Eos => downstream(ChainItem::Eos),
        })
    });
    PipeSegment {
        name,
        parallelism,
        output_batch_size,
        driver,
    }
}

fn extend_chain_flat_map<In, Out, F>(upstream: PipeSegment<In>, output_batch_size: usize, functor: F) -> PipeSegment<Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: FnMut(In, &mut Shipper<'_, Out>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
{
    let PipeSegment { name, parallelism, driver: prev, .. } = upstream;
    let driver: SegmentDriver<Out> = Arc::new(move |ctx, downstream| {
        let mut local = functor.clone();
        prev(ctx, &mut |item: ChainItem<In>| match item {
            ChainItem::Record(value) => {
                let mut shipper = Shipper::new(&mut |out| downstream(ChainItem::Record(out)));
                local(value, &mut shipper, ctx)
            }
            ChainItem::Eos => downstream(ChainItem::Eos),
        })
    });
    PipeSegment {
        name,
        parallelism,
        output_batch_size,
        driver,
    }
}

fn extend_chain_filter<T, F>(upstream: PipeSegment<T>, output_batch_size: usize, functor: F) -> PipeSegment<T>
where
    T: Send + 'static,
    F: FnMut(&T, &RuntimeContext) -> anyhow::Result<bool> + Clone + Send + 'static,
{
    let PipeSegment { name, parallelism, driver: prev, .. } = upstream;
    let driver: SegmentDriver<T> = Arc::new(move |ctx, downstream| {
        let mut local = functor.clone();
        prev(ctx, &mut |item: ChainItem<T>| match item {
            ChainItem::Record(value) => {
                if local(&value, ctx)? {
                    downstream(ChainItem::Record(value))
                } else {
                    Ok(())
                }
            }
            ChainItem::Eos => downstream(ChainItem::Eos),
        })
    });
    PipeSegment {
        name,
        parallelism,
        output_batch_size,
        driver,
    }
}

/// Drains one producer replica to completion, routing every record (and the
/// final EOS) through whatever the segment's output is wired to.
fn run_producer_replica<T: Send + 'static>(
    ctx: &RuntimeContext,
    driver: &SegmentDriver<T>,
    output: Output<T>,
    output_batch_size: usize,
) -> anyhow::Result<()> {
    match output {
        Output::Edge(edge) => {
            let mut router = Router::new(edge, output_batch_size, ctx.cancelled_handle());
            driver(ctx, &mut |item: ChainItem<T>| match item {
                ChainItem::Record(value) => router.route(value),
                ChainItem::Eos => router.send_eos(),
            })
        }
        Output::Split(split) => {
            let mut router = SplitRouter::new(split, output_batch_size, ctx.cancelled_handle());
            driver(ctx, &mut |item: ChainItem<T>| match item {
                ChainItem::Record(value) => router.route(value),
                ChainItem::Eos => router.send_eos(),
            })
        }
    }
}

/// Registers one deferred spawn per segment: each of the segment's replicas
/// becomes its own OS thread at `run()` time, draining its driver into
/// `output`.
pub(crate) fn wire_output<T: Send + 'static>(segments: Vec<PipeSegment<T>>, handle: &GraphHandle, output: Output<T>) {
    for segment in segments {
        let PipeSegment { name, parallelism, output_batch_size, driver } = segment;
        let output = output.clone();
        let first_error = handle.first_error();
        let cancelled = handle.cancelled();
        let stage_name = name.clone();
        let spawn: DeferredSpawn = Box::new(move || {
            let mut handles = Vec::with_capacity(parallelism);
            for replica_index in 0..parallelism {
                let driver = driver.clone();
                let output = output.clone();
                let first_error = first_error.clone();
                let cancelled = cancelled.clone();
                let thread_name = format!("{stage_name}-{replica_index}");
                let spawn_error_name = stage_name.clone();
                let built = std::thread::Builder::new().name(thread_name).spawn(move || {
                    let ctx = RuntimeContext::new(parallelism, replica_index, cancelled.clone());
                    if let Err(err) = run_producer_replica(&ctx, &driver, output, output_batch_size) {
                        record_first_error(&first_error, &cancelled, err);
                    }
                });
                let joined = built.map_err(|source| GraphError::ThreadSpawn {
                    name: spawn_error_name,
                    source,
                })?;
                handles.push(joined);
            }
            Ok(handles)
        });
        handle.push_deferred(spawn);
    }
}

/// Records `err` if it is the first failure seen, and unconditionally flips
/// `cancelled` so every other replica's `RuntimeContext::is_cancelled` starts
/// returning `true` (spec.md §4.8 "must shut all replicas down in a bounded
/// time").
fn record_first_error(first_error: &Mutex<Option<anyhow::Error>>, cancelled: &AtomicBool, err: anyhow::Error) {
    let mut guard = first_error.lock().expect("first-error mutex poisoned");
    if guard.is_none() {
        *guard = Some(err);
    }
    cancelled.store(true, Ordering::Relaxed);
}

/// The sink-only dequeue loop: unlike `run_queue_head`, the sink functor is
/// invoked once per *received* `Eos` envelope rather than once at the very
/// end, matching "invoked once per direct upstream lane" (spec.md §2.5).
/// Polls on the same `CANCEL_POLL_INTERVAL` cadence as `run_queue_head` so a
/// sink idling on a healthy upstream still notices a failure elsewhere in
/// the graph (spec.md §4.8).
fn run_sink_queue<T, F>(
    rx: flume::Receiver<Envelope<T>>,
    expected_eos: usize,
    ctx: &RuntimeContext,
    functor: &mut F,
) -> anyhow::Result<()>
where
    F: FnMut(Option<T>, &RuntimeContext) -> anyhow::Result<()>,
{
    let mut eos_seen = 0usize;
    while eos_seen < expected_eos {
        match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(Envelope::Record(value)) => functor(Some(value), ctx)?,
            Ok(Envelope::Batch(batch)) => {
                for value in batch {
                    functor(Some(value), ctx)?;
                }
            }
            Ok(Envelope::Eos) => {
                functor(None, ctx)?;
                eos_seen += 1;
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                if ctx.is_cancelled() {
                    return Err(anyhow::anyhow!("graph shutting down after an earlier failure"));
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

pub(crate) fn spawn_sink_queue<T, F>(
    handle: &GraphHandle,
    name: String,
    parallelism: usize,
    receiver_slots: Arc<Mutex<Vec<Option<flume::Receiver<Envelope<T>>>>>>,
    expected_eos: usize,
    functor: F,
) where
    T: Send + 'static,
    F: FnMut(Option<T>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
{
    let first_error = handle.first_error();
    let cancelled = handle.cancelled();
    let stage_name = name.clone();
    let spawn: DeferredSpawn = Box::new(move || {
        let mut handles = Vec::with_capacity(parallelism);
        for replica_index in 0..parallelism {
            let mut functor = functor.clone();
            let receiver_slots = receiver_slots.clone();
            let first_error = first_error.clone();
            let cancelled = cancelled.clone();
            let thread_name = format!("{stage_name}-{replica_index}");
            let spawn_error_name = stage_name.clone();
            let built = std::thread::Builder::new().name(thread_name).spawn(move || {
                let ctx = RuntimeContext::new(parallelism, replica_index, cancelled.clone());
                let rx = take_receiver(&receiver_slots, replica_index);
                if let Err(err) = run_sink_queue(rx, expected_eos, &ctx, &mut functor) {
                    record_first_error(&first_error, &cancelled, err);
                }
            });
            let joined = built.map_err(|source| GraphError::ThreadSpawn {
                name: spawn_error_name,
                source,
            })?;
            handles.push(joined);
        }
        Ok(handles)
    });
    handle.push_deferred(spawn);
}

pub(crate) fn spawn_chain_sink<T, F>(handle: &GraphHandle, upstream: PipeSegment<T>, functor: F)
where
    T: Send + 'static,
    F: FnMut(Option<T>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
{
    let PipeSegment { name, parallelism, driver, .. } = upstream;
    let first_error = handle.first_error();
    let cancelled = handle.cancelled();
    let stage_name = name.clone();
    let spawn: DeferredSpawn = Box::new(move || {
        let mut handles = Vec::with_capacity(parallelism);
        for replica_index in 0..parallelism {
            let driver = driver.clone();
            let mut functor = functor.clone();
            let first_error = first_error.clone();
            let cancelled = cancelled.clone();
            let thread_name = format!("{stage_name}-{replica_index}");
            let spawn_error_name = stage_name.clone();
            let built = std::thread::Builder::new().name(thread_name).spawn(move || {
                let ctx = RuntimeContext::new(parallelism, replica_index, cancelled.clone());
                let result = driver(&ctx, &mut |item: ChainItem<T>| {
                    if ctx.is_cancelled() {
                        return Err(anyhow::anyhow!("graph shutting down after an earlier failure"));
                    }
                    match item {
                        ChainItem::Record(value) => functor(Some(value), &ctx),
                        ChainItem::Eos => functor(None, &ctx),
                    }
                });
                if let Err(err) = result {
                    record_first_error(&first_error, &cancelled, err);
                }
            });
            let joined = built.map_err(|source| GraphError::ThreadSpawn {
                name: spawn_error_name,
                source,
            })?;
            handles.push(joined);
        }
        Ok(handles)
    });
    handle.push_deferred(spawn);
}

pub(crate) fn from_source<T, F>(handle: &GraphHandle, source: SourceKernel<T, F>) -> Pipe<T>
where
    T: Send + 'static,
    F: FnMut(&mut Shipper<'_, T>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
{
    validate_parallelism(handle, &source.name, source.parallelism);
    let SourceKernel {
        name,
        parallelism,
        output_batch_size,
        functor,
        ..
    } = source;
    let driver: SegmentDriver<T> = Arc::new(move |ctx, downstream| {
        let mut local = functor.clone();
        {
            let mut shipper = Shipper::new(&mut |value: T| downstream(ChainItem::Record(value)));
            local(&mut shipper, ctx)?;
        }
        downstream(ChainItem::Eos)
    });
    let segment = PipeSegment {
        name,
        parallelism,
        output_batch_size,
        driver,
    };
    Pipe::new(handle.clone(), vec![segment])
}
