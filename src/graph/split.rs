//! [`SplitHandle`]: the `select()` half of `split` (spec.md §5).
//!
//! `Pipe::split` immediately wires every upstream replica's output into a
//! shared discriminant-routed fan-out and returns a `SplitHandle` whose
//! lanes are still unconnected. Each `select(i)` must be finished off with
//! exactly one `add_*`/`add_sink` call before [`super::PipeGraph::run`];
//! leaving a lane unconnected is reported as a dangling split lane.

use super::pipe::{self, Pipe};
use super::GraphHandle;
use crate::context::RuntimeContext;
use crate::error::GraphError;
use crate::kernel::{FilterKernel, FlatMapKernel, MapKernel, SinkKernel};
use crate::shipper::Shipper;
use crate::transport::{make_lanes, EdgeTarget};
use std::sync::{Arc, Mutex};

/// A `split()` point with `lanes` outgoing groups, each to be connected with
/// [`SplitHandle::select`].
pub struct SplitHandle<T> {
    handle: GraphHandle,
    name: Arc<str>,
    slots: Arc<Mutex<Vec<Option<EdgeTarget<T>>>>>,
    lanes: usize,
    expected_eos: usize,
    connected: Vec<bool>,
}

impl<T: Send + 'static> SplitHandle<T> {
    pub(crate) fn new(
        handle: GraphHandle,
        name: Arc<str>,
        slots: Arc<Mutex<Vec<Option<EdgeTarget<T>>>>>,
        lanes: usize,
        expected_eos: usize,
    ) -> Self {
        Self {
            handle,
            name,
            slots,
            lanes,
            expected_eos,
            connected: vec![false; lanes],
        }
    }

    /// Number of lanes this split point was declared with.
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Selects lane `lane` for connecting downstream. Panics if `lane` is
    /// out of range — this is a graph-description bug, caught the same way
    /// an out-of-bounds slice index would be, not a data-dependent failure
    /// (unlike a discriminant returning an out-of-range lane for an actual
    /// record, which is reported as [`GraphError::SplitDiscriminantOutOfRange`]).
    pub fn select(&mut self, lane: usize) -> SplitLane<T> {
        assert!(lane < self.lanes, "split lane {lane} out of range (0..{})", self.lanes);
        assert!(!self.connected[lane], "split lane {lane} already connected");
        self.connected[lane] = true;
        SplitLane {
            handle: self.handle.clone(),
            split_name: self.name.clone(),
            slots: self.slots.clone(),
            lane,
            expected_eos: self.expected_eos,
        }
    }
}

impl<T> Drop for SplitHandle<T> {
    fn drop(&mut self) {
        for (lane, connected) in self.connected.iter().enumerate() {
            if !connected {
                self.handle.push_validation_error(GraphError::DanglingSplitLane {
                    name: self.name.to_string(),
                    lane,
                    expected: self.lanes,
                });
            }
        }
    }
}

/// One selected lane of a `split()`, ready to be finished off with exactly
/// one `add_*`/`add_sink` call. Splitting always introduces a queue on every
/// lane (a single producer replica's record can land on any lane, so the
/// lane's consumer cannot be fused into the producer's thread), so unlike
/// [`Pipe`] there is no `chain_*`/`chain_sink` here.
pub struct SplitLane<T> {
    handle: GraphHandle,
    split_name: Arc<str>,
    slots: Arc<Mutex<Vec<Option<EdgeTarget<T>>>>>,
    lane: usize,
    expected_eos: usize,
}

impl<T: Send + 'static> SplitLane<T> {
    fn fill(&self, edge: EdgeTarget<T>) {
        let mut slots = self.slots.lock().expect("split slots poisoned");
        slots[self.lane] = Some(edge);
    }

    fn stage_name(&self, kernel_name: &str) -> String {
        format!("{}/lane{}:{}", self.split_name, self.lane, kernel_name)
    }

    pub fn add_map<Out, F>(self, kernel: MapKernel<T, Out, F>) -> Pipe<Out>
    where
        Out: Send + 'static,
        F: FnMut(T, &RuntimeContext) -> anyhow::Result<Out> + Clone + Send + 'static,
    {
        pipe::validate_parallelism(&self.handle, &kernel.name, kernel.parallelism);
        let MapKernel {
            name,
            parallelism,
            output_batch_size,
            key,
            functor,
            ..
        } = kernel;
        let (senders, receivers) = make_lanes::<T>(parallelism);
        self.fill(EdgeTarget { lanes: senders, key });
        let receiver_slots = pipe::slotify(receivers);
        let segment = pipe::build_queued_map_segment(
            self.stage_name(&name),
            parallelism,
            output_batch_size,
            receiver_slots,
            self.expected_eos,
            functor,
        );
        Pipe::from_segment(self.handle, segment)
    }

    pub fn add_flat_map<Out, F>(self, kernel: FlatMapKernel<T, Out, F>) -> Pipe<Out>
    where
        Out: Send + 'static,
        F: FnMut(T, &mut Shipper<'_, Out>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    {
        pipe::validate_parallelism(&self.handle, &kernel.name, kernel.parallelism);
        let FlatMapKernel {
            name,
            parallelism,
            output_batch_size,
            key,
            functor,
            ..
        } = kernel;
        let (senders, receivers) = make_lanes::<T>(parallelism);
        self.fill(EdgeTarget { lanes: senders, key });
        let receiver_slots = pipe::slotify(receivers);
        let segment = pipe::build_queued_flat_map_segment(
            self.stage_name(&name),
            parallelism,
            output_batch_size,
            receiver_slots,
            self.expected_eos,
            functor,
        );
        Pipe::from_segment(self.handle, segment)
    }

    pub fn add_filter<F>(self, kernel: FilterKernel<T, F>) -> Pipe<T>
    where
        F: FnMut(&T, &RuntimeContext) -> anyhow::Result<bool> + Clone + Send + 'static,
    {
        pipe::validate_parallelism(&self.handle, &kernel.name, kernel.parallelism);
        let FilterKernel {
            name,
            parallelism,
            output_batch_size,
            key,
            functor,
            ..
        } = kernel;
        let (senders, receivers) = make_lanes::<T>(parallelism);
        self.fill(EdgeTarget { lanes: senders, key });
        let receiver_slots = pipe::slotify(receivers);
        let segment = pipe::build_queued_filter_segment(
            self.stage_name(&name),
            parallelism,
            output_batch_size,
            receiver_slots,
            self.expected_eos,
            functor,
        );
        Pipe::from_segment(self.handle, segment)
    }

    pub fn add_sink<F>(self, kernel: SinkKernel<T, F>)
    where
        F: FnMut(Option<T>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    {
        pipe::validate_parallelism(&self.handle, &kernel.name, kernel.parallelism);
        self.handle.mark_sink_registered();
        let SinkKernel {
            name,
            parallelism,
            functor,
            ..
        } = kernel;
        let (senders, receivers) = make_lanes::<T>(parallelism);
        self.fill(EdgeTarget { lanes: senders, key: None });
        let receiver_slots = pipe::slotify(receivers);
        pipe::spawn_sink_queue(
            &self.handle,
            self.stage_name(&name),
            parallelism,
            receiver_slots,
            self.expected_eos,
            functor,
        );
    }
}
