//! Per-replica runtime context handed to kernels that want to know their own
//! position in the stage (spec.md §4.1, §6 "Runtime context").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifies a single replica within its stage and exposes the information
/// `windflow`-style sink functors typically normalize service-time samples
/// with (spec.md §4.1: "exposing at least the current replica's parallelism
/// degree").
///
/// Also carries the graph-wide cancellation flag (private: cancellation is
/// not exposed to user functors, spec.md §5) so every replica thread, queued
/// or chained, can cut its run short once another replica has reported a
/// functor failure (spec.md §4.8 "bounded time").
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    stage_parallelism: usize,
    replica_index: usize,
    cancelled: Arc<AtomicBool>,
}

impl RuntimeContext {
    pub(crate) fn new(stage_parallelism: usize, replica_index: usize, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            stage_parallelism,
            replica_index,
            cancelled,
        }
    }

    /// Degree of parallelism of the stage this replica belongs to.
    pub fn parallelism(&self) -> usize {
        self.stage_parallelism
    }

    /// This replica's index, in `0..parallelism()`.
    pub fn replica_index(&self) -> usize {
        self.replica_index
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn cancelled_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}
