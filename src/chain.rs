//! The fused-chain driver model that powers both chained and unchained
//! replica execution (spec.md §4.5, "Chaining (Operator Fusion)").
//!
//! A [`SegmentDriver<T>`] is the per-replica "run me to completion" closure
//! for one stage, from wherever its input comes from (a source functor or a
//! transport queue), through however many `.chain()`-fused kernels follow
//! it, down to a caller-supplied `downstream` callback that receives every
//! emitted record plus exactly one end-of-stream marker. The same driver
//! type represents a lone Source, a queue-fed Map, and an arbitrarily long
//! fused Source→Map→Filter→FlatMap chain — chaining is implemented purely by
//! nesting one driver's `downstream` callback inside another's, so fusing a
//! kernel in never introduces a queue.
//!
//! This is deliberately *not* expressed as a `Vec` of boxed per-kernel
//! "steps": with a fixed chain length known at each `.chain()` call site,
//! closure composition keeps every step's input/output types concrete and
//! checked by the compiler, and only erases to a trait object at the
//! driver's outer boundary (which only ever mentions the segment's current
//! output type).

use crate::context::RuntimeContext;
use std::sync::Arc;

/// One record, or the single end-of-stream marker a replica emits exactly
/// once on each outgoing lane when it terminates (spec.md §3 "End-of-stream").
pub enum ChainItem<T> {
    Record(T),
    Eos,
}

/// A `downstream` sink as seen from inside a fused chain: receives every
/// record the chain head (or an intermediate fused kernel) emits, plus the
/// terminal `Eos`.
pub type Downstream<'a, T> = dyn FnMut(ChainItem<T>) -> anyhow::Result<()> + 'a;

/// Per-replica driver for a segment: acquires input (from a source functor
/// or a transport queue) and runs it, plus every fused kernel, to
/// completion, invoking `downstream` for each emitted record and exactly
/// once with `ChainItem::Eos` when done.
///
/// Shared via `Arc` because the same driver is invoked once per replica
/// (each invocation clones its own functor state internally), not once
/// overall.
pub type SegmentDriver<T> =
    Arc<dyn Fn(&RuntimeContext, &mut Downstream<'_, T>) -> anyhow::Result<()> + Send + Sync>;
