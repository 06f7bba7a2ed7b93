//! Kernel builders: the typed specs a caller hands to [`crate::graph::PipeGraph`]
//! or [`crate::graph::Pipe`] to describe one stage (spec.md §2, "Operator
//! kernels").
//!
//! Every builder carries its functor by value rather than behind a trait
//! object. The functor must be `Clone` because a stage with parallelism `p`
//! runs `p` independent replicas, each owning its own copy — cloning is how
//! a stage with per-replica state (a counter, an RNG, a small cache) gets
//! one instance per thread instead of contending over a shared one.

use crate::hash::{key_by, KeyExtractor};
use crate::shipper::Shipper;
use crate::context::RuntimeContext;
use std::hash::Hash;
use std::marker::PhantomData;

const DEFAULT_PARALLELISM: usize = 1;
const DEFAULT_OUTPUT_BATCH_SIZE: usize = 0;

/// `0..∞` cardinality: produces records with no upstream input (spec.md §2.1).
pub struct SourceKernel<T, F> {
    pub(crate) name: String,
    pub(crate) parallelism: usize,
    pub(crate) output_batch_size: usize,
    pub(crate) functor: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> SourceKernel<T, F>
where
    F: FnMut(&mut Shipper<'_, T>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>, functor: F) -> Self {
        Self {
            name: name.into(),
            parallelism: DEFAULT_PARALLELISM,
            output_batch_size: DEFAULT_OUTPUT_BATCH_SIZE,
            functor,
            _marker: PhantomData,
        }
    }

    pub fn parallelism(mut self, p: usize) -> Self {
        self.parallelism = p;
        self
    }

    pub fn output_batch_size(mut self, b: usize) -> Self {
        self.output_batch_size = b;
        self
    }
}

/// `1 → 1` cardinality: transforms each input record into exactly one output
/// record (spec.md §2.2).
pub struct MapKernel<In, Out, F> {
    pub(crate) name: String,
    pub(crate) parallelism: usize,
    pub(crate) output_batch_size: usize,
    pub(crate) key: Option<KeyExtractor<In>>,
    pub(crate) functor: F,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F> MapKernel<In, Out, F>
where
    F: FnMut(In, &RuntimeContext) -> anyhow::Result<Out> + Clone + Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new(name: impl Into<String>, functor: F) -> Self {
        Self {
            name: name.into(),
            parallelism: DEFAULT_PARALLELISM,
            output_batch_size: DEFAULT_OUTPUT_BATCH_SIZE,
            key: None,
            functor,
            _marker: PhantomData,
        }
    }

    pub fn parallelism(mut self, p: usize) -> Self {
        self.parallelism = p;
        self
    }

    pub fn output_batch_size(mut self, b: usize) -> Self {
        self.output_batch_size = b;
        self
    }

    /// Declares the key extractor upstream replicas use to route records
    /// into this stage (spec.md §4.4). Not compatible with `.chain()`:
    /// chaining never repartitions, it only fuses adjacent replicas.
    pub fn key_by<K, KF>(mut self, extractor: KF) -> Self
    where
        KF: Fn(&In) -> K + Send + Sync + 'static,
        K: Hash,
    {
        self.key = Some(key_by(extractor));
        self
    }
}

/// `1 → N` cardinality: emits zero or more output records per input record
/// via a [`Shipper`] (spec.md §2.3).
pub struct FlatMapKernel<In, Out, F> {
    pub(crate) name: String,
    pub(crate) parallelism: usize,
    pub(crate) output_batch_size: usize,
    pub(crate) key: Option<KeyExtractor<In>>,
    pub(crate) functor: F,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F> FlatMapKernel<In, Out, F>
where
    F: FnMut(In, &mut Shipper<'_, Out>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new(name: impl Into<String>, functor: F) -> Self {
        Self {
            name: name.into(),
            parallelism: DEFAULT_PARALLELISM,
            output_batch_size: DEFAULT_OUTPUT_BATCH_SIZE,
            key: None,
            functor,
            _marker: PhantomData,
        }
    }

    pub fn parallelism(mut self, p: usize) -> Self {
        self.parallelism = p;
        self
    }

    pub fn output_batch_size(mut self, b: usize) -> Self {
        self.output_batch_size = b;
        self
    }

    pub fn key_by<K, KF>(mut self, extractor: KF) -> Self
    where
        KF: Fn(&In) -> K + Send + Sync + 'static,
        K: Hash,
    {
        self.key = Some(key_by(extractor));
        self
    }
}

/// `1 → {0, 1}` cardinality: a predicate decides whether each record
/// survives (spec.md §2.4).
pub struct FilterKernel<T, F> {
    pub(crate) name: String,
    pub(crate) parallelism: usize,
    pub(crate) output_batch_size: usize,
    pub(crate) key: Option<KeyExtractor<T>>,
    pub(crate) functor: F,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, F> FilterKernel<T, F>
where
    F: FnMut(&T, &RuntimeContext) -> anyhow::Result<bool> + Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>, functor: F) -> Self {
        Self {
            name: name.into(),
            parallelism: DEFAULT_PARALLELISM,
            output_batch_size: DEFAULT_OUTPUT_BATCH_SIZE,
            key: None,
            functor,
            _marker: PhantomData,
        }
    }

    pub fn parallelism(mut self, p: usize) -> Self {
        self.parallelism = p;
        self
    }

    pub fn output_batch_size(mut self, b: usize) -> Self {
        self.output_batch_size = b;
        self
    }

    pub fn key_by<K, KF>(mut self, extractor: KF) -> Self
    where
        KF: Fn(&T) -> K + Send + Sync + 'static,
        K: Hash,
    {
        self.key = Some(key_by(extractor));
        self
    }
}

/// `N → 0` cardinality: the terminal stage of a pipe. Invoked once per
/// record and, for every direct upstream lane, exactly once with `None`
/// so it can flush aggregated state (spec.md §2.5, §3 "End-of-stream").
///
/// No `key_by`: a sink has no downstream to repartition for (spec.md §4.1
/// accepts key extractors only on `Map`/`FlatMap`/`Filter`).
pub struct SinkKernel<T, F> {
    pub(crate) name: String,
    pub(crate) parallelism: usize,
    pub(crate) functor: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> SinkKernel<T, F>
where
    F: FnMut(Option<T>, &RuntimeContext) -> anyhow::Result<()> + Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>, functor: F) -> Self {
        Self {
            name: name.into(),
            parallelism: DEFAULT_PARALLELISM,
            functor,
            _marker: PhantomData,
        }
    }

    pub fn parallelism(mut self, p: usize) -> Self {
        self.parallelism = p;
        self
    }
}
