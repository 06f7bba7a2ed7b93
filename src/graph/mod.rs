//! [`PipeGraph`]: the builder that composes kernels into a graph and
//! materializes it into OS threads and bounded queues at [`PipeGraph::run`]
//! (spec.md §3 "Lifecycle", §5 "PipeGraph composition").

mod pipe;
mod split;

pub use pipe::Pipe;
pub use split::SplitHandle;

use crate::error::GraphError;
use crate::kernel::SourceKernel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// How records are ordered when several upstream replicas feed a single
/// downstream replica (spec.md §6 "Execution modes").
///
/// Both variants are implemented identically in this runtime: neither
/// changes scheduling, only the unchained transport's inherent per-sender
/// FIFO ordering is ever guaranteed, so `Deterministic` does not reorder
/// interleavings from distinct upstream senders into a single global order.
/// It exists so a pipe graph can document the ordering it was designed
/// against without the runtime silently reinterpreting that intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Default,
    Deterministic,
}

/// Which notion of time a windowing-style kernel should use when it buckets
/// records (spec.md §6 "Time policy"). The runtime itself is agnostic to
/// time beyond passing this through: windowing semantics live entirely in
/// user functors (spec.md Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePolicy {
    /// Bucket by wall-clock time at the moment a record is processed.
    IngressTime,
    /// Bucket by a timestamp carried in the record itself. The runtime does
    /// not extract or validate this timestamp; it is purely advisory
    /// metadata for functors that choose to honor it.
    EventTime,
}

pub(crate) type DeferredSpawn = Box<dyn FnOnce() -> Result<Vec<JoinHandle<()>>, GraphError> + Send>;

struct GraphInner {
    name: String,
    mode: ExecutionMode,
    time_policy: TimePolicy,
    deferred: Vec<DeferredSpawn>,
    validation_errors: Vec<GraphError>,
    pending: Vec<(String, Arc<AtomicBool>)>,
    sink_registered: bool,
    first_error: Arc<Mutex<Option<anyhow::Error>>>,
    /// Set the moment any replica records a functor failure, so every other
    /// replica can notice (via `RuntimeContext::is_cancelled`) and stop
    /// within a bounded time instead of running to natural completion
    /// (spec.md §4.8).
    cancelled: Arc<AtomicBool>,
}

#[derive(Clone)]
pub(crate) struct GraphHandle(Arc<Mutex<GraphInner>>);

impl GraphHandle {
    pub(crate) fn name(&self) -> String {
        self.0.lock().expect("graph state poisoned").name.clone()
    }

    pub(crate) fn mode(&self) -> ExecutionMode {
        self.0.lock().expect("graph state poisoned").mode
    }

    pub(crate) fn time_policy(&self) -> TimePolicy {
        self.0.lock().expect("graph state poisoned").time_policy
    }

    pub(crate) fn first_error(&self) -> Arc<Mutex<Option<anyhow::Error>>> {
        self.0.lock().expect("graph state poisoned").first_error.clone()
    }

    pub(crate) fn cancelled(&self) -> Arc<AtomicBool> {
        self.0.lock().expect("graph state poisoned").cancelled.clone()
    }

    pub(crate) fn push_deferred(&self, spawn: DeferredSpawn) {
        self.0.lock().expect("graph state poisoned").deferred.push(spawn);
    }

    pub(crate) fn push_validation_error(&self, error: GraphError) {
        self.0
            .lock()
            .expect("graph state poisoned")
            .validation_errors
            .push(error);
    }

    /// Registers a freshly built [`Pipe`] so `run()` can detect one that was
    /// built but never connected to anything downstream.
    pub(crate) fn register_pending(&self, name: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.0
            .lock()
            .expect("graph state poisoned")
            .pending
            .push((name.to_string(), flag.clone()));
        flag
    }

    pub(crate) fn mark_sink_registered(&self) {
        self.0.lock().expect("graph state poisoned").sink_registered = true;
    }
}

/// The top-level builder: owns the whole graph description and, once `run()`
/// is called, every replica thread.
pub struct PipeGraph {
    handle: GraphHandle,
}

impl PipeGraph {
    pub fn new(name: impl Into<String>, mode: ExecutionMode, time_policy: TimePolicy) -> Self {
        let inner = GraphInner {
            name: name.into(),
            mode,
            time_policy,
            deferred: Vec::new(),
            validation_errors: Vec::new(),
            pending: Vec::new(),
            sink_registered: false,
            first_error: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        Self {
            handle: GraphHandle(Arc::new(Mutex::new(inner))),
        }
    }

    /// Adds a source stage, the only way records enter the graph.
    pub fn add_source<T, F>(&self, source: SourceKernel<T, F>) -> Pipe<T>
    where
        T: Send + 'static,
        F: FnMut(&mut crate::shipper::Shipper<'_, T>, &crate::context::RuntimeContext) -> anyhow::Result<()>
            + Clone
            + Send
            + 'static,
    {
        pipe::from_source(&self.handle, source)
    }

    /// Validates the graph, spawns one OS thread per replica (fused chains
    /// get one thread per chain-replica, not one per fused kernel), and
    /// blocks until every thread has observed end-of-stream and exited
    /// (spec.md §3 "Lifecycle", §7 "Failure model").
    ///
    /// Validation errors are reported before any thread starts. After that,
    /// the first functor or transport error anywhere in the graph wins: it is
    /// captured, every other replica notices via its `RuntimeContext` and
    /// stops within a bounded time rather than running to completion
    /// (spec.md §4.8), every thread is still joined (so startup never
    /// leaks), and the first error is returned here.
    pub fn run(self) -> anyhow::Result<()> {
        let (name, deferred, mut validation_errors, pending, first_error, sink_registered) = {
            let mut inner = self.handle.0.lock().expect("graph state poisoned");
            (
                inner.name.clone(),
                std::mem::take(&mut inner.deferred),
                std::mem::take(&mut inner.validation_errors),
                std::mem::take(&mut inner.pending),
                inner.first_error.clone(),
                inner.sink_registered,
            )
        };

        for (pipe_name, flag) in &pending {
            if !flag.load(Ordering::SeqCst) {
                validation_errors.push(GraphError::DanglingPipe {
                    graph: name.clone(),
                    name: pipe_name.clone(),
                });
            }
        }
        if !sink_registered {
            validation_errors.push(GraphError::MissingSink { name: name.clone() });
        }
        if let Some(first) = validation_errors.into_iter().next() {
            return Err(first.into());
        }

        let mut handles = Vec::new();
        for spawn in deferred {
            match spawn() {
                Ok(mut started) => handles.append(&mut started),
                Err(spawn_err) => {
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(spawn_err.into());
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                let mut guard = first_error.lock().expect("first-error mutex poisoned");
                if guard.is_none() {
                    *guard = Some(anyhow::anyhow!("a replica thread panicked"));
                }
            }
        }

        if let Some(err) = first_error.lock().expect("first-error mutex poisoned").take() {
            return Err(err);
        }
        Ok(())
    }
}
