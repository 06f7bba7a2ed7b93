//! A typed, multi-operator parallel dataflow runtime for streaming
//! benchmarks.
//!
//! A [`graph::PipeGraph`] is built up from [`kernel`] specs connected by
//! [`graph::Pipe`] ("unchained", queue-separated) or `.chain_*` ("chained",
//! fused into the same replica thread) edges, then materialized into OS
//! threads and bounded queues by [`graph::PipeGraph::run`]. See
//! `SPEC_FULL.md` for the full semantics this crate implements.
//!
//! ```no_run
//! use pipeflow::graph::{ExecutionMode, PipeGraph, TimePolicy};
//! use pipeflow::kernel::{MapKernel, SinkKernel, SourceKernel};
//!
//! let graph = PipeGraph::new("demo", ExecutionMode::Default, TimePolicy::IngressTime);
//! let numbers = graph.add_source(
//!     SourceKernel::new("numbers", |shipper, _ctx| {
//!         for i in 0..10 {
//!             shipper.push(i)?;
//!         }
//!         Ok(())
//!     })
//!     .parallelism(1),
//! );
//! let doubled = numbers.chain_map(MapKernel::new("double", |n, _ctx| Ok(n * 2)));
//! doubled.chain_sink(SinkKernel::new("print", |value, _ctx| {
//!     if let Some(v) = value {
//!         println!("{v}");
//!     }
//!     Ok(())
//! }));
//! graph.run().unwrap();
//! ```

pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod hash;
pub mod kernel;
pub mod logging;
pub mod shipper;
pub mod time;
mod transport;

pub use context::RuntimeContext;
pub use error::{GraphError, RunResult};
pub use graph::{ExecutionMode, Pipe, PipeGraph, SplitHandle, TimePolicy};
pub use hash::{key_by, stable_hash, KeyExtractor};
pub use kernel::{FilterKernel, FlatMapKernel, MapKernel, SinkKernel, SourceKernel};
pub use shipper::Shipper;
