//! Framework error types.
//!
//! Graph validation errors are reported synchronously by the builder/`run()`
//! entry points (spec.md §7). Everything else a user functor or the runtime
//! can fail with travels as `anyhow::Error` so it can wrap arbitrary source
//! errors without the framework needing to know about them.

use thiserror::Error;

/// Errors raised while describing or materializing a [`crate::graph::PipeGraph`].
///
/// These are all reported before any replica thread starts (spec.md §7,
/// "Graph validation errors"), except [`GraphError::SplitDiscriminantOutOfRange`]
/// which can only be detected against an actual record and is therefore
/// surfaced as a run failure rather than at build time (see SPEC_FULL.md §2).
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("stage '{name}' declares invalid parallelism {parallelism} (must be >= 1)")]
    InvalidParallelism { name: String, parallelism: usize },

    #[error(
        "cannot chain '{upstream}' (parallelism {upstream_parallelism}) into '{downstream}' \
         (parallelism {downstream_parallelism}): chained stages must share parallelism"
    )]
    ChainParallelismMismatch {
        upstream: String,
        downstream: String,
        upstream_parallelism: usize,
        downstream_parallelism: usize,
    },

    #[error(
        "cannot chain '{downstream}' into '{upstream}': chained stages may not declare a key \
         extractor (chaining never repartitions)"
    )]
    ChainKeyedNotAllowed { upstream: String, downstream: String },

    #[error("split '{name}' has {expected} lane(s) but lane {lane} was never connected to a sink")]
    DanglingSplitLane {
        name: String,
        lane: usize,
        expected: usize,
    },

    #[error("pipe graph '{name}' has no terminal sink")]
    MissingSink { name: String },

    #[error("split discriminant for '{name}' returned lane {lane}, but split only has {lanes} lane(s)")]
    SplitDiscriminantOutOfRange {
        name: String,
        lane: usize,
        lanes: usize,
    },

    #[error("failed to start replica thread for stage '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "cannot chain '{downstream}' directly onto a merge point ({upstream_count} merged \
         lineages): chaining fuses exactly one upstream replica into one downstream replica and \
         cannot fan in, use add() to introduce a queue before continuing the pipe"
    )]
    ChainAfterMerge {
        downstream: String,
        upstream_count: usize,
    },

    #[error(
        "pipe graph '{graph}' was built with a pending pipe ('{name}') that was never connected \
         to add(), chain(), split(), add_sink(), or chain_sink()"
    )]
    DanglingPipe { graph: String, name: String },
}

/// The result of a completed (or aborted) [`crate::graph::PipeGraph::run`] call.
pub type RunResult = Result<(), anyhow::Error>;
