//! Word count over a small in-memory line dataset, demonstrating the
//! chained-vs-unchained toggle and a keyed, stateful `Map` (grounded in
//! `example1.cpp`/`example2.cpp`: `Source_Functor`/`split`/`Counter_Functor`/
//! `do_sink`).

use clap::Parser;
use pipeflow::graph::{ExecutionMode, PipeGraph, TimePolicy};
use pipeflow::kernel::{FilterKernel, FlatMapKernel, MapKernel, SinkKernel, SourceKernel};
use pipeflow::{config, logging};
use std::collections::HashMap;

const DATASET: &[&str] = &[
    "to be or not to be that is the question",
    "the quick brown fox jumps over the lazy dog",
    "a word counter counts every word it sees",
    "to be is to exist and to exist is to matter",
];

#[derive(Parser)]
#[command(about = "Counts word frequencies over a small built-in dataset")]
struct Args {
    /// Fuse adjacent stages into the same replica thread where the graph allows it.
    #[arg(long, default_value_t = false)]
    chaining: bool,
    /// Path to a TOML config overriding parallelism and batching defaults.
    #[arg(long)]
    config: Option<String>,
    /// Drop words with odd length before counting (mirrors the `example2.cpp` filter demo).
    #[arg(long, default_value_t = false)]
    filter_odd_length: bool,
}

fn main() -> anyhow::Result<()> {
    logging::init_logging();
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => config::DemoConfig::default(),
    };

    let graph = PipeGraph::new("wordcount", ExecutionMode::Default, TimePolicy::IngressTime);

    let source = SourceKernel::new("source", |shipper, _ctx| {
        for line in DATASET {
            shipper.push(line.to_string())?;
        }
        Ok(())
    })
    .parallelism(cfg.source_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let splitter = FlatMapKernel::new("splitter", |line: String, shipper, _ctx| {
        for word in line.split_whitespace() {
            shipper.push(word.to_string())?;
        }
        Ok(())
    })
    .parallelism(cfg.worker_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let filter = FilterKernel::new("filter", |word: &String, _ctx| Ok(word.len() % 2 == 0))
        .parallelism(cfg.worker_parallelism);

    let counter = MapKernel::new("counter", {
        let mut table: HashMap<String, u64> = HashMap::new();
        move |word: String, _ctx| {
            let count = table.entry(word.clone()).or_insert(0);
            *count += 1;
            Ok((word, *count))
        }
    })
    .parallelism(cfg.worker_parallelism)
    .key_by(|word: &String| word.clone());

    let sink = SinkKernel::new("sink", |input: Option<(String, u64)>, _ctx| {
        match input {
            Some((word, count)) => tracing::info!(word, count, "received word"),
            None => tracing::info!("end of stream"),
        }
        Ok(())
    })
    .parallelism(cfg.sink_parallelism);

    let source_pipe = graph.add_source(source);
    if args.chaining {
        let filtered = source_pipe.chain_flat_map(splitter);
        let filtered = if args.filter_odd_length {
            filtered.chain_filter(filter)
        } else {
            filtered
        };
        filtered.add_map(counter).chain_sink(sink);
    } else {
        let filtered = source_pipe.add_flat_map(splitter);
        let filtered = if args.filter_odd_length {
            filtered.add_filter(filter)
        } else {
            filtered
        };
        filtered.add_map(counter).add_sink(sink);
    }

    graph.run()
}
