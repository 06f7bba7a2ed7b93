//! Hashtag trend counting with a periodic flush, grounded in
//! `tt-trending-topics/tt.cpp`'s tick-tuple pattern: a timer source is
//! `merge`d into the hashtag stream so the keyed rolling counter sees both
//! data and tick records on the same input type, flushing its window totals
//! whenever a tick arrives instead of tracking wall-clock time itself.

use clap::Parser;
use pipeflow::graph::{ExecutionMode, PipeGraph, TimePolicy};
use pipeflow::kernel::{FlatMapKernel, SinkKernel, SourceKernel};
use pipeflow::time::tick_source;
use pipeflow::{config, logging, Pipe};
use std::collections::HashMap;
use std::time::Duration;

const TWEETS: &[&str] = &[
    "loving the new #rustlang release, #performance is great",
    "anyone else excited for the #worldcup final tonight?",
    "#rustlang traits make this so much cleaner than I expected",
    "just watched the #worldcup highlights, what a game",
    "debugging is easier with good #tooling, #rustlang ftw",
    "#worldcup #worldcup everyone is talking about it",
];

#[derive(Debug, Clone)]
struct Topic {
    word: String,
    is_tick: bool,
}

#[derive(Debug, Clone)]
struct Counts {
    word: String,
    count: u64,
}

#[derive(Parser)]
#[command(about = "Counts trending hashtags, flushing totals on a periodic tick")]
struct Args {
    #[arg(long, default_value_t = false)]
    chaining: bool,
    #[arg(long)]
    config: Option<String>,
    /// How many tick-driven flushes to perform before shutting down.
    #[arg(long, default_value_t = 4)]
    ticks: usize,
    /// Milliseconds between ticks.
    #[arg(long, default_value_t = 150)]
    tick_period_ms: u64,
}

fn main() -> anyhow::Result<()> {
    logging::init_logging();
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => config::DemoConfig::default(),
    };

    let graph = PipeGraph::new("tt-trending-topics", ExecutionMode::Default, TimePolicy::IngressTime);

    let extractor = FlatMapKernel::new("topic-extractor", |tweet: String, shipper, _ctx| {
        for word in tweet.split_whitespace() {
            if let Some(hashtag) = word.strip_prefix('#') {
                shipper.push(Topic { word: hashtag.to_lowercase(), is_tick: false })?;
            }
        }
        Ok(())
    })
    .parallelism(cfg.source_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let tick_period = Duration::from_millis(args.tick_period_ms);
    let run_for = tick_period * (args.ticks as u32);
    let timer = tick_source(
        "tick-source",
        tick_period,
        Some(run_for),
        cfg.worker_parallelism,
        |probe: &str| Topic { word: probe.to_string(), is_tick: true },
    );

    let source = SourceKernel::new("source", |shipper, _ctx| {
        for tweet in TWEETS {
            shipper.push(tweet.to_string())?;
        }
        Ok(())
    })
    .parallelism(cfg.source_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let rolling_counter = FlatMapKernel::new("rolling-counter", {
        let mut window: HashMap<String, u64> = HashMap::new();
        move |topic: Topic, shipper, _ctx| {
            if topic.is_tick {
                for (word, count) in window.drain() {
                    shipper.push(Counts { word, count })?;
                }
            } else {
                *window.entry(topic.word).or_insert(0) += 1;
            }
            Ok(())
        }
    })
    .parallelism(cfg.worker_parallelism)
    .key_by(|topic: &Topic| topic.word.clone());

    let sink = SinkKernel::new("sink", |input: Option<Counts>, _ctx| {
        match input {
            Some(c) => tracing::info!(word = %c.word, count = c.count, "trending"),
            None => tracing::info!("end of stream"),
        }
        Ok(())
    })
    .parallelism(cfg.sink_parallelism);

    let tweet_pipe = graph.add_source(source);
    let hashtag_pipe = tweet_pipe.add_flat_map(extractor);
    let tick_pipe = graph.add_source(timer);
    let merged = Pipe::merge(vec![hashtag_pipe, tick_pipe]);

    // `rolling_counter` is keyed and `merged` carries two upstream lineages,
    // so it can never be the target of a `chain_flat_map`; `--chaining` only
    // toggles the sink edge here.
    let counted_pipe = merged.add_flat_map(rolling_counter);
    if args.chaining {
        counted_pipe.chain_sink(sink);
    } else {
        counted_pipe.add_sink(sink);
    }

    graph.run()
}
