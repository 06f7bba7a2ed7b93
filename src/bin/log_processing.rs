//! HTTP access-log analytics: fans a single log stream out into a
//! per-minute volume counter, a per-status-code counter, and a geo lookup
//! feeding country stats, then merges all three back into one sink
//! (grounded in `lp-log-processing/lp.cpp`, whose source tags every input
//! line three ways before a `split` routes each tag to its own branch).
//! Geo lookup here uses a small built-in IP-prefix table instead of a
//! MaxMind database, per the non-goal on external geo datasets.

use clap::Parser;
use pipeflow::graph::{ExecutionMode, PipeGraph, TimePolicy};
use pipeflow::kernel::{MapKernel, SinkKernel, SourceKernel};
use pipeflow::{config, logging, Pipe};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    Volume,
    Status,
    Geo,
}

#[derive(Debug, Clone)]
struct LogRecord {
    branch: Branch,
    ip: String,
    status: u16,
    minute: u64,
}

const SAMPLE_LOGS: &[(&str, u16, u64)] = &[
    ("10.0.0.1", 200, 0),
    ("172.16.3.9", 404, 0),
    ("192.168.1.5", 200, 1),
    ("10.0.0.1", 500, 1),
    ("8.8.8.8", 200, 2),
    ("172.16.3.9", 200, 2),
];

fn geo_lookup(ip: &str) -> &'static str {
    if ip.starts_with("10.") || ip.starts_with("192.168.") {
        "internal"
    } else if ip.starts_with("172.16.") {
        "corp-vpn"
    } else {
        "internet"
    }
}

#[derive(Debug, Clone)]
enum Stat {
    Volume { minute: u64, count: u64 },
    Status { status: u16, count: u64 },
    Geo { country: &'static str, count: u64 },
}

#[derive(Parser)]
#[command(about = "Splits a log stream into volume/status/geo branches and merges them back")]
struct Args {
    #[arg(long, default_value_t = false)]
    chaining: bool,
    #[arg(long)]
    config: Option<String>,
}

fn main() -> anyhow::Result<()> {
    logging::init_logging();
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => config::DemoConfig::default(),
    };

    let graph = PipeGraph::new("log-processing", ExecutionMode::Default, TimePolicy::IngressTime);

    let source = SourceKernel::new("source", |shipper, _ctx| {
        for (ip, status, minute) in SAMPLE_LOGS {
            for branch in [Branch::Volume, Branch::Status, Branch::Geo] {
                shipper.push(LogRecord {
                    branch,
                    ip: ip.to_string(),
                    status: *status,
                    minute: *minute,
                })?;
            }
        }
        Ok(())
    })
    .parallelism(cfg.source_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let volume_counter = MapKernel::new("volume-counter", {
        let mut counts: HashMap<u64, u64> = HashMap::new();
        move |log: LogRecord, _ctx| {
            let count = counts.entry(log.minute).or_insert(0);
            *count += 1;
            Ok(Stat::Volume { minute: log.minute, count: *count })
        }
    })
    .parallelism(cfg.worker_parallelism)
    .key_by(|log: &LogRecord| log.minute);

    let status_counter = MapKernel::new("status-counter", {
        let mut counts: HashMap<u16, u64> = HashMap::new();
        move |log: LogRecord, _ctx| {
            let count = counts.entry(log.status).or_insert(0);
            *count += 1;
            Ok(Stat::Status { status: log.status, count: *count })
        }
    })
    .parallelism(cfg.worker_parallelism)
    .key_by(|log: &LogRecord| log.status);

    let geo_stats = MapKernel::new("geo-stats", {
        let mut counts: HashMap<&'static str, u64> = HashMap::new();
        move |log: LogRecord, _ctx| {
            let country = geo_lookup(&log.ip);
            let count = counts.entry(country).or_insert(0);
            *count += 1;
            Ok(Stat::Geo { country, count: *count })
        }
    })
    .parallelism(cfg.worker_parallelism)
    .key_by(|log: &LogRecord| geo_lookup(&log.ip));

    let sink = SinkKernel::new("sink", |input: Option<Stat>, _ctx| {
        match input {
            Some(Stat::Volume { minute, count }) => tracing::info!(minute, count, "volume"),
            Some(Stat::Status { status, count }) => tracing::info!(status, count, "status"),
            Some(Stat::Geo { country, count }) => tracing::info!(country, count, "geo"),
            None => tracing::info!("end of stream"),
        }
        Ok(())
    })
    .parallelism(cfg.sink_parallelism);

    let source_pipe = graph.add_source(source);
    let mut split = source_pipe.split("log-branch", 3, |log: &LogRecord| match log.branch {
        Branch::Volume => 0,
        Branch::Status => 1,
        Branch::Geo => 2,
    });

    let volume_pipe = split.select(0).add_map(volume_counter);
    let status_pipe = split.select(1).add_map(status_counter);
    let geo_pipe = split.select(2).add_map(geo_stats);

    let _ = args.chaining; // splitting always introduces a queue; no chain variant applies here.
    Pipe::merge(vec![volume_pipe, status_pipe, geo_pipe]).add_sink(sink);

    graph.run()
}
