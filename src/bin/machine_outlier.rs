//! Detects machines whose CPU/memory usage deviates sharply from their own
//! rolling average, grounded in `mo-machine-outlier/mo.cpp`'s observer/
//! scorer/alert pipeline (simplified here to a single keyed z-score `Map`
//! followed by a `Filter` on the anomaly threshold, rather than the
//! original's separate sliding-window and BFPRT-median ranking stages).

use clap::Parser;
use pipeflow::graph::{ExecutionMode, PipeGraph, TimePolicy};
use pipeflow::kernel::{FilterKernel, MapKernel, SinkKernel, SourceKernel};
use pipeflow::time::RatePacer;
use pipeflow::{config, logging};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Reading {
    machine_id: String,
    cpu_usage: f64,
    memory_usage: f64,
}

#[derive(Debug, Clone)]
struct ScoredReading {
    machine_id: String,
    cpu_usage: f64,
    memory_usage: f64,
    anomaly_score: f64,
}

struct RollingStats {
    mean: f64,
    variance: f64,
    count: u64,
}

impl RollingStats {
    fn new() -> Self {
        Self { mean: 0.0, variance: 1.0, count: 0 }
    }

    /// Welford's online update, folding `sample` into the running mean and
    /// variance before scoring it against the pre-update distribution.
    fn score_then_update(&mut self, sample: f64) -> f64 {
        let z = if self.count < 2 {
            0.0
        } else {
            (sample - self.mean) / self.variance.sqrt().max(1e-6)
        };
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = sample - self.mean;
        if self.count > 1 {
            self.variance = ((self.count - 1) as f64 * self.variance + delta * delta2) / self.count as f64;
        }
        z.abs()
    }
}

#[derive(Parser)]
#[command(about = "Flags machine readings whose CPU/memory usage is an outlier for that machine")]
struct Args {
    #[arg(long, default_value_t = false)]
    chaining: bool,
    #[arg(long)]
    config: Option<String>,
    /// How many synthetic readings to emit before shutting the source down.
    #[arg(long, default_value_t = 200)]
    readings: usize,
    /// Z-score magnitude above which a reading is flagged as abnormal.
    #[arg(long, default_value_t = 2.5)]
    threshold: f64,
}

fn main() -> anyhow::Result<()> {
    logging::init_logging();
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => config::DemoConfig::default(),
    };

    let graph = PipeGraph::new("machine-outlier", ExecutionMode::Default, TimePolicy::IngressTime);

    let readings = args.readings;
    let tuples_per_second = cfg.tuples_per_second;
    let source = SourceKernel::new("source", move |shipper, _ctx| {
        let machines = ["machine-a", "machine-b", "machine-c"];
        let mut rng = StdRng::seed_from_u64(42);
        let baseline = Normal::new(40.0, 5.0)?;
        let spike = Normal::new(95.0, 3.0)?;
        let mut pacer = RatePacer::new(tuples_per_second);
        for i in 0..readings {
            let machine_id = machines[i % machines.len()].to_string();
            let is_spike = i % 37 == 0 && i > 0;
            let dist = if is_spike { &spike } else { &baseline };
            shipper.push(Reading {
                machine_id,
                cpu_usage: dist.sample(&mut rng).clamp(0.0, 100.0),
                memory_usage: dist.sample(&mut rng).clamp(0.0, 100.0),
            })?;
            pacer.pace();
        }
        Ok(())
    })
    .parallelism(cfg.source_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let scorer = MapKernel::new("scorer", {
        let mut per_machine: HashMap<String, (RollingStats, RollingStats)> = HashMap::new();
        move |reading: Reading, _ctx| {
            let (cpu_stats, mem_stats) = per_machine
                .entry(reading.machine_id.clone())
                .or_insert_with(|| (RollingStats::new(), RollingStats::new()));
            let cpu_z = cpu_stats.score_then_update(reading.cpu_usage);
            let mem_z = mem_stats.score_then_update(reading.memory_usage);
            Ok(ScoredReading {
                machine_id: reading.machine_id,
                cpu_usage: reading.cpu_usage,
                memory_usage: reading.memory_usage,
                anomaly_score: cpu_z.max(mem_z),
            })
        }
    })
    .parallelism(cfg.worker_parallelism)
    .key_by(|reading: &Reading| reading.machine_id.clone());

    let threshold = args.threshold;
    let alert_filter = FilterKernel::new("alert-filter", move |scored: &ScoredReading, _ctx| {
        Ok(scored.anomaly_score >= threshold)
    })
    .parallelism(cfg.worker_parallelism);

    let sink = SinkKernel::new("sink", |input: Option<ScoredReading>, _ctx| {
        match input {
            Some(alert) => tracing::warn!(
                machine_id = %alert.machine_id,
                cpu_usage = alert.cpu_usage,
                memory_usage = alert.memory_usage,
                anomaly_score = alert.anomaly_score,
                "anomalous reading"
            ),
            None => tracing::info!("end of stream"),
        }
        Ok(())
    })
    .parallelism(cfg.sink_parallelism);

    let source_pipe = graph.add_source(source);
    if args.chaining {
        source_pipe
            .add_map(scorer)
            .chain_filter(alert_filter)
            .chain_sink(sink);
    } else {
        source_pipe.add_map(scorer).add_filter(alert_filter).add_sink(sink);
    }

    graph.run()
}
