//! An epsilon-greedy multi-armed-bandit learner over click-through events
//! and their rewards, grounded in `rl-reinforcement-learner/rl.cpp`'s
//! `CTRGeneratorFunctor`/`RewardSourceFunctor`/`InputTuple` pipeline: two
//! independently-paced sources are `merge`d into one tagged stream feeding a
//! single stateful learner stage.

use clap::Parser;
use pipeflow::graph::{ExecutionMode, PipeGraph, TimePolicy};
use pipeflow::kernel::{MapKernel, SinkKernel, SourceKernel};
use pipeflow::time::RatePacer;
use pipeflow::{config, logging, Pipe};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

const ACTIONS: &[&str] = &["page1", "page2", "page3"];

#[derive(Debug, Clone)]
enum InputEvent {
    Event { session_id: String },
    Reward { session_id: String, action: String, reward: f64 },
}

#[derive(Debug, Clone)]
struct Recommendation {
    session_id: String,
    action: String,
}

struct ActionValue {
    estimate: f64,
    visits: u64,
}

impl ActionValue {
    fn new() -> Self {
        Self { estimate: 0.0, visits: 0 }
    }

    fn update(&mut self, reward: f64) {
        self.visits += 1;
        self.estimate += (reward - self.estimate) / self.visits as f64;
    }
}

struct Bandit {
    values: HashMap<String, ActionValue>,
    epsilon: f64,
}

impl Bandit {
    fn new(epsilon: f64) -> Self {
        let values = ACTIONS.iter().map(|a| (a.to_string(), ActionValue::new())).collect();
        Self { values, epsilon }
    }

    fn choose(&self, rng: &mut impl Rng) -> String {
        if rng.random::<f64>() < self.epsilon {
            ACTIONS.choose(rng).unwrap().to_string()
        } else {
            self.values
                .iter()
                .max_by(|a, b| a.1.estimate.partial_cmp(&b.1.estimate).unwrap())
                .map(|(action, _)| action.clone())
                .unwrap_or_else(|| ACTIONS[0].to_string())
        }
    }

    fn reward(&mut self, action: &str, value: f64) {
        if let Some(entry) = self.values.get_mut(action) {
            entry.update(value);
        }
    }
}

#[derive(Parser)]
#[command(about = "Learns per-session action recommendations from an event/reward stream")]
struct Args {
    #[arg(long, default_value_t = false)]
    chaining: bool,
    #[arg(long)]
    config: Option<String>,
    #[arg(long, default_value_t = 80)]
    events: usize,
    #[arg(long, default_value_t = 0.1)]
    epsilon: f64,
}

fn main() -> anyhow::Result<()> {
    logging::init_logging();
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => config::DemoConfig::default(),
    };

    let graph = PipeGraph::new("rl-reinforcement-learner", ExecutionMode::Default, TimePolicy::IngressTime);

    let events = args.events;
    let tuples_per_second = cfg.tuples_per_second;
    let event_source = SourceKernel::new("ctr-generator", move |shipper, _ctx| {
        let mut pacer = RatePacer::new(tuples_per_second);
        for i in 0..events {
            shipper.push(InputEvent::Event { session_id: format!("session-{}", i % 10) })?;
            pacer.pace();
        }
        Ok(())
    })
    .parallelism(cfg.source_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let events_for_reward = args.events;
    let reward_source = SourceKernel::new("reward-source", move |shipper, _ctx| {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pacer = RatePacer::new(tuples_per_second);
        for i in 0..events_for_reward {
            let session_id = format!("session-{}", i % 10);
            let action = ACTIONS.choose(&mut rng).unwrap().to_string();
            let reward = if rng.random::<f64>() < 0.3 { 1.0 } else { 0.0 };
            shipper.push(InputEvent::Reward { session_id, action, reward })?;
            pacer.pace();
        }
        Ok(())
    })
    .parallelism(cfg.source_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let epsilon = args.epsilon;
    let learner = MapKernel::new("reinforcement-learner", {
        let mut bandits: HashMap<String, Bandit> = HashMap::new();
        let mut rng = StdRng::seed_from_u64(99);
        move |event: InputEvent, _ctx| match event {
            InputEvent::Event { session_id } => {
                let bandit = bandits.entry(session_id.clone()).or_insert_with(|| Bandit::new(epsilon));
                let action = bandit.choose(&mut rng);
                Ok(Recommendation { session_id, action })
            }
            InputEvent::Reward { session_id, action, reward } => {
                let bandit = bandits.entry(session_id.clone()).or_insert_with(|| Bandit::new(epsilon));
                bandit.reward(&action, reward);
                Ok(Recommendation { session_id, action })
            }
        }
    })
    .parallelism(cfg.worker_parallelism)
    .key_by(|event: &InputEvent| match event {
        InputEvent::Event { session_id } => session_id.clone(),
        InputEvent::Reward { session_id, .. } => session_id.clone(),
    });

    let sink = SinkKernel::new("sink", |input: Option<Recommendation>, _ctx| {
        match input {
            Some(r) => tracing::info!(session_id = %r.session_id, action = %r.action, "recommendation"),
            None => tracing::info!("end of stream"),
        }
        Ok(())
    })
    .parallelism(cfg.sink_parallelism);

    let event_pipe = graph.add_source(event_source);
    let reward_pipe = graph.add_source(reward_source);
    let merged = Pipe::merge(vec![event_pipe, reward_pipe]);

    // `learner` is keyed and `merged` carries two upstream lineages, so it can
    // never be the target of a `chain_map`; `--chaining` only toggles the
    // sink edge here.
    let learner_pipe = merged.add_map(learner);
    if args.chaining {
        learner_pipe.chain_sink(sink);
    } else {
        learner_pipe.add_sink(sink);
    }

    graph.run()
}
