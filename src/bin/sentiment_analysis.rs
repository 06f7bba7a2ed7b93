//! Scores tweets against a small built-in AFINN-style lexicon, grounded in
//! `sa-sentiment-analysis/sa.cpp`'s `SourceFunctor`/`BasicClassifier`/
//! `SinkFunctor` pipeline (a lexicon file and JSON dataset there, a
//! hardcoded word-score table and tweet list here).

use clap::Parser;
use pipeflow::graph::{ExecutionMode, PipeGraph, TimePolicy};
use pipeflow::kernel::{MapKernel, SinkKernel, SourceKernel};
use pipeflow::{config, logging};

const TWEETS: &[&str] = &[
    "I absolutely love this new release, it is wonderful",
    "This is the worst bug I have ever seen, terrible experience",
    "The weather today is cloudy with a chance of rain",
    "Great job team, amazing work on this awesome feature",
    "I am so disappointed and angry about the broken update",
    "The meeting is scheduled for three o'clock tomorrow",
];

const LEXICON: &[(&str, i32)] = &[
    ("love", 3),
    ("wonderful", 4),
    ("worst", -3),
    ("terrible", -3),
    ("bad", -3),
    ("great", 3),
    ("amazing", 4),
    ("awesome", 4),
    ("disappointed", -2),
    ("angry", -3),
    ("broken", -2),
    ("good", 3),
    ("happy", 3),
    ("sad", -2),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

fn score_to_sentiment(score: i32) -> Sentiment {
    if score > 0 {
        Sentiment::Positive
    } else if score < 0 {
        Sentiment::Negative
    } else {
        Sentiment::Neutral
    }
}

fn strip_punctuation(word: &str) -> String {
    word.chars().filter(|c| c.is_alphanumeric() || *c == '\'').collect()
}

fn classify(tweet: &str, lexicon: &std::collections::HashMap<String, i32>) -> (Sentiment, i32) {
    let score: i32 = tweet
        .split_whitespace()
        .map(|word| strip_punctuation(&word.to_lowercase()))
        .filter_map(|word| lexicon.get(&word).copied())
        .sum();
    (score_to_sentiment(score), score)
}

#[derive(Debug, Clone)]
struct Tweet {
    text: String,
}

#[derive(Debug, Clone)]
struct Classified {
    text: String,
    sentiment: Sentiment,
    score: i32,
}

#[derive(Parser)]
#[command(about = "Classifies tweets as positive/negative/neutral against a built-in lexicon")]
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

    let graph = PipeGraph::new("sa-sentiment-analysis", ExecutionMode::Default, TimePolicy::IngressTime);

    let source = SourceKernel::new("source", |shipper, _ctx| {
        for tweet in TWEETS {
            shipper.push(Tweet { text: tweet.to_string() })?;
        }
        Ok(())
    })
    .parallelism(cfg.source_parallelism)
    .output_batch_size(cfg.output_batch_size);

    let classifier = MapKernel::new("classifier", {
        let lexicon: std::collections::HashMap<String, i32> =
            LEXICON.iter().map(|(word, score)| (word.to_string(), *score)).collect();
        move |tweet: Tweet, _ctx| {
            let (sentiment, score) = classify(&tweet.text, &lexicon);
            Ok(Classified { text: tweet.text, sentiment, score })
        }
    })
    .parallelism(cfg.worker_parallelism);

    let sink = SinkKernel::new("sink", |input: Option<Classified>, _ctx| {
        match input {
            Some(c) => tracing::info!(text = %c.text, score = c.score, sentiment = ?c.sentiment, "classified tweet"),
            None => tracing::info!("end of stream"),
        }
        Ok(())
    })
    .parallelism(cfg.sink_parallelism);

    let source_pipe = graph.add_source(source);
    if args.chaining {
        source_pipe.chain_map(classifier).chain_sink(sink);
    } else {
        source_pipe.add_map(classifier).add_sink(sink);
    }

    graph.run()
}
