//! Configuration loading for the benchmark binaries under `src/bin/`.
//!
//! The framework itself (`graph`, `kernel`, `transport`) takes every tuning
//! knob through its builder API and has no configuration format of its own.
//! This module is purely for the demo binaries, which all want the same
//! small set of knobs — parallelism per stage, a source rate, batch sizes —
//! loadable from a TOML file instead of hardcoded.

use serde::Deserialize;
use std::path::Path;

/// Per-binary tuning knobs, loaded from a TOML file (or defaulted).
///
/// ```toml
/// source_parallelism = 2
/// worker_parallelism = 4
/// sink_parallelism = 1
/// tuples_per_second = 1000.0
/// output_batch_size = 0
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub source_parallelism: usize,
    pub worker_parallelism: usize,
    pub sink_parallelism: usize,
    pub tuples_per_second: f64,
    pub output_batch_size: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            source_parallelism: 1,
            worker_parallelism: 1,
            sink_parallelism: 1,
            tuples_per_second: 10_000.0,
            output_batch_size: 0,
        }
    }
}

/// Loads a [`DemoConfig`] from a TOML file at `path`.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<DemoConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|source| anyhow::anyhow!("failed to read config file {}: {source}", path.display()))?;
    load_config_from_str(&raw)
}

/// Parses a [`DemoConfig`] from an in-memory TOML string, used by tests and
/// by `load_config` itself.
pub fn load_config_from_str(raw: &str) -> anyhow::Result<DemoConfig> {
    toml::from_str(raw).map_err(|source| anyhow::anyhow!("invalid config: {source}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.source_parallelism, 1);
        assert_eq!(config.sink_parallelism, 1);
    }

    #[test]
    fn overrides_individual_fields() {
        let config = load_config_from_str("worker_parallelism = 8\ntuples_per_second = 500.0\n").unwrap();
        assert_eq!(config.worker_parallelism, 8);
        assert_eq!(config.source_parallelism, 1);
        assert_eq!(config.tuples_per_second, 500.0);
    }
}
