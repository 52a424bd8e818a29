//! Ordering strategies for the published queue.
//!
//! The master turns the caller's unit list into a [`QueuePlan`]: the ids
//! in consumption order plus, for the bin-packing strategy, the chunk
//! records and their dynamic timeouts. Given the same unit list, seed,
//! strategy, and timing data the plan is deterministic, so a takeover
//! master publishes the same queue the deposed one would have.

use std::collections::HashMap;
use std::str::FromStr;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::backend::QueuePlan;
use crate::config::Config;
use crate::executable::{Chunk, Unit};
use crate::timing::TimingOracle;

/// Queue ordering choice, selectable per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Sort by id, then seeded shuffle.
    #[default]
    Random,
    /// Longest estimated duration first.
    Timing,
    /// Group per suite into duration-budgeted chunks.
    SuiteBinPacking,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::Timing => "timing",
            Strategy::SuiteBinPacking => "suite-bin-packing",
        }
    }
}

impl FromStr for Strategy {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "random" => Ok(Strategy::Random),
            "timing" => Ok(Strategy::Timing),
            "suite-bin-packing" => Ok(Strategy::SuiteBinPacking),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the publish plan for the configured strategy.
pub fn build_plan(units: &[Unit], config: &Config, oracle: &TimingOracle) -> QueuePlan {
    match config.strategy {
        Strategy::Random => random_plan(units, config.seed),
        Strategy::Timing => timing_plan(units, oracle),
        Strategy::SuiteBinPacking => bin_packing_plan(units, config, oracle),
    }
}

fn random_plan(units: &[Unit], seed: u64) -> QueuePlan {
    let mut ids: Vec<String> = units.iter().map(|unit| unit.id.clone()).collect();
    ids.sort();
    let mut rng = StdRng::seed_from_u64(seed);
    ids.shuffle(&mut rng);
    QueuePlan {
        ids,
        ..QueuePlan::default()
    }
}

fn timing_plan(units: &[Unit], oracle: &TimingOracle) -> QueuePlan {
    let mut ids: Vec<String> = units.iter().map(|unit| unit.id.clone()).collect();
    ids.sort_by(|a, b| {
        oracle
            .duration_ms(b)
            .total_cmp(&oracle.duration_ms(a))
            .then_with(|| a.cmp(b))
    });
    QueuePlan {
        ids,
        ..QueuePlan::default()
    }
}

/// Per-chunk duration budget in milliseconds, before the buffer.
///
/// With a parallelism hint of `P` jobs the budget is the total estimated
/// duration divided by `P`, clamped to the configured bounds; without a
/// hint it stays at the lower bound.
pub fn chunk_budget_ms(total_estimated_ms: f64, config: &Config) -> f64 {
    match config.parallel_job_count {
        Some(parallel) if parallel > 0 => {
            let base = total_estimated_ms / f64::from(parallel);
            base.clamp(
                config.minimum_max_chunk_duration,
                config.maximum_max_chunk_duration,
            )
        }
        _ => config.minimum_max_chunk_duration,
    }
}

fn bin_packing_plan(units: &[Unit], config: &Config, oracle: &TimingOracle) -> QueuePlan {
    // Group by suite, preserving per-suite original order.
    let mut suites: Vec<(String, Vec<&Unit>)> = Vec::new();
    let mut suite_index: HashMap<String, usize> = HashMap::new();
    for unit in units {
        let suite = unit.suite().to_string();
        match suite_index.get(&suite) {
            Some(&index) => suites[index].1.push(unit),
            None => {
                suite_index.insert(suite.clone(), suites.len());
                suites.push((suite, vec![unit]));
            }
        }
    }

    let total_estimated: f64 = units.iter().map(|unit| oracle.duration_ms(&unit.id)).sum();
    let max_duration = chunk_budget_ms(total_estimated, config);
    let effective_max = max_duration * (1.0 - config.buffer_percent / 100.0);

    let mut chunks: Vec<(String, Chunk)> = Vec::new();
    for (suite, members) in &suites {
        let mut index = 0;
        let mut current_ids: Vec<String> = Vec::new();
        let mut current_duration = 0.0;
        for unit in members {
            let duration = oracle.duration_ms(&unit.id);
            if !current_ids.is_empty() && current_duration + duration > effective_max {
                chunks.push((
                    Chunk::id_for(suite, index),
                    Chunk::new(suite.clone(), std::mem::take(&mut current_ids), current_duration),
                ));
                index += 1;
                current_duration = 0.0;
            }
            current_ids.push(unit.id.clone());
            current_duration += duration;
        }
        if !current_ids.is_empty() {
            chunks.push((
                Chunk::id_for(suite, index),
                Chunk::new(suite.clone(), current_ids, current_duration),
            ));
        }
    }

    chunks.sort_by(|a, b| {
        b.1.estimated_duration
            .total_cmp(&a.1.estimated_duration)
            .then_with(|| a.0.cmp(&b.0))
    });

    let ids = chunks.iter().map(|(id, _)| id.clone()).collect();
    let group_timeouts = chunks
        .iter()
        .map(|(id, chunk)| {
            let timeout_secs =
                chunk.estimated_duration / 1000.0 * (1.0 + config.buffer_percent / 100.0);
            (id.clone(), timeout_secs)
        })
        .collect();

    QueuePlan {
        ids,
        chunks,
        group_timeouts,
    }
}
