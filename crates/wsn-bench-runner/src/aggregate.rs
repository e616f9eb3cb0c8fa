//! Per-tuple summary statistics over persisted samples.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use wsn_bench_abstract::{NodeId, ParameterTuple, TrialResult};
use wsn_bench_stats::{EmptyInputError, EnergyModel, SummaryStat, duty_cycle, summarize};

use crate::store::{ResultStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateOptions {
    /// Simple-mode samples slower than this are dropped as outliers.
    pub max_latency_ms: Option<u64>,
    /// Separate-mode bound is `wait * separate_wait_unit_ms + separate_slack_ms`.
    pub separate_wait_unit_ms: u64,
    pub separate_slack_ms: u64,
    pub energy: EnergyModel,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            max_latency_ms: Some(15_000),
            separate_wait_unit_ms: 100,
            separate_slack_ms: 800,
            energy: EnergyModel::default(),
        }
    }
}

impl AggregateOptions {
    pub fn latency_bound(&self, tuple: &ParameterTuple) -> Option<u64> {
        match tuple.separate {
            Some(sep) => Some(u64::from(sep.wait) * self.separate_wait_unit_ms + self.separate_slack_ms),
            None => self.max_latency_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub energy: SummaryStat,
    /// Absent when no sample of the node reported on-time.
    pub duty_cycle: Option<SummaryStat>,
    pub average_power: Option<SummaryStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TupleSummary {
    pub tuple: ParameterTuple,
    /// Samples kept after the latency bound.
    pub samples: usize,
    pub rejected: usize,
    pub latency: SummaryStat,
    pub nodes: BTreeMap<NodeId, NodeSummary>,
}

/// Summarize the samples of one tuple.
///
/// Fails with [`EmptyInputError`] when no sample survives the latency bound.
pub fn summarize_results(
    tuple: &ParameterTuple,
    results: &[TrialResult],
    options: &AggregateOptions,
) -> Result<TupleSummary, EmptyInputError> {
    let bound = options.latency_bound(tuple);
    let (kept, rejected): (Vec<&TrialResult>, Vec<&TrialResult>) = results
        .iter()
        .partition(|r| bound.is_none_or(|max| r.latency_ms <= max));
    if !rejected.is_empty() {
        debug!("{}: {} sample(s) over {:?} ms rejected", tuple, rejected.len(), bound);
    }

    let latencies: Vec<f64> = kept.iter().map(|r| r.latency_ms as f64).collect();
    let latency = summarize(&latencies)?;

    let mut nodes = BTreeMap::new();
    for node in tuple.nodes() {
        let counters: Vec<_> = kept.iter().filter_map(|r| r.power.get(&node)).collect();
        let energies: Vec<f64> = counters.iter().map(|c| options.energy.energy(c)).collect();
        let Ok(energy) = summarize(&energies) else {
            continue;
        };
        let duty: Vec<f64> = counters.iter().filter_map(|c| duty_cycle(c)).collect();
        let power: Vec<f64> = counters
            .iter()
            .filter_map(|c| options.energy.average_power(c))
            .collect();
        nodes.insert(
            node,
            NodeSummary {
                energy,
                duty_cycle: summarize(&duty).ok(),
                average_power: summarize(&power).ok(),
            },
        );
    }

    Ok(TupleSummary {
        tuple: *tuple,
        samples: kept.len(),
        rejected: rejected.len(),
        latency,
        nodes,
    })
}

/// Summaries for every tuple in `store` that has at least one usable sample.
pub fn aggregate(
    store: &ResultStore,
    options: &AggregateOptions,
) -> Result<BTreeMap<ParameterTuple, TupleSummary>, StoreError> {
    let mut by_tuple: BTreeMap<ParameterTuple, Vec<TrialResult>> = BTreeMap::new();
    for (tuple, path) in store.tuples()? {
        let results = ResultStore::load_file(&path)?;
        by_tuple.entry(tuple).or_default().extend(results);
    }

    let mut summaries = BTreeMap::new();
    for (tuple, results) in by_tuple {
        match summarize_results(&tuple, &results, options) {
            Ok(summary) => {
                summaries.insert(tuple, summary);
            }
            Err(EmptyInputError) => debug!("{}: not enough data yet", tuple),
        }
    }
    info!("Aggregated {} tuple(s) from {}", summaries.len(), store.dir().display());
    Ok(summaries)
}
