use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

/// Device number of a participating hop (the border router is device 1).
pub type NodeId = u32;

/// Per-interval energy-accounting counters reported by one node, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PowerCounters {
    pub cpu: u64,
    pub lpm: u64,
    pub transmit: u64,
    pub listen: u64,
    pub idle_transmit: u64,
    pub idle_listen: u64,
}

impl PowerCounters {
    pub fn as_array(&self) -> [u64; 6] {
        [
            self.cpu,
            self.lpm,
            self.transmit,
            self.listen,
            self.idle_transmit,
            self.idle_listen,
        ]
    }

    pub fn from_array(values: [u64; 6]) -> Self {
        let [cpu, lpm, transmit, listen, idle_transmit, idle_listen] = values;
        Self {
            cpu,
            lpm,
            transmit,
            listen,
            idle_transmit,
            idle_listen,
        }
    }

    /// Ticks the node was powered (active plus low-power mode).
    pub fn on_time(&self) -> u64 {
        self.cpu + self.lpm
    }
}

/// One successful measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialResult {
    pub latency_ms: u64,
    /// Counters keyed by node, iterated nearest hop first.
    pub power: BTreeMap<NodeId, PowerCounters>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleLineError {
    #[error("empty result line")]
    Empty,

    #[error("invalid latency field '{0}'")]
    Latency(String),

    #[error("expected node tag like '(#2)', got '{0}'")]
    NodeTag(String),

    #[error("node {node} has {found} counters, expected 6")]
    Truncated { node: NodeId, found: usize },

    #[error("invalid counter '{value}' for node {node}")]
    Counter { node: NodeId, value: String },
}

impl TrialResult {
    /// Serialize as one newline-terminated result line:
    /// `<latency>\t(#<node>)\t<cpu>\t<lpm>\t<tx>\t<listen>\t<itx>\t<ilisten>\t...`
    pub fn to_line(&self) -> String {
        let mut line = format!("{}\t", self.latency_ms);
        for (node, counters) in &self.power {
            let _ = write!(line, "(#{node})\t");
            for value in counters.as_array() {
                let _ = write!(line, "{value}\t");
            }
        }
        line.push('\n');
        line
    }

    /// Parse a line previously produced by [`TrialResult::to_line`].
    pub fn from_line(line: &str) -> Result<Self, SampleLineError> {
        let mut fields = line.split_whitespace();
        let latency_field = fields.next().ok_or(SampleLineError::Empty)?;
        let latency_ms = latency_field
            .parse()
            .map_err(|_| SampleLineError::Latency(latency_field.to_string()))?;

        let mut power = BTreeMap::new();
        while let Some(tag) = fields.next() {
            let node: NodeId = tag
                .strip_prefix("(#")
                .and_then(|t| t.strip_suffix(')'))
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| SampleLineError::NodeTag(tag.to_string()))?;

            let mut values = [0u64; 6];
            for (idx, slot) in values.iter_mut().enumerate() {
                let raw = fields
                    .next()
                    .ok_or(SampleLineError::Truncated { node, found: idx })?;
                *slot = raw.parse().map_err(|_| SampleLineError::Counter {
                    node,
                    value: raw.to_string(),
                })?;
            }
            power.insert(node, PowerCounters::from_array(values));
        }

        Ok(Self { latency_ms, power })
    }

    /// True when the result carries counters for exactly the given nodes.
    pub fn covers(&self, nodes: impl IntoIterator<Item = NodeId>) -> bool {
        let expected: Vec<NodeId> = nodes.into_iter().collect();
        expected.len() == self.power.len() && expected.iter().all(|n| self.power.contains_key(n))
    }
}
