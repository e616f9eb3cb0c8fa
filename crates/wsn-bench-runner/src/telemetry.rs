//! Extraction of latency and per-node energy counters from raw logs.
//!
//! Client log: the round-trip line is the last line (simple mode) or the
//! second-to-last line (separate mode); the latency is the integer after its
//! final colon.
//!
//! Node capture log: the energy-accounting record is the third-from-last line.
//! Everything from the first `(` on is dropped, and the remaining whitespace
//! fields are, in order:
//!
//! ```text
//! start clock_time P address seqno
//! all_cpu all_lpm all_transmit all_listen all_idle_transmit all_idle_listen
//! cpu lpm transmit listen idle_transmit idle_listen
//! ```
//!
//! Only the last six (per-interval) counters are kept.

use std::collections::BTreeMap;
use thiserror::Error;
use wsn_bench_abstract::{ClientMode, NodeId, ParameterTuple, PowerCounters, TrialResult};

const ROUND_TRIP_MARKER: &str = "round trip";
const POWER_RECORD_FIELDS: usize = 17;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("no round-trip line in client output")]
    NoReply,

    #[error("negative round-trip time: {line}")]
    NegativeRtt { line: String },

    #[error("cannot parse latency from '{line}'")]
    Parse { line: String },

    #[error("telemetry missing for node {node}: {reason}")]
    Missing { node: NodeId, reason: String },
}

fn latency_line(client_log: &[String], mode: ClientMode) -> Option<&str> {
    let from_end = match mode {
        ClientMode::Simple => 1,
        ClientMode::Separate => 2,
    };
    let idx = client_log.len().checked_sub(from_end)?;
    client_log.get(idx).map(String::as_str)
}

/// Round-trip latency in milliseconds reported by the protocol client.
pub fn parse_latency(client_log: &[String], mode: ClientMode) -> Result<u64, TelemetryError> {
    let line = latency_line(client_log, mode).ok_or(TelemetryError::NoReply)?;
    if !line.to_ascii_lowercase().contains(ROUND_TRIP_MARKER) {
        return Err(TelemetryError::NoReply);
    }
    if line.contains('-') {
        return Err(TelemetryError::NegativeRtt {
            line: line.trim_end().to_string(),
        });
    }
    line.rsplit_once(':')
        .and_then(|(_, value)| value.trim().parse().ok())
        .ok_or_else(|| TelemetryError::Parse {
            line: line.trim_end().to_string(),
        })
}

/// Per-interval counters from one node's capture log.
pub fn parse_power_record(lines: &[String]) -> Result<PowerCounters, String> {
    let idx = lines
        .len()
        .checked_sub(3)
        .ok_or_else(|| format!("capture has only {} line(s)", lines.len()))?;
    let record = lines[idx].split('(').next().unwrap_or_default();
    let fields: Vec<&str> = record.split_whitespace().collect();
    if fields.len() != POWER_RECORD_FIELDS {
        return Err(format!(
            "energy record has {} fields, expected {}: '{}'",
            fields.len(),
            POWER_RECORD_FIELDS,
            record.trim()
        ));
    }

    let mut values = [0u64; 6];
    for (slot, raw) in values.iter_mut().zip(&fields[POWER_RECORD_FIELDS - 6..]) {
        *slot = raw
            .parse()
            .map_err(|_| format!("invalid counter '{raw}' in energy record"))?;
    }
    Ok(PowerCounters::from_array(values))
}

/// Build a [`TrialResult`] from the client log and every hop's capture log.
///
/// All-or-nothing: a missing or malformed capture for any participating node
/// fails the whole trial.
pub fn parse_trial_log(
    tuple: &ParameterTuple,
    client_log: &[String],
    power_logs: &BTreeMap<NodeId, Vec<String>>,
) -> Result<TrialResult, TelemetryError> {
    let latency_ms = parse_latency(client_log, tuple.mode())?;

    let mut power = BTreeMap::new();
    for node in tuple.nodes() {
        let lines = power_logs.get(&node).ok_or_else(|| TelemetryError::Missing {
            node,
            reason: "no capture log".to_string(),
        })?;
        let counters =
            parse_power_record(lines).map_err(|reason| TelemetryError::Missing { node, reason })?;
        power.insert(node, counters);
    }

    Ok(TrialResult { latency_ms, power })
}
