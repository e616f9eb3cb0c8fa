//! Trial Executor: one measurement attempt against a prepared rig.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use wsn_bench_abstract::{
    BackgroundProcess, CommandLine, NodeId, ParameterTuple, ProcessExec, TrialConfig, TrialResult,
};

use crate::rig::{RigController, RigError, RigState};
use crate::telemetry::{TelemetryError, parse_trial_log};

/// Tagged outcome of a failed trial.
///
/// Everything except [`TrialFailure::Interrupted`] and [`TrialFailure::Io`]
/// is recoverable by retrying, possibly after escalation.
#[derive(Debug, Error)]
pub enum TrialFailure {
    #[error("provisioning failed: `{command}` {detail}")]
    Provisioning { command: String, detail: String },

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("device {node} unavailable: {detail}")]
    DeviceUnavailable { node: NodeId, detail: String },

    #[error("client failed (status {status:?}, timed out: {timed_out}): {detail}")]
    ClientExecution {
        status: Option<i32>,
        timed_out: bool,
        detail: String,
    },

    #[error("no reply from the far device")]
    NoReply,

    #[error("negative round-trip time: {line}")]
    NegativeRtt { line: String },

    #[error("cannot parse latency from '{line}'")]
    Parse { line: String },

    #[error("telemetry missing for node {node}: {reason}")]
    TelemetryMissing { node: NodeId, reason: String },

    #[error("interrupted by operator")]
    Interrupted,

    #[error("host I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Provisioning,
    NetworkUnreachable,
    DeviceUnavailable,
    ClientExecution,
    NoReply,
    NegativeRtt,
    Parse,
    TelemetryMissing,
    Interrupted,
    Io,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Provisioning => "provisioning",
            FailureKind::NetworkUnreachable => "network-unreachable",
            FailureKind::DeviceUnavailable => "device-unavailable",
            FailureKind::ClientExecution => "client-execution",
            FailureKind::NoReply => "no-reply",
            FailureKind::NegativeRtt => "negative-rtt",
            FailureKind::Parse => "parse",
            FailureKind::TelemetryMissing => "telemetry-missing",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Io => "io",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TrialFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            TrialFailure::Provisioning { .. } => FailureKind::Provisioning,
            TrialFailure::NetworkUnreachable(_) => FailureKind::NetworkUnreachable,
            TrialFailure::DeviceUnavailable { .. } => FailureKind::DeviceUnavailable,
            TrialFailure::ClientExecution { .. } => FailureKind::ClientExecution,
            TrialFailure::NoReply => FailureKind::NoReply,
            TrialFailure::NegativeRtt { .. } => FailureKind::NegativeRtt,
            TrialFailure::Parse { .. } => FailureKind::Parse,
            TrialFailure::TelemetryMissing { .. } => FailureKind::TelemetryMissing,
            TrialFailure::Interrupted => FailureKind::Interrupted,
            TrialFailure::Io(_) => FailureKind::Io,
        }
    }
}

impl From<RigError> for TrialFailure {
    fn from(e: RigError) -> Self {
        match e {
            RigError::Provisioning { command, detail } => {
                TrialFailure::Provisioning { command, detail }
            }
            RigError::NetworkUnreachable { detail } => TrialFailure::NetworkUnreachable(detail),
            RigError::Interrupted => TrialFailure::Interrupted,
        }
    }
}

impl From<TelemetryError> for TrialFailure {
    fn from(e: TelemetryError) -> Self {
        match e {
            TelemetryError::NoReply => TrialFailure::NoReply,
            TelemetryError::NegativeRtt { line } => TrialFailure::NegativeRtt { line },
            TelemetryError::Parse { line } => TrialFailure::Parse { line },
            TelemetryError::Missing { node, reason } => {
                TrialFailure::TelemetryMissing { node, reason }
            }
        }
    }
}

fn device_io(node: NodeId, e: io::Error) -> TrialFailure {
    if e.kind() == io::ErrorKind::Interrupted {
        TrialFailure::Interrupted
    } else {
        TrialFailure::DeviceUnavailable {
            node,
            detail: e.to_string(),
        }
    }
}

/// Running per-node captures. Dropping the session stops every one of them.
struct CaptureSession {
    captures: Vec<(NodeId, Box<dyn BackgroundProcess>)>,
}

impl CaptureSession {
    fn new() -> Self {
        Self {
            captures: Vec::new(),
        }
    }

    fn push(&mut self, node: NodeId, process: Box<dyn BackgroundProcess>) {
        self.captures.push((node, process));
    }

    fn stop(&mut self) {
        for (node, mut capture) in self.captures.drain(..) {
            if let Err(e) = capture.stop() {
                warn!("Failed to stop capture of node {}: {}", node, e);
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct TrialExecutor {
    config: TrialConfig,
}

impl TrialExecutor {
    pub fn new(config: TrialConfig) -> Self {
        Self { config }
    }

    /// Run one measurement of `tuple`.
    ///
    /// Rig preparation failures abort before any device I/O. Captures are
    /// stopped on every exit path once started.
    pub fn run_trial(
        &self,
        exec: &mut dyn ProcessExec,
        rig: &mut RigController,
        state: &mut RigState,
        tuple: &ParameterTuple,
    ) -> Result<TrialResult, TrialFailure> {
        rig.prepare(exec, state, tuple)?;

        info!("Starting execution {}", tuple);

        let mut ports = BTreeMap::new();
        for node in tuple.nodes() {
            let port = rig
                .resolve_serial_port(exec, node)
                .ok_or_else(|| TrialFailure::DeviceUnavailable {
                    node,
                    detail: "not enumerated".to_string(),
                })?;
            ports.insert(node, port);
        }

        for node in tuple.nodes() {
            let log = self.config.capture_log(node);
            match fs::remove_file(&log) {
                Ok(()) => debug!("Removed stale capture {}", log.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(TrialFailure::Io(e)),
            }
        }

        let mut session = CaptureSession::new();
        for (&node, port) in &ports {
            let node_str = node.to_string();
            let command = self
                .config
                .capture
                .render(&[("tty", port.as_str()), ("node", node_str.as_str())])
                .ok_or_else(|| TrialFailure::DeviceUnavailable {
                    node,
                    detail: "empty capture command".to_string(),
                })?;
            debug!("-- Capturing node {} on {}", node, port);
            let log = self.config.capture_log(node);
            let capture = exec
                .spawn(&command, Some(log.as_path()))
                .map_err(|e| device_io(node, e))?;
            session.push(node, capture);
        }
        exec.sleep(self.config.capture_settle());

        for (&node, port) in &ports {
            exec.write_line(port, &self.config.accounting_on)
                .map_err(|e| device_io(node, e))?;
        }

        let client = self.client_command(tuple)?;
        let output = exec
            .run(&client, Some(self.config.client_timeout()))
            .map_err(|e| {
                if e.kind() == io::ErrorKind::Interrupted {
                    TrialFailure::Interrupted
                } else {
                    TrialFailure::ClientExecution {
                        status: None,
                        timed_out: false,
                        detail: format!("cannot run `{client}`: {e}"),
                    }
                }
            })?;

        for (&node, port) in &ports {
            if let Err(e) = exec.write_line(port, &self.config.accounting_off) {
                warn!("Cannot disable accounting on node {}: {}", node, e);
            }
        }
        exec.sleep(self.config.drain_settle());
        session.stop();

        if !output.success() {
            for line in &output.lines {
                debug!("  | {}", line);
            }
            return Err(TrialFailure::ClientExecution {
                status: output.status,
                timed_out: output.timed_out,
                detail: client.to_string(),
            });
        }

        let power_logs = self.read_captures(tuple);
        match parse_trial_log(tuple, &output.lines, &power_logs) {
            Ok(result) => Ok(result),
            Err(TelemetryError::NegativeRtt { line }) => {
                self.record_negative_rtt(&output.lines)?;
                Err(TrialFailure::NegativeRtt { line })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn client_command(
        &self,
        tuple: &ParameterTuple,
    ) -> Result<CommandLine, TrialFailure> {
        let target = tuple.target_node().to_string();
        let hops = tuple.hops.to_string();
        let payload = tuple.payload.to_string();
        let (template, ack, wait) = match tuple.separate {
            Some(sep) => (
                &self.config.client_separate,
                sep.ack.to_string(),
                sep.wait.to_string(),
            ),
            None => (&self.config.client_simple, String::new(), String::new()),
        };
        template
            .render(&[
                ("target", target.as_str()),
                ("hops", hops.as_str()),
                ("payload", payload.as_str()),
                ("ack", ack.as_str()),
                ("wait", wait.as_str()),
                ("rdc", tuple.rdc.as_str()),
            ])
            .ok_or_else(|| TrialFailure::ClientExecution {
                status: None,
                timed_out: false,
                detail: "empty client command".to_string(),
            })
    }

    fn read_captures(&self, tuple: &ParameterTuple) -> BTreeMap<NodeId, Vec<String>> {
        let mut logs = BTreeMap::new();
        for node in tuple.nodes() {
            let path = self.config.capture_log(node);
            match fs::read(&path) {
                Ok(raw) => {
                    let lines = String::from_utf8_lossy(&raw)
                        .lines()
                        .map(str::to_string)
                        .collect();
                    logs.insert(node, lines);
                }
                Err(e) => debug!("Cannot read {}: {}", path.display(), e),
            }
        }
        logs
    }

    fn record_negative_rtt(&self, client_log: &[String]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.negative_rtt_log)?;
        let mut text = client_log.join("\n");
        text.push('\n');
        file.write_all(text.as_bytes())?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rig_errors_keep_their_kind() {
        let failure: TrialFailure = RigError::NetworkUnreachable {
            detail: "ping".into(),
        }
        .into();
        assert_eq!(failure.kind(), FailureKind::NetworkUnreachable);
        let failure: TrialFailure = RigError::Interrupted.into();
        assert_eq!(failure.kind(), FailureKind::Interrupted);
    }

    #[test]
    fn telemetry_errors_keep_their_kind() {
        let failure: TrialFailure = TelemetryError::Missing {
            node: 3,
            reason: "no capture log".into(),
        }
        .into();
        assert_eq!(failure.kind(), FailureKind::TelemetryMissing);
        assert_eq!(failure.kind().to_string(), "telemetry-missing");
    }

    #[test]
    fn interrupted_device_io_is_not_a_device_fault() {
        let e = io::Error::new(io::ErrorKind::Interrupted, "stop");
        assert_eq!(device_io(2, e).kind(), FailureKind::Interrupted);
        let e = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(device_io(2, e).kind(), FailureKind::DeviceUnavailable);
    }
}
