//! Scripted stand-in for the device toolchain and protocol client.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use wsn_bench_abstract::{
    BackgroundProcess, CommandLine, CommandTemplate, EscalationPolicy, ProcessExec, ProcessOutput,
    RigConfig, TrialConfig,
};
use wsn_bench_runner::{CampaignRunner, ResultStore, RigController, TrialExecutor};

pub type Events = Rc<RefCell<Vec<String>>>;

pub const DEVICES: u32 = 5;

pub fn capture_fixture(cpu: u64) -> String {
    format!(
        "Contiki 2.5 started\n\
         powertrace on\n\
         2301 36029 P 0.18 12 2310478 23424524 98712 456871 0 1201 {cpu} 32446 165 1452 0 12 (radio 1.53% / 1.53%)\n\
         36029 I 0.18 12 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0\n\
         powertrace off\n"
    )
}

fn motelist() -> Vec<String> {
    let mut lines = vec![
        "Reference  Device           Description".to_string(),
        "---------- ---------------- -----------".to_string(),
    ];
    for device in 1..=DEVICES {
        lines.push(format!("REF{device}     /dev/ttyUSB{}     Moteiv tmote sky", device - 1));
    }
    lines
}

#[derive(Debug, Clone)]
pub struct ClientReply {
    pub status: Option<i32>,
    pub lines: Vec<String>,
    pub timed_out: bool,
}

impl ClientReply {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            status: Some(0),
            lines: vec![
                "Sending request".to_string(),
                format!("Round Trip Time: {latency_ms}"),
            ],
            timed_out: false,
        }
    }

    pub fn no_reply() -> Self {
        Self {
            status: Some(0),
            lines: vec!["Sending request".to_string(), "Request timed out".to_string()],
            timed_out: false,
        }
    }

    pub fn negative() -> Self {
        Self {
            status: Some(0),
            lines: vec!["Sending request".to_string(), "Round Trip Time: -7".to_string()],
            timed_out: false,
        }
    }

    pub fn crashed() -> Self {
        Self {
            status: Some(1),
            lines: vec!["Exception in thread main".to_string()],
            timed_out: false,
        }
    }
}

struct FakeProcess {
    label: String,
    events: Events,
    stopped: bool,
}

impl BackgroundProcess for FakeProcess {
    fn stop(&mut self) -> io::Result<()> {
        if !self.stopped {
            self.stopped = true;
            self.events.borrow_mut().push(format!("stop {}", self.label));
        }
        Ok(())
    }
}

/// Every command is recorded in `events` as `run <cmd>`, `spawn <cmd>`,
/// `write <port> <line>` or `stop <cmd>`.
pub struct FakeExec {
    pub events: Events,
    pub replies: VecDeque<ClientReply>,
    /// Number of upcoming build commands that fail.
    pub failing_builds: u32,
    pub failing_probes: u32,
    /// Capture of this node writes nothing, once.
    pub drop_capture_once: Option<u32>,
    /// Raised when the client runs. While raised, `run` reports an
    /// interruption like the host does; `run_cleanup` still goes through.
    pub interrupt_on_client: Option<Arc<AtomicBool>>,
}

impl FakeExec {
    pub fn new() -> Self {
        Self {
            events: Rc::new(RefCell::new(Vec::new())),
            replies: VecDeque::new(),
            failing_builds: 0,
            failing_probes: 0,
            drop_capture_once: None,
            interrupt_on_client: None,
        }
    }

    pub fn with_replies(replies: impl IntoIterator<Item = ClientReply>) -> Self {
        let mut exec = Self::new();
        exec.replies.extend(replies);
        exec
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    /// Index of every event starting with `prefix`.
    pub fn positions(&self, prefix: &str) -> Vec<usize> {
        self.events
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.starts_with(prefix))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn client_calls(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.starts_with("run client"))
            .cloned()
            .collect()
    }

    fn success(lines: Vec<String>) -> ProcessOutput {
        ProcessOutput {
            status: Some(0),
            lines,
            timed_out: false,
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt_on_client
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn failure() -> ProcessOutput {
        ProcessOutput {
            status: Some(2),
            lines: vec!["error".to_string()],
            timed_out: false,
        }
    }
}

impl ProcessExec for FakeExec {
    fn run(&mut self, command: &CommandLine, _timeout: Option<Duration>) -> io::Result<ProcessOutput> {
        if self.interrupted() {
            self.events.borrow_mut().push(format!("interrupted {command}"));
            return Err(io::Error::new(io::ErrorKind::Interrupted, "operator cancel"));
        }
        self.events.borrow_mut().push(format!("run {command}"));
        let output = match command.program.as_str() {
            "motelist" => Self::success(motelist()),
            "build" if self.failing_builds > 0 => {
                self.failing_builds -= 1;
                Self::failure()
            }
            "probe" if self.failing_probes > 0 => {
                self.failing_probes -= 1;
                Self::failure()
            }
            "client" => {
                if let Some(flag) = &self.interrupt_on_client {
                    flag.store(true, Ordering::Relaxed);
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "operator cancel"));
                }
                let reply = self.replies.pop_front().unwrap_or_else(|| ClientReply::ok(42));
                ProcessOutput {
                    status: reply.status,
                    lines: reply.lines,
                    timed_out: reply.timed_out,
                }
            }
            _ => Self::success(Vec::new()),
        };
        Ok(output)
    }

    fn run_cleanup(&mut self, command: &CommandLine, _timeout: Duration) -> io::Result<ProcessOutput> {
        self.events.borrow_mut().push(format!("run {command}"));
        Ok(Self::success(Vec::new()))
    }

    fn spawn(
        &mut self,
        command: &CommandLine,
        output: Option<&Path>,
    ) -> io::Result<Box<dyn BackgroundProcess>> {
        let label = command.to_string();
        self.events.borrow_mut().push(format!("spawn {label}"));
        if let Some(path) = output {
            let node = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("dump"))
                .and_then(|n| n.strip_suffix(".log"))
                .and_then(|n| n.parse::<u32>().ok());
            if node.is_some() && node == self.drop_capture_once {
                self.drop_capture_once = None;
            } else {
                fs::write(path, capture_fixture(12_000 + u64::from(node.unwrap_or(0))))?;
            }
        }
        Ok(Box::new(FakeProcess {
            label,
            events: Rc::clone(&self.events),
            stopped: false,
        }))
    }

    fn write_line(&mut self, port: &str, line: &str) -> io::Result<()> {
        self.events.borrow_mut().push(format!("write {port} {line}"));
        Ok(())
    }

    fn sleep(&mut self, _duration: Duration) {}
}

pub fn rig_config() -> RigConfig {
    RigConfig {
        device_count: DEVICES,
        gateway: 1,
        clean: CommandTemplate::from("clean"),
        build: CommandTemplate::from("build {driver}"),
        flash_server: CommandTemplate::from("flash server {rdc}"),
        flash_border_router: CommandTemplate::from("flash router {gateway}"),
        router_bridge: CommandTemplate::from("bridge"),
        probe: CommandTemplate::from("probe {target}"),
        probe_all: false,
        enumerate: CommandTemplate::from("motelist"),
        reset: CommandTemplate::from("reset {tty}"),
        cleanup: vec![CommandTemplate::from("cleanup")],
        cleanup_timeout_ms: 1_000,
        router_settle_ms: 0,
        probe_settle_ms: 0,
    }
}

pub fn trial_config(dir: &Path) -> TrialConfig {
    TrialConfig {
        client_simple: CommandTemplate::from("client {target} {payload}"),
        client_separate: CommandTemplate::from("client {target} sep={ack} {wait}"),
        client_timeout_ms: 1_000,
        capture: CommandTemplate::from("capture {tty}"),
        capture_settle_ms: 0,
        drain_settle_ms: 0,
        accounting_on: "powertrace on".to_string(),
        accounting_off: "powertrace off".to_string(),
        capture_dir: dir.join("captures"),
        negative_rtt_log: dir.join("neg.txt"),
    }
}

/// A runner over a fresh scratch directory holding captures and results.
pub struct Bench {
    pub dir: TempDir,
    pub shutdown: Arc<AtomicBool>,
}

impl Bench {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("captures")).unwrap();
        Self {
            dir,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> ResultStore {
        ResultStore::create(self.dir.path().join("benchs")).unwrap()
    }

    pub fn executor(&self) -> TrialExecutor {
        TrialExecutor::new(trial_config(self.dir.path()))
    }

    pub fn runner(&self, policy: EscalationPolicy) -> CampaignRunner {
        CampaignRunner::new(
            RigController::new(rig_config()),
            self.executor(),
            self.store(),
            policy,
            Arc::clone(&self.shutdown),
        )
    }
}
