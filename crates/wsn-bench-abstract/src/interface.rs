use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

/// A fully rendered external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Outcome of a foreground command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was killed by a signal or timed out.
    pub status: Option<i32>,
    /// Combined stdout/stderr, one entry per line without terminators.
    pub lines: Vec<String>,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0) && !self.timed_out
    }
}

/// Handle on a detached helper process (capture, router bridge).
pub trait BackgroundProcess {
    /// Terminate the process and reap it. Must be idempotent.
    fn stop(&mut self) -> io::Result<()>;
}

/// The process boundary to the device-control toolchain and protocol client.
///
/// Everything the rig does to the outside world goes through this trait, which
/// keeps the controller, executor and campaign loop drivable by a scripted fake.
pub trait ProcessExec {
    /// Run a command to completion, killing it once `timeout` elapses.
    fn run(&mut self, command: &CommandLine, timeout: Option<Duration>) -> io::Result<ProcessOutput>;

    /// Run a stop/cleanup command that must happen even while shutting down.
    ///
    /// Unlike [`ProcessExec::run`] it ignores operator interruption, so it is
    /// always bounded by `timeout`.
    fn run_cleanup(&mut self, command: &CommandLine, timeout: Duration) -> io::Result<ProcessOutput> {
        self.run(command, Some(timeout))
    }

    /// Start a detached process, sending its stdout to `output` when given.
    fn spawn(
        &mut self,
        command: &CommandLine,
        output: Option<&Path>,
    ) -> io::Result<Box<dyn BackgroundProcess>>;

    /// Write one console line to a device's serial port.
    fn write_line(&mut self, port: &str, line: &str) -> io::Result<()>;

    /// Fixed settle delay between rig steps.
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
