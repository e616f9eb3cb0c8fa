//! [`ProcessExec`] over real host processes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wsn_bench_abstract::{BackgroundProcess, CommandLine, ProcessExec, ProcessOutput};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs commands on the host. Foreground output is collected through a scratch
/// log file, so a chatty process can never block on a full pipe.
pub struct HostExec {
    scratch_log: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl HostExec {
    pub fn new(scratch_dir: impl AsRef<Path>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            scratch_log: scratch_dir.as_ref().join(".wsn-bench-command.log"),
            shutdown,
        }
    }

    fn command(command: &CommandLine) -> Command {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args).stdin(Stdio::null());
        cmd
    }
}

fn reap(child: &mut Child) {
    // kill() fails with InvalidInput once the child has already exited.
    let _ = child.kill();
    let _ = child.wait();
}

impl HostExec {
    /// Run to completion or `timeout`. When `interruptible`, a raised shutdown
    /// flag kills the command and reports [`io::ErrorKind::Interrupted`].
    fn run_foreground(
        &mut self,
        command: &CommandLine,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> io::Result<ProcessOutput> {
        debug!("> {}", command);
        let out = File::create(&self.scratch_log)?;
        let err = out.try_clone()?;
        let mut child = Self::command(command).stdout(out).stderr(err).spawn()?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let (status, timed_out) = loop {
            if let Some(status) = child.try_wait()? {
                break (status.code(), false);
            }
            if interruptible && self.shutdown.load(Ordering::Relaxed) {
                reap(&mut child);
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("interrupted while running `{command}`"),
                ));
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                warn!("`{}` exceeded {:?}, killing it", command, timeout.unwrap_or_default());
                reap(&mut child);
                break (None, true);
            }
            thread::sleep(POLL_INTERVAL);
        };

        let raw = fs::read(&self.scratch_log)?;
        let lines = String::from_utf8_lossy(&raw)
            .lines()
            .map(str::to_string)
            .collect();
        Ok(ProcessOutput {
            status,
            lines,
            timed_out,
        })
    }
}

impl ProcessExec for HostExec {
    fn run(&mut self, command: &CommandLine, timeout: Option<Duration>) -> io::Result<ProcessOutput> {
        self.run_foreground(command, timeout, true)
    }

    fn run_cleanup(&mut self, command: &CommandLine, timeout: Duration) -> io::Result<ProcessOutput> {
        self.run_foreground(command, Some(timeout), false)
    }

    fn spawn(
        &mut self,
        command: &CommandLine,
        output: Option<&Path>,
    ) -> io::Result<Box<dyn BackgroundProcess>> {
        debug!("> {} &", command);
        let stdout = match output {
            Some(path) => Stdio::from(File::create(path)?),
            None => Stdio::null(),
        };
        let child = Self::command(command)
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(HostProcess {
            label: command.to_string(),
            child: Some(child),
        }))
    }

    fn write_line(&mut self, port: &str, line: &str) -> io::Result<()> {
        debug!("> echo '{}' > {}", line, port);
        let mut device = OpenOptions::new().write(true).open(port)?;
        writeln!(device, "{line}")?;
        device.flush()
    }
}

/// A detached host process; stopped on drop if nobody stopped it first.
pub struct HostProcess {
    label: String,
    child: Option<Child>,
}

impl BackgroundProcess for HostProcess {
    fn stop(&mut self) -> io::Result<()> {
        if let Some(mut child) = self.child.take() {
            debug!("Stopping `{}`", self.label);
            if child.try_wait()?.is_none() {
                child.kill()?;
            }
            child.wait()?;
        }
        Ok(())
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop `{}`: {}", self.label, e);
        }
    }
}
