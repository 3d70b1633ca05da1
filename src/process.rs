//! Lifecycle of a single managed server process.
//!
//! A `ManagedProcess` is created once per configured server and reused across
//! start/stop cycles. It owns the child handle, the output drain task, and the
//! server's log ring, and keeps the persisted pid entry in step with what it tracks.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::events::LogEvent;
use crate::notify::OutputSink;
use crate::output::{decode_line, LogRing};
use crate::platform::{self, Delivery, Signal};
use crate::state::StateStore;

const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Startup and shutdown timing for managed processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTiming {
    /// How long a fresh process must survive before `start` reports success.
    pub startup_grace: Duration,
    /// Graceful termination wait before escalating to a forced kill.
    pub stop_timeout: Duration,
    /// Wait after the forced kill.
    pub kill_timeout: Duration,
}

impl Default for ProcessTiming {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// The current lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Not running, and the last start or run ended in an error.
    Errored,
    Stopped,
}

/// One configured server and whatever OS process currently backs it.
pub struct ManagedProcess {
    config: ServerConfig,
    color: &'static str,
    store: Arc<StateStore>,
    timing: ProcessTiming,
    logs: Arc<LogRing>,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<Instant>,
    last_error: Option<String>,
    drain: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    /// Creates the process entry, adopting a still-alive pid from the state store.
    pub fn new(
        config: ServerConfig,
        color: &'static str,
        store: Arc<StateStore>,
        timing: ProcessTiming,
        max_lines: usize,
    ) -> Self {
        let mut process = Self {
            config,
            color,
            store,
            timing,
            logs: Arc::new(LogRing::new(max_lines)),
            child: None,
            pid: None,
            started_at: None,
            last_error: None,
            drain: None,
        };
        process.reclaim();
        process
    }

    fn reclaim(&mut self) {
        let Some(pid) = self.store.get_pid(&self.config.name) else {
            return;
        };
        if platform::is_pid_alive(pid) {
            info!("reclaimed {} (pid {})", self.config.name, pid);
            self.pid = Some(pid);
            // Start time of a reclaimed process is unknown; uptime counts from the reclaim.
            self.started_at = Some(Instant::now());
        } else {
            debug!("stored pid {} for {} is gone", pid, self.config.name);
            self.clear_stored_pid();
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn color(&self) -> &'static str {
        self.color
    }

    /// Tracked pid. May be stale until `is_running` re-checks it.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn logs(&self) -> Arc<LogRing> {
        Arc::clone(&self.logs)
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.pid?;
        self.started_at.map(|at| at.elapsed())
    }

    /// Time since the last output line, or since start when the server has been silent.
    pub fn idle(&self) -> Option<Duration> {
        let started = self.started_at?;
        self.pid?;
        let last = match self.logs.last_activity() {
            Some(line) if line > started => line,
            _ => started,
        };
        Some(last.elapsed())
    }

    /// Re-derives liveness from the OS and drops tracking once the process is gone.
    pub fn is_running(&mut self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => {
                    info!("{} exited: {}", self.config.name, describe_exit(status, false));
                    if !status.success() {
                        self.last_error = Some(describe_exit(status, false));
                    }
                    self.forget();
                    return false;
                }
                Err(err) => debug!("try_wait on {} failed: {}", self.config.name, err),
            }
        }
        if platform::is_pid_alive(pid) {
            return true;
        }
        info!("{} (pid {}) is no longer running", self.config.name, pid);
        self.forget();
        false
    }

    pub fn status(&mut self) -> ProcessStatus {
        if self.is_running() {
            ProcessStatus::Running
        } else if self.last_error.is_some() {
            ProcessStatus::Errored
        } else {
            ProcessStatus::Stopped
        }
    }

    /// Spawns the server and waits out the startup grace period.
    ///
    /// Output is drained into the log ring and forwarded to `sink` line by line.
    pub async fn start(&mut self, sink: Arc<dyn OutputSink>) -> StartOutcome {
        if self.is_running() {
            if let Some(pid) = self.pid {
                return StartOutcome::AlreadyRunning { pid };
            }
        }
        self.finish_drain().await;
        self.last_error = None;

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(err) => return self.fail(format!("{:#}", err)),
        };
        let Some(pid) = child.id() else {
            return self.fail("process exited before it was assigned a pid".to_string());
        };
        // Persist before the first await so a crash of ours cannot orphan it untracked.
        if let Err(err) = self.store.save_pid(&self.config.name, pid) {
            warn!("failed to persist pid for {}: {:#}", self.config.name, err);
        }
        self.pid = Some(pid);
        self.started_at = Some(Instant::now());
        if let Some(stdout) = child.stdout.take() {
            self.drain = Some(tokio::spawn(drain_output(
                self.config.name.clone(),
                self.config.prefix_logs,
                stdout,
                Arc::clone(&self.logs),
                sink,
            )));
        }
        self.child = Some(child);
        info!("started {} (pid {})", self.config.name, pid);

        tokio::time::sleep(self.timing.startup_grace).await;

        let exited = match self.child.as_mut().map(|child| child.try_wait()) {
            Some(Ok(status)) => status,
            Some(Err(err)) => {
                debug!("try_wait on {} failed: {}", self.config.name, err);
                None
            }
            None => None,
        };
        match exited {
            None => StartOutcome::Started { pid },
            Some(status) if status.success() => {
                // A command that finishes cleanly within the grace period did its job.
                info!("{} exited cleanly during startup", self.config.name);
                self.release().await;
                StartOutcome::Started { pid }
            }
            Some(status) => {
                self.release().await;
                self.fail(describe_exit(status, true))
            }
        }
    }

    fn spawn(&self) -> Result<Child> {
        let dir = &self.config.working_dir;
        check_working_dir(dir)?;

        let mut command = shell_command(&self.config.command);
        command
            .current_dir(dir)
            .env("TERM", "xterm-256color")
            .env("FORCE_COLOR", "1")
            .env("COLORTERM", "truecolor")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.name))
    }

    /// Terminates the process group, escalating to a forced kill after the stop timeout.
    pub async fn stop(&mut self) -> StopOutcome {
        if !self.is_running() {
            self.finish_drain().await;
            return StopOutcome::NotRunning;
        }
        let Some(pid) = self.pid else {
            return StopOutcome::NotRunning;
        };
        info!("stopping {} (pid {})", self.config.name, pid);

        if self.signal(pid, Signal::Terminate) == Delivery::Sent
            && !self.wait_for_exit(pid, self.timing.stop_timeout).await
        {
            warn!(
                "{} did not exit within {:?}, killing process group",
                self.config.name, self.timing.stop_timeout
            );
            if self.signal(pid, Signal::Kill) == Delivery::Sent
                && !self.wait_for_exit(pid, self.timing.kill_timeout).await
            {
                warn!("{} (pid {}) survived SIGKILL", self.config.name, pid);
            }
        }
        self.release().await;
        StopOutcome::Stopped
    }

    fn signal(&self, pid: u32, signal: Signal) -> Delivery {
        match platform::signal_tree(pid, signal) {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(
                    "failed to send {} to {} (pid {}): {}",
                    signal.label(),
                    self.config.name,
                    pid,
                    err
                );
                Delivery::Sent
            }
        }
    }

    async fn wait_for_exit(&mut self, pid: u32, timeout: Duration) -> bool {
        if let Some(child) = self.child.as_mut() {
            match wait_for_exit(child, timeout).await {
                Ok(Some(_)) => return true,
                Ok(None) => return false,
                Err(err) => debug!("wait on {} failed: {:#}", self.config.name, err),
            }
        }
        // Reclaimed processes are not our children; poll until the pid disappears.
        let deadline = tokio::time::Instant::now() + timeout;
        while platform::is_pid_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }
        true
    }

    fn fail(&mut self, error: String) -> StartOutcome {
        warn!("failed to start {}: {}", self.config.name, error);
        self.last_error = Some(error.clone());
        StartOutcome::Failed { error }
    }

    /// Drops tracking and waits for the output drain to finish.
    async fn release(&mut self) {
        self.forget();
        self.finish_drain().await;
    }

    fn forget(&mut self) {
        self.child = None;
        self.pid = None;
        self.started_at = None;
        self.clear_stored_pid();
    }

    fn clear_stored_pid(&self) {
        if let Err(err) = self.store.clear_pid(&self.config.name) {
            warn!("failed to clear pid for {}: {:#}", self.config.name, err);
        }
    }

    async fn finish_drain(&mut self) {
        let Some(mut handle) = self.drain.take() else {
            return;
        };
        if tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            // A grandchild may still hold the pipe open.
            debug!("output of {} still open, aborting drain", self.config.name);
            handle.abort();
        }
    }
}

fn check_working_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        bail!("working directory does not exist: {}", dir.display());
    }
    if !dir.is_dir() {
        bail!("working directory is not a directory: {}", dir.display());
    }
    Ok(())
}

/// Builds a shell invocation whose stderr shares the stdout pipe.
#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(format!("exec 2>&1\n{}", command_line));
    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.raw_arg(format!("/C {} 2>&1", command_line));
    command
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(child.try_wait()?);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}

async fn drain_output<R>(
    server: String,
    prefixed: bool,
    reader: R,
    logs: Arc<LogRing>,
    sink: Arc<dyn OutputSink>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                if line.is_empty() {
                    continue;
                }
                logs.push(line.clone());
                sink.line(LogEvent::now(&server, line, prefixed)).await;
            }
            Err(err) => {
                debug!("reading output of {} failed: {}", server, err);
                break;
            }
        }
    }
    debug!("output of {} closed", server);
    sink.closed(&server).await;
}

fn describe_exit(status: ExitStatus, immediately: bool) -> String {
    let exited = if immediately {
        "exited immediately"
    } else {
        "exited"
    };
    match status.code() {
        Some(127) => format!("{} with code 127 (command not found)", exited),
        Some(126) => format!("{} with code 126 (permission denied)", exited),
        Some(code) => format!("{} with code {}", exited, code),
        None => describe_signal(status, exited),
    }
}

#[cfg(unix)]
fn describe_signal(status: ExitStatus, exited: &str) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("{} after signal {}", exited, signal),
        None => format!("{} without an exit code", exited),
    }
}

#[cfg(not(unix))]
fn describe_signal(_status: ExitStatus, exited: &str) -> String {
    format!("{} without an exit code", exited)
}
