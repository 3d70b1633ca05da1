//! The orchestration façade over every managed server of one project.
//!
//! `Manager` owns one `ManagedProcess` per configured server, refuses to start a
//! server whose port something else already holds, fans output and status changes
//! out to subscribers, and drives autostart, idle reaping and shutdown. Every public
//! operation answers with a serializable result; nothing is raised across this
//! boundary.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::companion::Companion;
use crate::config::ServerConfig;
use crate::events::LogEvent;
use crate::notify::{LogCallback, Notifier, OutputSink, StatusCallback};
use crate::output::LogRing;
use crate::process::{ManagedProcess, ProcessStatus, ProcessTiming, StartOutcome, StopOutcome};
use crate::state::StateStore;

/// Display colors, assigned by configuration order.
pub const COLORS: [&str; 9] = [
    "cyan",
    "magenta",
    "yellow",
    "green",
    "blue",
    "red",
    "bright_cyan",
    "bright_magenta",
    "bright_yellow",
];

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Directory the project's pid file is keyed on.
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub max_lines: usize,
    pub timing: ProcessTiming,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("Server '{0}' not found")]
    NotFound(String),
    #[error("Port {port} is already in use; cannot start '{name}'")]
    PortInUse { name: String, port: u16 },
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),
    #[error("Server '{0}' is not running")]
    NotRunning(String),
    #[error("Port {port} is held by an external process; '{name}' was not started by devrack")]
    External { name: String, port: u16 },
    #[error("Failed to start '{name}': {message}")]
    Start { name: String, message: String },
    #[error("Companion: {0}")]
    Companion(String),
}

impl ManagerError {
    pub fn status(&self) -> ActionStatus {
        match self {
            ManagerError::AlreadyRunning(_) => ActionStatus::AlreadyRunning,
            ManagerError::NotRunning(_) => ActionStatus::NotRunning,
            _ => ActionStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Started,
    Stopped,
    AlreadyRunning,
    NotRunning,
    Error,
}

/// Result of start, stop and restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub message: String,
}

impl ActionResult {
    fn new(status: ActionStatus, message: String) -> Self {
        Self { status, message }
    }

    pub fn is_error(&self) -> bool {
        self.status == ActionStatus::Error
    }
}

impl From<ManagerError> for ActionResult {
    fn from(err: ManagerError) -> Self {
        Self::new(err.status(), err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// A managed process is alive.
    Running,
    /// Not managed, but something holds the port.
    External,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub status: ServerState,
    pub port: u16,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub command: String,
    pub working_dir: String,
}

/// Status of one server, or `{status: "error", message}` when the name is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StatusResult {
    Found(StatusReport),
    Error(ActionResult),
}

impl StatusResult {
    pub fn is_error(&self) -> bool {
        matches!(self, StatusResult::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogsStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogsReport {
    pub status: LogsStatus,
    pub lines: Vec<String>,
    pub total: usize,
    pub offset: i64,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LogsReport {
    fn error(err: ManagerError, offset: i64) -> Self {
        Self {
            status: LogsStatus::Error,
            lines: Vec::new(),
            total: 0,
            offset,
            has_more: false,
            message: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanionStatus {
    pub name: String,
    pub initialized: bool,
}

struct Slot {
    name: String,
    port: u16,
    autostart: bool,
    logs: Arc<LogRing>,
    process: Mutex<ManagedProcess>,
}

/// Per-project registry of managed servers.
pub struct Manager {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    store: Arc<StateStore>,
    notifier: Arc<Notifier>,
    companion: Mutex<Option<Box<dyn Companion>>>,
}

impl Manager {
    /// Builds the registry, pruning dead pid entries and reclaiming live ones.
    ///
    /// Fails only when the state directory cannot be created.
    pub fn new(servers: Vec<ServerConfig>, options: ManagerOptions) -> Result<Self> {
        let store = Arc::new(StateStore::open(&options.state_dir, &options.project_root)?);
        debug!("pid state kept in {}", store.path().display());
        let pruned = store.cleanup_dead();
        if !pruned.is_empty() {
            debug!("dropped stale pid entries: {}", pruned.join(", "));
        }

        let mut slots = Vec::with_capacity(servers.len());
        let mut index = HashMap::with_capacity(servers.len());
        for (idx, config) in servers.into_iter().enumerate() {
            let color = COLORS[idx % COLORS.len()];
            index.insert(config.name.to_lowercase(), idx);
            let name = config.name.clone();
            let port = config.port;
            let autostart = config.autostart;
            let process = ManagedProcess::new(
                config,
                color,
                Arc::clone(&store),
                options.timing,
                options.max_lines,
            );
            slots.push(Slot {
                name,
                port,
                autostart,
                logs: process.logs(),
                process: Mutex::new(process),
            });
        }

        Ok(Self {
            slots,
            index,
            store,
            notifier: Arc::new(Notifier::new()),
            companion: Mutex::new(None),
        })
    }

    fn slot(&self, name: &str) -> Result<&Slot, ManagerError> {
        self.index
            .get(&name.to_lowercase())
            .and_then(|idx| self.slots.get(*idx))
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    /// Configured server names in display order.
    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.name.clone()).collect()
    }

    pub fn state_store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    pub fn add_log_callback(&self, callback: LogCallback) {
        self.notifier.add_log_callback(callback);
    }

    pub fn add_status_callback(&self, callback: StatusCallback) {
        self.notifier.add_status_callback(callback);
    }

    /// Publishes a line from a non-server source (e.g. the MCP layer).
    pub async fn announce(&self, source: &str, line: impl Into<String>) {
        self.notifier.log(LogEvent::now(source, line, true)).await;
    }

    fn sink(&self) -> Arc<dyn OutputSink> {
        self.notifier.clone()
    }

    pub async fn start(&self, name: &str) -> ActionResult {
        self.try_start(name).await.unwrap_or_else(ActionResult::from)
    }

    async fn try_start(&self, name: &str) -> Result<ActionResult, ManagerError> {
        let slot = self.slot(name)?;
        let outcome = {
            let mut process = slot.process.lock().await;
            if process.is_running() {
                return Err(ManagerError::AlreadyRunning(slot.name.clone()));
            }
            if port_in_use(slot.port) {
                return Err(ManagerError::PortInUse {
                    name: slot.name.clone(),
                    port: slot.port,
                });
            }
            process.start(self.sink()).await
        };
        self.notifier.status_changed().await;

        match outcome {
            StartOutcome::Started { pid } => Ok(ActionResult::new(
                ActionStatus::Started,
                format!("Server '{}' started (pid {})", slot.name, pid),
            )),
            StartOutcome::AlreadyRunning { .. } => {
                Err(ManagerError::AlreadyRunning(slot.name.clone()))
            }
            StartOutcome::Failed { error } => Err(ManagerError::Start {
                name: slot.name.clone(),
                message: error,
            }),
        }
    }

    /// Stops a managed server. An external port holder is reported, never killed.
    pub async fn stop(&self, name: &str) -> ActionResult {
        self.try_stop(name).await.unwrap_or_else(ActionResult::from)
    }

    async fn try_stop(&self, name: &str) -> Result<ActionResult, ManagerError> {
        let slot = self.slot(name)?;
        let outcome = slot.process.lock().await.stop().await;
        match outcome {
            StopOutcome::Stopped => {
                self.notifier.status_changed().await;
                Ok(ActionResult::new(
                    ActionStatus::Stopped,
                    format!("Server '{}' stopped", slot.name),
                ))
            }
            StopOutcome::NotRunning if port_in_use(slot.port) => Err(ManagerError::External {
                name: slot.name.clone(),
                port: slot.port,
            }),
            StopOutcome::NotRunning => Err(ManagerError::NotRunning(slot.name.clone())),
        }
    }

    /// Stops the server if it is running, then starts it again.
    pub async fn restart(&self, name: &str) -> ActionResult {
        let stopped = self.try_stop(name).await;
        match stopped {
            Ok(_) | Err(ManagerError::NotRunning(_)) => self.start(name).await,
            Err(err) => err.into(),
        }
    }

    pub async fn status(&self, name: &str) -> Result<StatusReport, ManagerError> {
        let slot = self.slot(name)?;
        let mut process = slot.process.lock().await;
        Ok(report(slot, &mut process))
    }

    /// Like [`Manager::status`], folded into a serializable result.
    pub async fn status_result(&self, name: &str) -> StatusResult {
        match self.status(name).await {
            Ok(report) => StatusResult::Found(report),
            Err(err) => StatusResult::Error(err.into()),
        }
    }

    /// Pages through a server's log ring. Works whether or not the server is running.
    pub fn logs(&self, name: &str, offset: i64, limit: usize, reverse: bool) -> LogsReport {
        let slot = match self.slot(name) {
            Ok(slot) => slot,
            Err(err) => return LogsReport::error(err, offset),
        };
        let page = slot.logs.range(offset, limit, reverse);
        LogsReport {
            status: LogsStatus::Success,
            lines: page.lines,
            total: page.total,
            offset,
            has_more: page.has_more,
            message: None,
        }
    }

    /// Ring of a server, for renderers that page through it directly.
    pub fn log_ring(&self, name: &str) -> Result<Arc<LogRing>, ManagerError> {
        self.slot(name).map(|slot| Arc::clone(&slot.logs))
    }

    pub fn clear_logs(&self, name: &str) -> Result<(), ManagerError> {
        self.slot(name)?.logs.clear();
        Ok(())
    }

    pub async fn list_all(&self) -> Vec<StatusReport> {
        let mut reports = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let mut process = slot.process.lock().await;
            reports.push(report(slot, &mut process));
        }
        reports
    }

    /// Starts every autostart server whose status resolves to stopped.
    ///
    /// Running (reclaimed) servers and ports held by someone else are left alone.
    pub async fn autostart_configured_servers(&self) -> Vec<(String, ActionResult)> {
        let mut eligible = Vec::new();
        for slot in self.slots.iter().filter(|slot| slot.autostart) {
            let state = report(slot, &mut *slot.process.lock().await).status;
            match state {
                ServerState::Stopped => eligible.push(slot),
                ServerState::Running => debug!("{} already running, skipping autostart", slot.name),
                ServerState::External => info!(
                    "port {} is held by another process, not autostarting {}",
                    slot.port, slot.name
                ),
            }
        }
        let starts = eligible.into_iter().map(|slot| async move {
            let result = self.start(&slot.name).await;
            if result.is_error() {
                warn!("autostart of {} failed: {}", slot.name, result.message);
            }
            (slot.name.clone(), result)
        });
        join_all(starts).await
    }

    /// Stops every running server concurrently, then the companion.
    pub async fn shutdown_all(&self) {
        let stops = self.slots.iter().map(|slot| async move {
            let mut process = slot.process.lock().await;
            if process.is_running() {
                process.stop().await;
            }
        });
        join_all(stops).await;

        if let Some(companion) = self.companion.lock().await.as_mut() {
            if let Err(err) = companion.shutdown().await {
                warn!("failed to shut down {}: {:#}", companion.name(), err);
            }
        }
        self.notifier.status_changed().await;
    }

    /// Stops running servers that have produced no output for `timeout`.
    pub async fn stop_idle(&self, timeout: Duration) -> Vec<String> {
        let mut stopped = Vec::new();
        for slot in &self.slots {
            let mut process = slot.process.lock().await;
            if !process.is_running() {
                continue;
            }
            let Some(idle) = process.idle() else {
                continue;
            };
            if idle >= timeout {
                info!("stopping {} after {}s without output", slot.name, idle.as_secs());
                process.stop().await;
                stopped.push(slot.name.clone());
            }
        }
        if !stopped.is_empty() {
            self.notifier.status_changed().await;
        }
        stopped
    }

    pub async fn attach_companion(&self, companion: Box<dyn Companion>) {
        *self.companion.lock().await = Some(companion);
    }

    pub async fn launch_companion(&self) -> Result<(), ManagerError> {
        let launched = {
            let mut guard = self.companion.lock().await;
            let Some(companion) = guard.as_mut() else {
                return Err(ManagerError::Companion("no companion attached".into()));
            };
            companion.launch(self.sink()).await
        };
        self.notifier.status_changed().await;
        launched.map_err(|err| ManagerError::Companion(format!("{:#}", err)))
    }

    pub async fn companion_status(&self) -> Option<CompanionStatus> {
        let mut guard = self.companion.lock().await;
        let companion = guard.as_mut()?;
        Some(CompanionStatus {
            name: companion.name().to_string(),
            initialized: companion.is_initialized(),
        })
    }
}

fn report(slot: &Slot, process: &mut ManagedProcess) -> StatusReport {
    let running = process.status() == ProcessStatus::Running;
    let status = if running {
        ServerState::Running
    } else if port_in_use(slot.port) {
        ServerState::External
    } else {
        ServerState::Stopped
    };
    StatusReport {
        name: slot.name.clone(),
        status,
        port: slot.port,
        color: process.color().to_string(),
        pid: process.pid().filter(|_| running),
        uptime_seconds: process.uptime().map(|uptime| uptime.as_secs()),
        idle_seconds: process.idle().map(|idle| idle.as_secs()),
        error: process.last_error().map(str::to_string),
        command: process.config().command.clone(),
        working_dir: process.config().working_dir.display().to_string(),
    }
}

/// Whether something on this machine holds `port` on localhost, over IPv4 or IPv6.
pub fn port_in_use(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    loopback_held(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
        || loopback_held(IpAddr::V6(Ipv6Addr::LOCALHOST), port)
}

fn loopback_held(ip: IpAddr, port: u16) -> bool {
    let addr = SocketAddr::new(ip, port);
    match TcpListener::bind(addr) {
        Ok(_) => false,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => true,
        // No IPv6 loopback on this host.
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
            ) =>
        {
            false
        }
        Err(err) => {
            // e.g. privileged ports: fall back to asking whether anyone answers.
            debug!("bind probe on {} failed: {}", addr, err);
            TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::notify::{log_callback, status_callback};

    fn server(name: &str, command: &str, port: u16, autostart: bool, dir: &TempDir) -> ServerConfig {
        ServerConfig {
            name: name.into(),
            command: command.into(),
            working_dir: dir.path().to_path_buf(),
            port,
            prefix_logs: true,
            autostart,
        }
    }

    fn manager(servers: Vec<ServerConfig>, dir: &TempDir) -> Manager {
        manager_with_stop_timeout(servers, dir, Duration::from_secs(2))
    }

    fn manager_with_stop_timeout(
        servers: Vec<ServerConfig>,
        dir: &TempDir,
        stop_timeout: Duration,
    ) -> Manager {
        let options = ManagerOptions {
            project_root: dir.path().to_path_buf(),
            state_dir: dir.path().join("state"),
            max_lines: 500,
            timing: ProcessTiming {
                startup_grace: Duration::from_millis(200),
                stop_timeout,
                kill_timeout: Duration::from_secs(1),
            },
        };
        Manager::new(servers, options).unwrap()
    }

    fn free_port() -> u16 {
        TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn unknown_servers_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(vec![server("api", "sleep 5", free_port(), false, &dir)], &dir);

        let result = manager.start("web").await;
        assert_eq!(result.status, ActionStatus::Error);
        assert_eq!(result.message, "Server 'web' not found");
        assert_eq!(
            manager.status("web").await.unwrap_err(),
            ManagerError::NotFound("web".into())
        );
        let logs = manager.logs("web", 0, 10, true);
        assert_eq!(logs.status, LogsStatus::Error);
        assert!(manager.clear_logs("web").is_err());
    }

    #[tokio::test]
    async fn occupied_port_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager(vec![server("api", "sleep 5", port, false, &dir)], &dir);

        let result = manager.start("api").await;
        assert_eq!(result.status, ActionStatus::Error);
        assert!(result.message.contains("in use"), "{}", result.message);
        assert!(manager.state_store().entries().is_empty());

        let status = manager.status("API").await.unwrap();
        assert_eq!(status.status, ServerState::External);
        assert_eq!(status.pid, None);

        let stop = manager.stop("api").await;
        assert_eq!(stop.status, ActionStatus::Error);
        assert!(stop.message.contains("external"), "{}", stop.message);
        drop(listener);
    }

    #[tokio::test]
    async fn ipv6_loopback_listeners_count_as_external() {
        let Ok(listener) = TcpListener::bind(("::1", 0)) else {
            // Host without an IPv6 loopback.
            return;
        };
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port), "listener on [::1]:{port} not detected");

        let dir = tempfile::tempdir().unwrap();
        let manager = manager(vec![server("vite", "sleep 5", port, false, &dir)], &dir);
        assert_eq!(
            manager.status("vite").await.unwrap().status,
            ServerState::External
        );
        let result = manager.start("vite").await;
        assert_eq!(result.status, ActionStatus::Error);
        assert!(result.message.contains("in use"), "{}", result.message);
        drop(listener);
    }

    #[tokio::test]
    async fn status_result_carries_error_shape() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(vec![server("api", "true", free_port(), false, &dir)], &dir);

        let missing = manager.status_result("web").await;
        assert!(missing.is_error());
        assert_eq!(
            serde_json::to_value(&missing).unwrap(),
            serde_json::json!({"status": "error", "message": "Server 'web' not found"})
        );

        let found = manager.status_result("api").await;
        assert!(!found.is_error());
        let value = serde_json::to_value(&found).unwrap();
        assert_eq!(value["status"], "stopped");
        assert_eq!(value["name"], "api");
    }

    #[tokio::test]
    async fn autostart_skips_externally_held_ports() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held = listener.local_addr().unwrap().port();
        let manager = manager(
            vec![
                server("held", "sleep 5", held, true, &dir),
                server("free", "sleep 5", free_port(), true, &dir),
                server("manual", "sleep 5", free_port(), false, &dir),
            ],
            &dir,
        );

        let started = manager.autostart_configured_servers().await;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, "free");
        assert_eq!(started[0].1.status, ActionStatus::Started);

        let reports = manager.list_all().await;
        let states: Vec<_> = reports.iter().map(|report| report.status).collect();
        assert_eq!(
            states,
            vec![ServerState::External, ServerState::Running, ServerState::Stopped]
        );
        assert!(reports[1].pid.is_some());
        assert!(reports[1].error.is_none());
        assert_eq!(manager.state_store().entries().len(), 1);

        manager.shutdown_all().await;
        assert_eq!(
            manager.status("free").await.unwrap().status,
            ServerState::Stopped
        );
        assert!(manager.state_store().entries().is_empty());
        drop(listener);
    }

    #[tokio::test]
    async fn start_stop_and_restart_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(vec![server("api", "sleep 5", free_port(), false, &dir)], &dir);

        assert_eq!(manager.start("api").await.status, ActionStatus::Started);
        assert_eq!(
            manager.start("api").await.status,
            ActionStatus::AlreadyRunning
        );
        let first = manager.status("api").await.unwrap().pid.unwrap();

        assert_eq!(manager.restart("api").await.status, ActionStatus::Started);
        let second = manager.status("api").await.unwrap().pid.unwrap();
        assert_ne!(first, second);

        assert_eq!(manager.stop("api").await.status, ActionStatus::Stopped);
        assert_eq!(manager.stop("api").await.status, ActionStatus::NotRunning);
        assert_eq!(manager.stop("api").await.status, ActionStatus::NotRunning);
    }

    #[tokio::test]
    async fn failed_start_is_visible_in_status() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(vec![server("api", "exit 9", free_port(), false, &dir)], &dir);
        let result = manager.start("api").await;
        assert_eq!(result.status, ActionStatus::Error);
        assert_eq!(
            result.message,
            "Failed to start 'api': exited immediately with code 9"
        );
        let status = manager.status("api").await.unwrap();
        assert_eq!(status.status, ServerState::Stopped);
        assert_eq!(status.error.as_deref(), Some("exited immediately with code 9"));
    }

    #[tokio::test]
    async fn logs_page_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(vec![server("api", "true", free_port(), false, &dir)], &dir);
        let ring = manager.log_ring("api").unwrap();
        for idx in 0..150 {
            ring.push(format!("L{}", idx));
        }

        let page = manager.logs("api", 0, 100, true);
        assert_eq!(page.status, LogsStatus::Success);
        assert_eq!(page.lines.len(), 100);
        assert_eq!(page.lines[0], "L149");
        assert_eq!(page.lines[99], "L50");
        assert_eq!(page.total, 150);
        assert!(page.has_more);

        let tail = manager.logs("api", 140, 100, true);
        let expected: Vec<String> = (0..10).rev().map(|idx| format!("L{}", idx)).collect();
        assert_eq!(tail.lines, expected);
        assert_eq!(tail.offset, 140);
        assert!(!tail.has_more);

        manager.clear_logs("api").unwrap();
        assert_eq!(manager.logs("api", 0, 10, true).total, 0);
    }

    #[tokio::test]
    async fn subscribers_see_output_and_status_changes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            vec![server("api", "echo ready", free_port(), false, &dir)],
            &dir,
        );
        let lines = Arc::new(StdMutex::new(Vec::new()));
        let changes = Arc::new(AtomicUsize::new(0));
        {
            let lines = Arc::clone(&lines);
            manager.add_log_callback(log_callback(move |event| {
                let lines = Arc::clone(&lines);
                async move {
                    lines.lock().unwrap().push(format!("{}: {}", event.server, event.line));
                    Ok(())
                }
            }));
            manager.add_log_callback(log_callback(|_event| async {
                anyhow::bail!("subscriber down")
            }));
            let changes = Arc::clone(&changes);
            manager.add_status_callback(status_callback(move || {
                let changes = Arc::clone(&changes);
                async move {
                    changes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        assert_eq!(manager.start("api").await.status, ActionStatus::Started);
        manager.announce("MCP Server", "tool call: start_server").await;
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["api: ready", "MCP Server: tool call: start_server"]
        );
        assert!(changes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn idle_servers_are_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            vec![
                server("api", "sleep 5", free_port(), false, &dir),
                server("web", "sleep 5", free_port(), false, &dir),
            ],
            &dir,
        );
        manager.start("api").await;
        assert!(manager.stop_idle(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(manager.stop_idle(Duration::ZERO).await, vec!["api".to_string()]);
        assert_eq!(
            manager.status("api").await.unwrap().status,
            ServerState::Stopped
        );
    }

    #[tokio::test]
    async fn reclaims_servers_across_manager_instances() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let first = manager(vec![server("api", "sleep 5", port, false, &dir)], &dir);
        assert_eq!(first.start("api").await.status, ActionStatus::Started);
        let pid = first.status("api").await.unwrap().pid;
        drop(first);

        let second = manager(vec![server("api", "sleep 5", port, false, &dir)], &dir);
        let status = second.status("api").await.unwrap();
        assert_eq!(status.status, ServerState::Running);
        assert_eq!(status.pid, pid);
        assert_eq!(second.stop("api").await.status, ActionStatus::Stopped);
    }

    #[tokio::test]
    async fn autostart_leaves_reclaimed_servers_alone() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let first = manager(vec![server("api", "sleep 5", port, true, &dir)], &dir);
        assert_eq!(first.start("api").await.status, ActionStatus::Started);
        let pid = first.status("api").await.unwrap().pid;
        assert!(pid.is_some());
        drop(first);

        let second = manager(vec![server("api", "sleep 5", port, true, &dir)], &dir);
        assert!(second.autostart_configured_servers().await.is_empty());
        let status = second.status("api").await.unwrap();
        assert_eq!(status.status, ServerState::Running);
        assert_eq!(status.pid, pid);
        assert_eq!(second.state_store().get_pid("api"), pid);
        second.shutdown_all().await;
    }

    #[tokio::test]
    async fn shutdown_stops_servers_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let stubborn = "trap '' TERM; sleep 30";
        let manager = manager_with_stop_timeout(
            vec![
                server("a", stubborn, free_port(), false, &dir),
                server("b", stubborn, free_port(), false, &dir),
                server("c", stubborn, free_port(), false, &dir),
            ],
            &dir,
            Duration::from_secs(1),
        );
        for name in ["a", "b", "c"] {
            assert_eq!(manager.start(name).await.status, ActionStatus::Started);
        }

        let began = std::time::Instant::now();
        manager.shutdown_all().await;
        let elapsed = began.elapsed();
        // Each one waits out the full stop timeout before being killed.
        assert!(elapsed < Duration::from_millis(2500), "shutdown took {elapsed:?}");
        for report in manager.list_all().await {
            assert_eq!(report.status, ServerState::Stopped, "{}", report.name);
        }
        assert!(manager.state_store().entries().is_empty());
    }

    struct FakeCompanion {
        up: bool,
        launches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Companion for FakeCompanion {
        fn name(&self) -> &str {
            "fake"
        }

        fn is_initialized(&mut self) -> bool {
            self.up
        }

        async fn launch(&mut self, _sink: Arc<dyn OutputSink>) -> Result<()> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.up = true;
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.up = false;
            Ok(())
        }
    }

    #[tokio::test]
    async fn companion_follows_manager_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(vec![server("api", "true", free_port(), false, &dir)], &dir);
        assert_eq!(manager.companion_status().await, None);
        assert!(manager.launch_companion().await.is_err());

        let launches = Arc::new(AtomicUsize::new(0));
        manager
            .attach_companion(Box::new(FakeCompanion {
                up: false,
                launches: Arc::clone(&launches),
            }))
            .await;
        manager.launch_companion().await.unwrap();
        assert_eq!(
            manager.companion_status().await,
            Some(CompanionStatus {
                name: "fake".into(),
                initialized: true
            })
        );

        manager.shutdown_all().await;
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert!(!manager.companion_status().await.unwrap().initialized);
    }

    #[test]
    fn action_results_serialize_with_snake_case_status() {
        let result: ActionResult = ManagerError::AlreadyRunning("api".into()).into();
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({"status": "already_running", "message": "Server 'api' is already running"})
        );
    }
}
