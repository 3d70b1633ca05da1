//! devrack: run a project's dev servers side by side.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads the project's `devrack.toml`, builds the process manager and then hands it
//! to one of the front ends: the terminal UI, plain prefixed output, the MCP tool
//! interface, or a one-shot command.

mod app;
mod companion;
mod config;
mod events;
mod logging;
mod manager;
mod mcp;
mod notify;
mod output;
mod platform;
mod process;
mod state;
mod tui;

use std::collections::HashMap;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::{format_duration, App, AppAction};
use crate::companion::{BrowserDriver, BROWSER_NAME};
use crate::config::{expand_path, load_config, resolve_config_path, Config, ServerConfig};
use crate::events::{Event, LogEvent};
use crate::logging::LogTarget;
use crate::manager::{ActionStatus, Manager, ManagerOptions, ServerState};
use crate::mcp::McpServer;
use crate::notify::{channel_log_callback, channel_status_callback, log_callback, LogCallback};
use crate::output::DEFAULT_MAX_LINES;
use crate::state::{cleanup_orphans, default_state_dir};

/// Source name for lines devrack itself publishes.
const DEVRACK_SOURCE: &str = "devrack";
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const UI_LOG_FILE: &str = "devrack.log";

#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Run, watch and control a project's dev servers",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to devrack.toml (default: search upward from the current directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory for pid files and the UI log.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Max log lines kept per server.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// Do not start servers marked `autostart`.
    #[arg(long, global = true)]
    no_autostart: bool,
    /// Debug-level diagnostics.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start autostart servers and open the terminal UI (default).
    Up {
        /// Print prefixed output lines instead of opening the terminal UI.
        #[arg(long)]
        no_ui: bool,
    },
    /// Serve the MCP tool interface on stdin/stdout.
    Mcp,
    /// Show the state of every configured server.
    Status,
    /// Stop one server, or every server of the project.
    Stop { name: Option<String> },
    /// Terminate processes left behind by earlier runs.
    Cleanup,
    /// Show help information.
    Help,
    /// Show version information.
    Version,
}

/// A loaded and validated project.
struct Project {
    config: Config,
    root: PathBuf,
    servers: Vec<ServerConfig>,
    state_dir: PathBuf,
}

impl Project {
    fn load(cli: &Cli) -> Result<Self> {
        let cwd = env::current_dir().context("failed to read the current directory")?;
        let path = resolve_config_path(cli.config.as_deref(), &cwd)?;
        let config = load_config(&path)?;
        let root = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => cwd.join(parent),
            _ => cwd.clone(),
        };
        let servers = config.servers(&root)?;
        let state_dir = resolve_state_dir(cli.state_dir.as_deref(), &config, &root)?;
        debug!("loaded {} servers from {}", servers.len(), path.display());
        Ok(Self {
            config,
            root,
            servers,
            state_dir,
        })
    }

    fn max_lines(&self, cli: &Cli) -> usize {
        cli.max_lines
            .or(self.config.max_lines)
            .unwrap_or(DEFAULT_MAX_LINES)
    }

    fn manager(&self, cli: &Cli) -> Result<Arc<Manager>> {
        let options = ManagerOptions {
            project_root: self.root.clone(),
            state_dir: self.state_dir.clone(),
            max_lines: self.max_lines(cli),
            timing: self.config.timing(),
        };
        Ok(Arc::new(Manager::new(self.servers.clone(), options)?))
    }

    /// Attaches the browser companion when enabled; returns whether one was attached.
    async fn attach_companion(&self, cli: &Cli, manager: &Manager) -> bool {
        let Some(command) = self.config.browser_command() else {
            return false;
        };
        let driver = BrowserDriver::new(
            command,
            self.root.clone(),
            manager.state_store(),
            self.config.timing(),
            self.max_lines(cli),
        );
        manager.attach_companion(Box::new(driver)).await;
        true
    }
}

/// `--state-dir`, then the config's `state_dir`, then the per-user default.
fn resolve_state_dir(flag: Option<&Path>, config: &Config, root: &Path) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = &config.state_dir {
        return Ok(expand_path(dir, root));
    }
    default_state_dir()
        .ok_or_else(|| anyhow!("cannot determine a state directory; pass --state-dir"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Some(Commands::Help) => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
        Some(Commands::Version) => {
            println!("devrack {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Cleanup) => {
            logging::init(cli.verbose, LogTarget::Stderr)?;
            let state_dir = match Project::load(&cli) {
                Ok(project) => project.state_dir,
                Err(err) => {
                    debug!("no project config ({:#}), using default state dir", err);
                    match cli.state_dir.clone().or_else(default_state_dir) {
                        Some(dir) => dir,
                        None => bail!("cannot determine a state directory; pass --state-dir"),
                    }
                }
            };
            let terminated = cleanup_orphans(&state_dir).await;
            println!("Terminated {} orphaned process group(s)", terminated);
            Ok(())
        }
        Some(Commands::Status) => {
            let project = Project::load(&cli)?;
            logging::init(cli.verbose, LogTarget::Stderr)?;
            let manager = project.manager(&cli)?;
            print_status(&manager).await;
            Ok(())
        }
        Some(Commands::Stop { name }) => {
            let project = Project::load(&cli)?;
            logging::init(cli.verbose, LogTarget::Stderr)?;
            let manager = project.manager(&cli)?;
            stop_servers(&manager, name.as_deref()).await
        }
        Some(Commands::Mcp) => {
            let project = Project::load(&cli)?;
            logging::init(cli.verbose, LogTarget::Stderr)?;
            run_mcp(&cli, &project).await
        }
        Some(Commands::Up { no_ui: true }) => {
            let project = Project::load(&cli)?;
            logging::init(cli.verbose, LogTarget::Stderr)?;
            run_headless(&cli, &project).await
        }
        Some(Commands::Up { no_ui: false }) | None => {
            let project = Project::load(&cli)?;
            logging::init(
                cli.verbose,
                LogTarget::File(project.state_dir.join(UI_LOG_FILE)),
            )?;
            run_tui(&cli, &project).await
        }
    }
}

async fn run_tui(cli: &Cli, project: &Project) -> Result<()> {
    let manager = project.manager(cli)?;
    let browser = project.attach_companion(cli, &manager).await;

    let (tx, mut rx) = mpsc::channel(1024);
    manager.add_log_callback(ui_log_callback(tx.clone(), manager.names()));
    manager.add_status_callback(channel_status_callback(tx.clone()));

    let mut app = App::new(manager.list_all().await);
    app.companion = manager.companion_status().await;

    let mut terminal = tui::init_terminal()?;
    spawn_input_listener(tx.clone());
    spawn_signal_listener(tx.clone());
    spawn_startup(Arc::clone(&manager), !cli.no_autostart, browser);
    if let Some(timeout) = project.config.idle_timeout() {
        spawn_idle_monitor(Arc::clone(&manager), timeout);
    }

    let refreshing = Arc::new(AtomicBool::new(false));
    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut refresh = tokio::time::interval(Duration::from_secs(1));
    let mut dirty = true;

    let result = loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                dirty = true;
                match event {
                    // The ring already holds the line; the next draw picks it up.
                    Event::Log(_) => {}
                    Event::StatusChanged => request_snapshot(&manager, &tx, &refreshing),
                    Event::Snapshot { servers, companion } => {
                        app.update_servers(servers);
                        app.companion = companion;
                    }
                    Event::Notice { message, warning } => {
                        if warning {
                            app.set_status_warning(message);
                        } else {
                            app.set_status_message(message);
                        }
                    }
                    Event::Key(key) => match app.handle_key(key) {
                        AppAction::None => {}
                        AppAction::Quit => break Ok(()),
                        AppAction::ClearLogs(name) => match manager.clear_logs(&name) {
                            Ok(()) => app.set_status_message(format!("Cleared logs of {}", name)),
                            Err(err) => app.set_status_warning(err.to_string()),
                        },
                        action => spawn_action(Arc::clone(&manager), action, tx.clone()),
                    },
                    Event::Resize { .. } => {}
                    Event::Shutdown => break Ok(()),
                }
            }
            _ = refresh.tick() => {
                dirty = true;
                request_snapshot(&manager, &tx, &refreshing);
            }
            _ = ticker.tick() => {
                if dirty {
                    dirty = false;
                    if let Err(err) = tui::draw(&mut app, &mut terminal, &manager) {
                        break Err(anyhow::Error::from(err).context("failed to draw"));
                    }
                }
            }
        }
    };

    app.set_status_warning_persistent("Stopping servers...");
    if let Err(err) = tui::draw(&mut app, &mut terminal, &manager) {
        warn!("failed to draw shutdown notice: {}", err);
    }
    manager.shutdown_all().await;
    tui::restore_terminal(terminal)?;
    result
}

async fn run_headless(cli: &Cli, project: &Project) -> Result<()> {
    let manager = project.manager(cli)?;
    let browser = project.attach_companion(cli, &manager).await;

    let mut colors: HashMap<String, String> = manager
        .list_all()
        .await
        .into_iter()
        .map(|report| (report.name, report.color))
        .collect();
    colors.insert(BROWSER_NAME.to_string(), "bright_magenta".to_string());
    manager.add_log_callback(log_callback(move |event: LogEvent| {
        let line = format_line(&event, colors.get(&event.server).map(String::as_str));
        let written = writeln!(std::io::stdout().lock(), "{}", line).map_err(anyhow::Error::from);
        async move { written }
    }));

    spawn_startup(Arc::clone(&manager), !cli.no_autostart, browser);
    if let Some(timeout) = project.config.idle_timeout() {
        spawn_idle_monitor(Arc::clone(&manager), timeout);
    }

    shutdown_signal().await;
    info!("shutting down");
    manager.announce(DEVRACK_SOURCE, "stopping servers").await;
    manager.shutdown_all().await;
    Ok(())
}

async fn run_mcp(cli: &Cli, project: &Project) -> Result<()> {
    let manager = project.manager(cli)?;
    let browser = project.attach_companion(cli, &manager).await;
    spawn_startup(Arc::clone(&manager), !cli.no_autostart, browser);
    if let Some(timeout) = project.config.idle_timeout() {
        spawn_idle_monitor(Arc::clone(&manager), timeout);
    }

    let server = McpServer::new(Arc::clone(&manager));
    let served = tokio::select! {
        result = server.serve(tokio::io::stdin(), tokio::io::stdout()) => result,
        _ = shutdown_signal() => {
            info!("signal received, leaving MCP mode");
            Ok(())
        }
    };

    if project.config.keep_alive_on_exit() {
        info!("leaving servers running for the next session");
    } else {
        manager.shutdown_all().await;
    }
    served
}

async fn print_status(manager: &Manager) {
    println!(
        "{:<16} {:<9} {:>6} {:>8} {:>9}  {}",
        "NAME", "STATUS", "PORT", "PID", "UPTIME", "ERROR"
    );
    for report in manager.list_all().await {
        let state = match report.status {
            ServerState::Running => "running",
            ServerState::External => "external",
            ServerState::Stopped => "stopped",
        };
        let pid = report.pid.map(|pid| pid.to_string()).unwrap_or_default();
        let uptime = report
            .uptime_seconds
            .map(|secs| format_duration(Duration::from_secs(secs)))
            .unwrap_or_default();
        println!(
            "{:<16} {:<9} {:>6} {:>8} {:>9}  {}",
            report.name,
            state,
            report.port,
            pid,
            uptime,
            report.error.unwrap_or_default()
        );
    }
}

async fn stop_servers(manager: &Manager, name: Option<&str>) -> Result<()> {
    if let Some(name) = name {
        let result = manager.stop(name).await;
        if result.is_error() {
            bail!(result.message);
        }
        println!("{}", result.message);
        return Ok(());
    }
    for name in manager.names() {
        let result = manager.stop(&name).await;
        match result.status {
            ActionStatus::NotRunning => debug!("{}", result.message),
            ActionStatus::Error => eprintln!("{}", result.message),
            _ => println!("{}", result.message),
        }
    }
    Ok(())
}

/// Runs autostart and the companion launch off the caller's task.
fn spawn_startup(manager: Arc<Manager>, autostart: bool, browser: bool) {
    tokio::spawn(async move {
        if autostart {
            for (name, result) in manager.autostart_configured_servers().await {
                if result.is_error() {
                    manager
                        .announce(
                            DEVRACK_SOURCE,
                            format!("autostart of {} failed: {}", name, result.message),
                        )
                        .await;
                }
            }
        }
        if browser {
            if let Err(err) = manager.launch_companion().await {
                warn!("browser companion unavailable: {}", err);
                manager
                    .announce(DEVRACK_SOURCE, format!("browser companion unavailable: {}", err))
                    .await;
            }
        }
    });
}

fn spawn_idle_monitor(manager: Arc<Manager>, timeout: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for name in manager.stop_idle(timeout).await {
                manager
                    .announce(
                        DEVRACK_SOURCE,
                        format!(
                            "stopped {} after {} without output",
                            name,
                            format_duration(timeout)
                        ),
                    )
                    .await;
            }
        }
    });
}

/// Runs a start, stop or restart without blocking the UI loop.
fn spawn_action(manager: Arc<Manager>, action: AppAction, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let result = match action {
            AppAction::Start(name) => manager.start(&name).await,
            AppAction::Stop(name) => manager.stop(&name).await,
            AppAction::Restart(name) => manager.restart(&name).await,
            AppAction::None | AppAction::Quit | AppAction::ClearLogs(_) => return,
        };
        let _ = tx
            .send(Event::Notice {
                warning: result.is_error(),
                message: result.message,
            })
            .await;
    });
}

/// Gathers a status snapshot on a separate task, at most one at a time.
///
/// Status queries wait on per-server locks that a slow stop can hold for seconds.
fn request_snapshot(manager: &Arc<Manager>, tx: &mpsc::Sender<Event>, in_flight: &Arc<AtomicBool>) {
    if in_flight.swap(true, Ordering::AcqRel) {
        return;
    }
    let manager = Arc::clone(manager);
    let tx = tx.clone();
    let in_flight = Arc::clone(in_flight);
    tokio::spawn(async move {
        let servers = manager.list_all().await;
        let companion = manager.companion_status().await;
        in_flight.store(false, Ordering::Release);
        let _ = tx.send(Event::Snapshot { servers, companion }).await;
    });
}

/// Server lines go to the UI channel; lines from devrack itself become notices.
fn ui_log_callback(tx: mpsc::Sender<Event>, servers: Vec<String>) -> LogCallback {
    let forward = channel_log_callback(tx.clone());
    log_callback(move |event: LogEvent| {
        let known = servers.iter().any(|name| name.eq_ignore_ascii_case(&event.server));
        let sent = if known {
            Some(forward(event))
        } else if event.server == BROWSER_NAME {
            None
        } else {
            let _ = tx.try_send(Event::Notice {
                message: format!("{}: {}", event.server, event.line),
                warning: false,
            });
            None
        };
        async move {
            match sent {
                Some(fut) => fut.await,
                None => Ok(()),
            }
        }
    })
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => Event::Key(key),
                Ok(crossterm::event::Event::Resize(width, height)) => {
                    Event::Resize { width, height }
                }
                _ => continue,
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(Event::Shutdown).await;
    });
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!("cannot listen for SIGTERM: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// `name | HH:MM:SS | line`, prefix colored, for servers that want prefixes.
fn format_line(event: &LogEvent, color: Option<&str>) -> String {
    if !event.prefixed {
        return event.line.clone();
    }
    let prefix = format!("{} | {} |", event.server, event.timestamp);
    format!("{} {}", apply_color(&prefix, color), event.line)
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        "bright_red" => "91",
        "bright_green" => "92",
        "bright_yellow" => "93",
        "bright_blue" => "94",
        "bright_magenta" => "95",
        "bright_cyan" => "96",
        _ => return prefix.to_string(),
    };
    format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
}
