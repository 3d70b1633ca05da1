//! Application state and UI logic.
//!
//! `App` holds what the terminal UI shows: the latest status snapshot of every
//! server, which one is selected, and how far the log pane is scrolled back. Key
//! presses become `AppAction`s that the event loop runs against the manager.

use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::manager::{CompanionStatus, ServerState, StatusReport};

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    None,
    Quit,
    Start(String),
    Stop(String),
    Restart(String),
    ClearLogs(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// The main application state container.
#[derive(Debug)]
pub struct App {
    /// Latest status of every server, in configuration order.
    pub servers: Vec<StatusReport>,
    pub companion: Option<CompanionStatus>,
    /// Index of the currently selected server.
    pub selected: usize,
    /// Lines scrolled back from the newest one; 0 while following.
    pub scroll: usize,
    pub follow: bool,
    pub show_help: bool,
    /// Height of the log pane, updated on every draw.
    pub log_view_height: usize,
    /// Ring length seen at the previous draw.
    seen_total: usize,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(servers: Vec<StatusReport>) -> Self {
        Self {
            servers,
            companion: None,
            selected: 0,
            scroll: 0,
            follow: true,
            show_help: false,
            log_view_height: 0,
            seen_total: 0,
            status_message: None,
        }
    }

    pub fn selected_server(&self) -> Option<&StatusReport> {
        self.servers.get(self.selected)
    }

    /// Replaces the status snapshot, keeping the selection in range.
    pub fn update_servers(&mut self, servers: Vec<StatusReport>) {
        self.servers = servers;
        if self.selected >= self.servers.len() {
            self.selected = self.servers.len().saturating_sub(1);
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if self.show_help {
            if matches!(key.code, KeyCode::Char('?') | KeyCode::Esc | KeyCode::Char('q')) {
                self.show_help = false;
            }
            return AppAction::None;
        }
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return AppAction::Quit;
        }
        match key.code {
            KeyCode::Char('q') => AppAction::Quit,
            KeyCode::Up | KeyCode::Char('k') => {
                if self.selected > 0 {
                    self.selected -= 1;
                    self.reset_scroll();
                }
                AppAction::None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < self.servers.len() {
                    self.selected += 1;
                    self.reset_scroll();
                }
                AppAction::None
            }
            KeyCode::Char('s') => self.on_selected(AppAction::Start),
            KeyCode::Char('x') => self.on_selected(AppAction::Stop),
            KeyCode::Char('r') => self.on_selected(AppAction::Restart),
            KeyCode::Char('c') => {
                self.reset_scroll();
                self.on_selected(AppAction::ClearLogs)
            }
            KeyCode::Char('f') | KeyCode::End => {
                if self.follow && key.code == KeyCode::Char('f') {
                    self.follow = false;
                } else {
                    self.reset_scroll();
                }
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = true;
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn on_selected(&self, action: fn(String) -> AppAction) -> AppAction {
        match self.selected_server() {
            Some(server) => action(server.name.clone()),
            None => AppAction::None,
        }
    }

    fn reset_scroll(&mut self) {
        self.scroll = 0;
        self.follow = true;
    }

    pub fn scroll_up(&mut self, amount: usize) {
        self.scroll = self.scroll.saturating_add(amount);
        self.follow = false;
    }

    pub fn scroll_down(&mut self, amount: usize) {
        self.scroll = self.scroll.saturating_sub(amount);
        if self.scroll == 0 {
            self.follow = true;
        }
    }

    /// Clamps the scroll position against the current ring size.
    ///
    /// Following readers stay pinned to the newest line; a reader who scrolled back
    /// keeps looking at the same lines while new output arrives.
    pub fn clamp_scroll(&mut self, total: usize) {
        let grown_by = total.saturating_sub(self.seen_total);
        self.seen_total = total;
        let view = self.log_view_height.max(1);
        let max_scroll = total.saturating_sub(view);
        if self.follow {
            self.scroll = 0;
        } else {
            self.scroll = self.scroll.saturating_add(grown_by).min(max_scroll);
        }
    }

    pub fn status_line(&self) -> String {
        let Some(server) = self.selected_server() else {
            return "No servers".to_string();
        };
        let state = match server.status {
            ServerState::Running => "running",
            ServerState::External => "external",
            ServerState::Stopped if server.error.is_some() => "error",
            ServerState::Stopped => "stopped",
        };
        let pid = server
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into());
        let uptime = server
            .uptime_seconds
            .map(|secs| format_duration(Duration::from_secs(secs)))
            .unwrap_or_else(|| "-".into());
        let mut line = format!(
            "{} | {} | port: {} | pid: {} | uptime: {} | follow: {}",
            server.name,
            state,
            server.port,
            pid,
            uptime,
            if self.follow { "on" } else { "off" }
        );
        if let Some(companion) = &self.companion {
            line.push_str(&format!(
                " | {}: {}",
                companion.name,
                if companion.initialized { "ready" } else { "off" }
            ));
        }
        line
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(
            message,
            StatusLevel::Warning,
            Some(Duration::from_secs(6)),
        );
    }

    pub fn set_status_warning_persistent(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, None);
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
