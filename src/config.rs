//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` project file, finds it
//! by walking up from the current directory, and turns the raw file into the
//! validated server list the manager is built from.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::companion::BROWSER_NAME;
use crate::process::ProcessTiming;

/// File name looked up when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "devrack.toml";

/// Default command for the browser companion.
pub const DEFAULT_BROWSER_COMMAND: &str = "npx @playwright/mcp@latest --headless";

const MAX_SEARCH_DEPTH: usize = 20;

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Maximum number of lines to keep in memory per server.
    pub max_lines: Option<usize>,
    /// How long a freshly spawned server must survive before it counts as started.
    pub startup_grace_ms: Option<u64>,
    /// Graceful termination wait before the process group is killed.
    pub stop_timeout_ms: Option<u64>,
    /// Stop servers that have been silent this long (0 or unset disables).
    pub idle_timeout_minutes: Option<u64>,
    /// Leave servers running when an MCP client disconnects (default: true).
    pub keep_alive_on_exit: Option<bool>,
    /// Directory for pid files and the UI log.
    pub state_dir: Option<String>,
    /// Servers to manage, in display order.
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerEntry>,
    /// Opt-in features.
    #[serde(default)]
    pub experimental: Experimental,
}

/// Raw `[[server]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub command: String,
    /// Relative to the config file's directory.
    pub working_dir: Option<String>,
    pub port: u16,
    /// Prefix output lines with name and timestamp (default: true).
    pub prefix_logs: Option<bool>,
    /// Start at boot when the port is free (default: false).
    pub autostart: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Experimental {
    pub browser: Option<bool>,
    pub browser_command: Option<String>,
}

/// A validated server definition. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    /// Absolute, `~`-expanded working directory.
    pub working_dir: PathBuf,
    pub port: u16,
    pub prefix_logs: bool,
    pub autostart: bool,
}

impl Config {
    /// Validates the server tables and resolves their working directories against `root`.
    pub fn servers(&self, root: &Path) -> Result<Vec<ServerConfig>> {
        if self.servers.is_empty() {
            bail!("no servers configured; add at least one [[server]] table");
        }
        let mut seen = HashSet::new();
        if self.browser_command().is_some() {
            seen.insert(BROWSER_NAME.to_string());
        }
        let mut servers = Vec::with_capacity(self.servers.len());
        for entry in &self.servers {
            let name = entry.name.trim();
            if name.is_empty() {
                bail!("server name must not be empty");
            }
            if !seen.insert(name.to_lowercase()) {
                bail!("duplicate server name '{}'", name);
            }
            if entry.command.trim().is_empty() {
                bail!("server '{}' has an empty command", name);
            }
            if entry.port == 0 {
                bail!("server '{}' needs a non-zero port", name);
            }
            let working_dir = match &entry.working_dir {
                Some(dir) => expand_path(dir, root),
                None => root.to_path_buf(),
            };
            servers.push(ServerConfig {
                name: name.to_string(),
                command: entry.command.trim().to_string(),
                working_dir,
                port: entry.port,
                prefix_logs: entry.prefix_logs.unwrap_or(true),
                autostart: entry.autostart.unwrap_or(false),
            });
        }
        Ok(servers)
    }

    /// Startup and shutdown timing, falling back to the defaults.
    pub fn timing(&self) -> ProcessTiming {
        let defaults = ProcessTiming::default();
        ProcessTiming {
            startup_grace: self
                .startup_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.startup_grace),
            stop_timeout: self
                .stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_timeout),
            kill_timeout: defaults.kill_timeout,
        }
    }

    /// Idle limit, `None` when idle reaping is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_minutes {
            Some(minutes) if minutes > 0 => Some(Duration::from_secs(minutes * 60)),
            _ => None,
        }
    }

    pub fn keep_alive_on_exit(&self) -> bool {
        self.keep_alive_on_exit.unwrap_or(true)
    }

    /// Command for the browser companion, if enabled.
    pub fn browser_command(&self) -> Option<String> {
        if !self.experimental.browser.unwrap_or(false) {
            return None;
        }
        Some(
            self.experimental
                .browser_command
                .clone()
                .unwrap_or_else(|| DEFAULT_BROWSER_COMMAND.to_string()),
        )
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Returns `explicit` if given, otherwise searches upward from `start`.
///
/// The search stops at the first directory containing `.git`, since the project
/// root is never above the repository root.
pub fn resolve_config_path(explicit: Option<&Path>, start: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("config file {} does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }
    let mut dir = Some(start);
    for _ in 0..MAX_SEARCH_DEPTH {
        let Some(current) = dir else { break };
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if current.join(".git").exists() {
            break;
        }
        dir = current.parent();
    }
    bail!(
        "no {} found in {} or its parent directories",
        CONFIG_FILE_NAME,
        start.display()
    )
}

/// Expands a leading `~` and makes `raw` absolute relative to `base`.
pub fn expand_path(raw: &str, base: &Path) -> PathBuf {
    let expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => {
            match home_dir() {
                Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
                None => PathBuf::from(raw),
            }
        }
        _ => PathBuf::from(raw),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
