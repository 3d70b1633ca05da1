//! Diagnostic logging setup.
//!
//! Diagnostics never share a stream with program output: MCP owns stdout and the
//! terminal UI owns the screen, so logs go to stderr or to a file.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// Where diagnostics are written.
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    /// Appended to; used while the terminal UI is up.
    File(PathBuf),
}

/// Installs the global subscriber. `RUST_LOG` overrides the level.
pub fn init(verbose: bool, target: LogTarget) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match target {
        LogTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
    };
    installed.map_err(|err| anyhow!("failed to install logger: {}", err))
}
