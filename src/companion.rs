//! Optional companion processes that share the servers' notification channel.
//!
//! The only companion today is the headless browser driver. It is deliberately
//! degraded: a failed launch leaves it uninitialized and never affects the servers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use crate::config::ServerConfig;
use crate::notify::OutputSink;
use crate::process::{ManagedProcess, ProcessTiming, StartOutcome};
use crate::state::StateStore;

/// Name the browser driver logs and persists its pid under.
pub const BROWSER_NAME: &str = "browser";

#[async_trait]
pub trait Companion: Send {
    fn name(&self) -> &str;

    /// Whether the companion is up and usable right now.
    fn is_initialized(&mut self) -> bool;

    async fn launch(&mut self, sink: Arc<dyn OutputSink>) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;
}

/// Runs a browser automation driver (Playwright MCP by default) as a managed child.
pub struct BrowserDriver {
    process: ManagedProcess,
}

impl BrowserDriver {
    pub fn new(
        command: String,
        working_dir: PathBuf,
        store: Arc<StateStore>,
        timing: ProcessTiming,
        max_lines: usize,
    ) -> Self {
        let config = ServerConfig {
            name: BROWSER_NAME.to_string(),
            command,
            working_dir,
            port: 0,
            prefix_logs: true,
            autostart: false,
        };
        Self {
            process: ManagedProcess::new(config, "bright_magenta", store, timing, max_lines),
        }
    }
}

#[async_trait]
impl Companion for BrowserDriver {
    fn name(&self) -> &str {
        self.process.name()
    }

    fn is_initialized(&mut self) -> bool {
        self.process.is_running()
    }

    async fn launch(&mut self, sink: Arc<dyn OutputSink>) -> Result<()> {
        match self.process.start(sink).await {
            StartOutcome::Started { pid } => {
                if !self.process.is_running() {
                    bail!("browser driver exited right after launch");
                }
                info!("browser driver running (pid {})", pid);
                Ok(())
            }
            StartOutcome::AlreadyRunning { .. } => Ok(()),
            StartOutcome::Failed { error } => bail!("browser driver failed to launch: {}", error),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.process.stop().await;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::notify::Notifier;

    fn driver(command: &str, dir: &tempfile::TempDir) -> BrowserDriver {
        let store = Arc::new(StateStore::open(dir.path(), dir.path()).unwrap());
        let timing = ProcessTiming {
            startup_grace: Duration::from_millis(200),
            ..ProcessTiming::default()
        };
        BrowserDriver::new(command.into(), dir.path().to_path_buf(), store, timing, 50)
    }

    #[tokio::test]
    async fn launch_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut browser = driver("sleep 5", &dir);
        assert!(!browser.is_initialized());
        browser.launch(Arc::new(Notifier::new())).await.unwrap();
        assert!(browser.is_initialized());
        assert_eq!(browser.name(), BROWSER_NAME);
        browser.shutdown().await.unwrap();
        assert!(!browser.is_initialized());
    }

    #[tokio::test]
    async fn failed_launch_leaves_it_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let mut browser = driver("exit 2", &dir);
        let err = browser.launch(Arc::new(Notifier::new())).await.unwrap_err();
        assert!(err.to_string().contains("code 2"), "{err}");
        assert!(!browser.is_initialized());

        let mut quick = driver("true", &dir);
        assert!(quick.launch(Arc::new(Notifier::new())).await.is_err());
    }
}
