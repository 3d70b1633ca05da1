//! Event definitions for the terminal UI event loop.
//!
//! `LogEvent` is the payload every subscriber receives for a line of server output.
//! `Event` wraps it together with terminal input so the UI drives everything from a
//! single channel.

use chrono::Local;
use crossterm::event::KeyEvent;

use crate::manager::{CompanionStatus, StatusReport};

/// One line of output from a managed server (or an internal source such as the MCP layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Name of the server that produced the line.
    pub server: String,
    /// Local wall-clock time the line was read, `HH:MM:SS`.
    pub timestamp: String,
    /// The decoded line, ANSI sequences included.
    pub line: String,
    /// Whether renderers should prefix the line with server name and timestamp.
    pub prefixed: bool,
}

impl LogEvent {
    /// Creates an event stamped with the current local time.
    pub fn now(server: impl Into<String>, line: impl Into<String>, prefixed: bool) -> Self {
        Self {
            server: server.into(),
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            line: line.into(),
            prefixed,
        }
    }
}

/// Represents an event in the terminal UI's main loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A line of server output.
    Log(LogEvent),
    /// Some server changed state; re-query for the details.
    StatusChanged,
    /// Fresh status of every server, gathered off the UI loop.
    Snapshot {
        servers: Vec<StatusReport>,
        companion: Option<CompanionStatus>,
    },
    /// Outcome of a user action, shown in the status bar.
    Notice { message: String, warning: bool },
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// Ctrl-C or SIGTERM arrived.
    Shutdown,
}
