//! Collector lifecycle state.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectorState {
    Stopped,
    Starting,
    Running,
    Error,
    Stopping,
}

impl CollectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
            Self::Stopping => "STOPPING",
        }
    }
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a collector's state and counters returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorStatus {
    pub state: CollectorState,
    /// Cause of the most recent connection-level failure.
    pub last_error: Option<String>,
    /// Set once retries are exhausted; only an explicit `start()` clears it.
    pub terminal: bool,
    /// Consecutive failed attempts since the last successful subscribe.
    pub attempt: u32,
    pub messages_received: u64,
    pub decode_errors: u64,
    pub storage_errors: u64,
    pub resnapshots: u64,
}

impl Default for CollectorStatus {
    fn default() -> Self {
        Self {
            state: CollectorState::Stopped,
            last_error: None,
            terminal: false,
            attempt: 0,
            messages_received: 0,
            decode_errors: 0,
            storage_errors: 0,
            resnapshots: 0,
        }
    }
}
