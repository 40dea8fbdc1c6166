//! Lifecycle states for connections and run requests.

use serde::{Deserialize, Serialize};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel is open.
    #[default]
    Disconnected,
    /// A channel is being opened.
    Connecting,
    /// The session stream is live.
    Connected,
    /// The outbound side was closed and the channel is being torn down.
    Draining,
}

impl ConnectionState {
    /// Whether requests may be submitted.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Run request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting on the kernel.
    Running,
    /// The kernel reported script output.
    Succeeded,
    /// The kernel reported an error, or the connection was lost.
    Failed,
    /// Local tracking was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}
