//! Session configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Default bound for each disconnect phase (drain, graceful, forced).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound for a single git invocation.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables shared by the session engine and the diff provider.
///
/// Deserializes from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound for each disconnect phase.
    #[serde(with = "duration_ms", rename = "shutdown_timeout_ms")]
    pub shutdown_timeout: Duration,

    /// Bound for a single git invocation.
    #[serde(with = "duration_ms", rename = "git_timeout_ms")]
    pub git_timeout: Duration,

    /// Name of the remote whose tracking branch is the diff baseline.
    pub remote_name: String,

    /// Explicit git executable. Resolved from `PATH` when unset.
    pub git_executable: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            git_timeout: DEFAULT_GIT_TIMEOUT,
            remote_name: "origin".to_string(),
            git_executable: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the disconnect phase timeout.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Override the git invocation timeout.
    #[must_use]
    pub const fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    /// Override the baseline remote.
    #[must_use]
    pub fn with_remote_name(mut self, remote: impl Into<String>) -> Self {
        self.remote_name = remote.into();
        self
    }

    /// Use an explicit git executable.
    #[must_use]
    pub fn with_git_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.git_executable = Some(path.into());
        self
    }
}

/// Serde adapter for a [`Duration`] stored as whole milliseconds.
///
/// Use with `#[serde(with = "kernel_link_core::config::duration_ms")]`.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// # Errors
    /// Returns the serializer's error.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// # Errors
    /// Returns error if the value is not an unsigned integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
