//! Local kernel server lifecycle.
//!
//! The kernel CLI is an interactive shell. Starting the server and its
//! discovery endpoint, and stopping them again, is done by writing commands
//! to its stdin.

use std::{
    io,
    process::{ExitStatus, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::Mutex,
    task::JoinHandle,
    time::timeout,
};

use crate::command::{CommandBuildError, CommandBuilder, quote_path};

/// Default bound for the CLI to exit after the stop commands.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Daemon error.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Command(#[from] CommandBuildError),
    #[error("Failed to spawn the kernel CLI: {0}")]
    Spawn(#[source] io::Error),
    #[error("Failed to send commands to the kernel CLI: {0}")]
    Stdin(#[source] io::Error),
    #[error("Kernel CLI did not stop within {0:?}")]
    StopTimeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How to launch the local kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Kernel CLI command line.
    pub command: String,
    /// Extra CLI arguments.
    pub args: Vec<String>,
    /// Name the kernel announces through discovery.
    pub name: String,
    /// Bound for the CLI to exit after the stop commands.
    #[serde(with = "kernel_link_core::config::duration_ms", rename = "stop_timeout_ms")]
    pub stop_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            name: "kernel-link".to_string(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl DaemonConfig {
    #[must_use]
    pub fn new(command: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// `~/.bowler/bowler-kernel`, or the bare name if there is no home directory.
fn default_command() -> String {
    dirs::home_dir()
        .map(|home| home.join(".bowler").join("bowler-kernel"))
        .and_then(|path| quote_path(&path).ok())
        .unwrap_or_else(|| "bowler-kernel".to_string())
}

struct Running {
    child: AsyncGroupChild,
    stdin: Option<ChildStdin>,
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
}

/// Starts and stops a local kernel server.
pub struct KernelDaemon {
    config: DaemonConfig,
    running: Mutex<Option<Running>>,
    started: AtomicBool,
}

impl KernelDaemon {
    #[must_use]
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Whether the kernel CLI is running.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Launch the kernel CLI and start the server and discovery endpoint.
    ///
    /// Does nothing if already started.
    ///
    /// # Errors
    /// Returns error if the CLI cannot be found, spawned, or written to.
    pub async fn ensure_started(&self) -> Result<(), DaemonError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let (program, args) = CommandBuilder::new(self.config.command.as_str())
            .extend_params(self.config.args.iter().cloned())
            .build()?
            .into_resolved()
            .await?;

        tracing::debug!(program = %program.display(), name = %self.config.name, "Starting kernel server and discovery server");
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .group_spawn()
            .map_err(DaemonError::Spawn)?;

        let stdin = child.inner().stdin.take();
        let stdout = collect(child.inner().stdout.take());
        let stderr = collect(child.inner().stderr.take());
        let mut process = Running {
            child,
            stdin,
            stdout,
            stderr,
        };

        let script = format!(
            "server start\ndiscovery start-server --name {}\n",
            self.config.name
        );
        if let Err(e) = send(&mut process, &script).await {
            tracing::error!("Failed to start the kernel server: {e}");
            let _ = process.child.kill().await;
            return Err(DaemonError::Stdin(e));
        }

        *running = Some(process);
        self.started.store(true, Ordering::Release);
        tracing::info!(name = %self.config.name, "Kernel server started");
        Ok(())
    }

    /// Stop the server and discovery endpoint and wait for the CLI to exit.
    ///
    /// Returns the CLI's exit status, or `None` if it was not running. A CLI
    /// that outlives the stop timeout is killed together with its process
    /// group.
    ///
    /// # Errors
    /// Returns [`DaemonError::StopTimeout`] if the CLI had to be killed.
    pub async fn ensure_stopped(&self) -> Result<Option<ExitStatus>, DaemonError> {
        let mut running = self.running.lock().await;
        let Some(mut process) = running.take() else {
            return Ok(None);
        };
        self.started.store(false, Ordering::Release);

        tracing::debug!("Stopping discovery server and kernel server");
        if let Err(e) = send(&mut process, "discovery stop-server\nserver stop\n").await {
            tracing::debug!("Kernel CLI stopped reading its input: {e}");
        }
        // Closing stdin lets the CLI reach end of input.
        process.stdin = None;

        let limit = self.config.stop_timeout;
        match timeout(limit, process.child.wait()).await {
            Ok(Ok(status)) => {
                if !status.success() {
                    let stdout = collected(process.stdout, limit).await;
                    let stderr = collected(process.stderr, limit).await;
                    tracing::warn!(
                        code = ?status.code(),
                        stdout = %String::from_utf8_lossy(&stdout),
                        stderr = %String::from_utf8_lossy(&stderr),
                        "Kernel server exited with non-zero exit code"
                    );
                }
                tracing::info!("Kernel server stopped");
                Ok(Some(status))
            }
            Ok(Err(e)) => Err(DaemonError::Io(e)),
            Err(_) => {
                tracing::error!("Timed out waiting for the kernel server to stop");
                if let Err(e) = process.child.kill().await {
                    tracing::debug!("Failed to kill the kernel CLI: {e}");
                }
                process.stdout.abort();
                process.stderr.abort();
                Err(DaemonError::StopTimeout(limit))
            }
        }
    }
}

impl std::fmt::Debug for KernelDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelDaemon")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

async fn send(process: &mut Running, script: &str) -> io::Result<()> {
    let stdin = process
        .stdin
        .as_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
    stdin.write_all(script.as_bytes()).await?;
    stdin.flush().await
}

fn collect<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buffer).await;
        }
        buffer
    })
}

/// Output gathered so far, or nothing if the pipe stays open past `limit`.
///
/// A surviving member of the process group can hold the pipe open.
async fn collected(mut output: JoinHandle<Vec<u8>>, limit: Duration) -> Vec<u8> {
    match timeout(limit, &mut output).await {
        Ok(collected) => collected.unwrap_or_default(),
        Err(_) => {
            output.abort();
            Vec::new()
        }
    }
}
