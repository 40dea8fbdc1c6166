//! Host-facing script runner.

use std::{path::Path, sync::Arc};

use kernel_link_git::{DiffError, DiffProvider};
use thiserror::Error;

use crate::{
    manager::ConnectionManager,
    multiplexer::SubmitError,
    process::RunProcess,
};

/// Error starting a script run.
#[derive(Debug, Error)]
pub enum RunScriptError {
    #[error("Failed to compute the project diff: {0}")]
    Diff(#[from] DiffError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Runs project scripts on the connected kernel.
#[derive(Debug, Clone)]
pub struct KernelClient {
    connections: Arc<ConnectionManager>,
    diff: Arc<DiffProvider>,
}

impl KernelClient {
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>, diff: Arc<DiffProvider>) -> Self {
        Self { connections, diff }
    }

    /// Run `script_file` from the git project at `project_dir`.
    ///
    /// The kernel checks out the project's remote-tracking revision, applies
    /// the staged diff and runs the script.
    ///
    /// # Errors
    /// Returns [`SubmitError::NotConnected`] if no connection is live, or a
    /// diff error if the project state cannot be computed. Nothing is sent to
    /// the kernel in either case.
    pub async fn run_script(
        &self,
        project_dir: &Path,
        script_file: &Path,
    ) -> Result<RunProcess, RunScriptError> {
        if !self.connections.is_connected() {
            return Err(SubmitError::NotConnected.into());
        }
        let file = self
            .diff
            .compute_file_spec(project_dir, script_file)
            .await?;
        tracing::info!(
            path = %file.path,
            revision = %file.project.revision,
            patch_bytes = file.project.patch.len(),
            "Running script"
        );
        Ok(self.connections.submit_run(file)?)
    }
}
