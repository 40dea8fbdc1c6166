//! Project diff computation.
//!
//! A run request carries the project as `(remote URL, remote-tracking
//! revision, patch)`. The kernel clones the remote at that revision and
//! applies the patch, so the baseline is the remote-tracking ref and not
//! the local `HEAD`. Only staged changes are included.

use std::{
    path::{Component, Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use kernel_link_core::{FileSpec, ProjectSpec, SessionConfig, resolve_executable_path};
use thiserror::Error;
use tokio::{process::Command, sync::OnceCell, time::timeout};

use crate::remote::normalize_remote_url;

/// Diff computation error.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Git executable not found: {0}")]
    GitNotFound(String),
    #[error(
        "No remote baseline: {remote}/{branch} does not exist. Do you have unpushed commits and an empty remote?"
    )]
    NoRemoteBaseline { remote: String, branch: String },
    #[error("HEAD is detached; check out a branch that tracks {0}")]
    DetachedHead(String),
    #[error("Script {script} is not inside project {project}")]
    ScriptOutsideProject { script: PathBuf, project: PathBuf },
    #[error("git {args} exited with {code:?}: {stderr}")]
    GitFailed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("git {args} timed out after {timeout:?}")]
    Timeout { args: String, timeout: Duration },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Computes the project state a script run is submitted with.
#[derive(Debug)]
pub struct DiffProvider {
    git_override: Option<PathBuf>,
    git: OnceCell<PathBuf>,
    remote: String,
    timeout: Duration,
}

impl Default for DiffProvider {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

impl DiffProvider {
    /// Create a provider from the session configuration.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            git_override: config.git_executable.clone(),
            git: OnceCell::new(),
            remote: config.remote_name.clone(),
            timeout: config.git_timeout,
        }
    }

    /// Compute the file spec for `script_file` within `project_dir`.
    ///
    /// # Errors
    /// Returns [`DiffError::NoRemoteBaseline`] if the current branch has no
    /// remote-tracking ref, or another error if git fails.
    pub async fn compute_file_spec(
        &self,
        project_dir: &Path,
        script_file: &Path,
    ) -> Result<FileSpec, DiffError> {
        let path = relative_script_path(project_dir, script_file)?;
        tracing::debug!(project = %project_dir.display(), path, "Computing file spec");

        let repo_remote = self.remote_url(project_dir).await?;
        let revision = self.remote_head(project_dir).await?;
        let patch = self.staged_diff(project_dir).await?;

        Ok(FileSpec {
            path,
            project: ProjectSpec {
                repo_remote,
                revision,
                patch,
            },
        })
    }

    /// The HTTPS URL of the baseline remote.
    ///
    /// # Errors
    /// Returns error if the remote is not configured.
    pub async fn remote_url(&self, project_dir: &Path) -> Result<String, DiffError> {
        let url = self
            .git_text(project_dir, &["remote", "get-url", &self.remote])
            .await?;
        Ok(normalize_remote_url(&url))
    }

    /// The current branch name.
    ///
    /// # Errors
    /// Returns error if `HEAD` is detached or git fails.
    pub async fn branch_name(&self, project_dir: &Path) -> Result<String, DiffError> {
        let branch = self
            .git_text(project_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        if branch == "HEAD" {
            return Err(DiffError::DetachedHead(self.remote.clone()));
        }
        Ok(branch)
    }

    /// The commit `<remote>/<branch>` points to.
    ///
    /// # Errors
    /// Returns [`DiffError::NoRemoteBaseline`] if the ref does not exist.
    pub async fn remote_head(&self, project_dir: &Path) -> Result<String, DiffError> {
        let tracking = self.tracking_ref(project_dir).await?;
        self.git_text(project_dir, &["rev-parse", "--verify", &tracking])
            .await
    }

    /// The diff between the remote-tracking revision and the index.
    ///
    /// # Errors
    /// Returns [`DiffError::NoRemoteBaseline`] if the ref does not exist.
    pub async fn staged_diff(&self, project_dir: &Path) -> Result<Vec<u8>, DiffError> {
        let tracking = self.tracking_ref(project_dir).await?;
        self.git(
            project_dir,
            &[
                "diff",
                "--cached",
                "--no-color",
                "--no-ext-diff",
                &tracking,
                "--",
            ],
        )
        .await
    }

    async fn tracking_ref(&self, project_dir: &Path) -> Result<String, DiffError> {
        let branch = self.branch_name(project_dir).await?;
        let full = format!("refs/remotes/{}/{branch}", self.remote);
        match self
            .git(project_dir, &["rev-parse", "--verify", "--quiet", &full])
            .await
        {
            Ok(_) => Ok(format!("{}/{branch}", self.remote)),
            Err(DiffError::GitFailed { .. }) => Err(DiffError::NoRemoteBaseline {
                remote: self.remote.clone(),
                branch,
            }),
            Err(e) => Err(e),
        }
    }

    async fn git_text(&self, dir: &Path, args: &[&str]) -> Result<String, DiffError> {
        let stdout = self.git(dir, args).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<Vec<u8>, DiffError> {
        let program = self.git_program().await?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(DiffError::Io(e)),
            Err(_) => {
                return Err(DiffError::Timeout {
                    args: args.join(" "),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::debug!(
                dir = %dir.display(),
                args = %args.join(" "),
                code = ?output.status.code(),
                %stderr,
                "git exited with a non-zero exit code"
            );
            return Err(DiffError::GitFailed {
                args: args.join(" "),
                code: output.status.code(),
                stderr,
            });
        }
        Ok(output.stdout)
    }

    async fn git_program(&self) -> Result<&PathBuf, DiffError> {
        self.git
            .get_or_try_init(|| async {
                let name = self
                    .git_override
                    .as_ref()
                    .map_or_else(|| "git".to_string(), |p| p.to_string_lossy().into_owned());
                resolve_executable_path(&name)
                    .await
                    .ok_or(DiffError::GitNotFound(name))
            })
            .await
    }
}

/// The script path relative to the project root, `/`-separated.
fn relative_script_path(project_dir: &Path, script_file: &Path) -> Result<String, DiffError> {
    let relative = script_file.strip_prefix(project_dir).map(Path::to_path_buf).or_else(|_| {
        let project = project_dir.canonicalize()?;
        let script = script_file.canonicalize()?;
        script
            .strip_prefix(&project)
            .map(Path::to_path_buf)
            .map_err(|_| outside(project_dir, script_file))
    });
    let relative = relative.map_err(|e| match e {
        DiffError::Io(_) => outside(project_dir, script_file),
        other => other,
    })?;

    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return Err(outside(project_dir, script_file));
    }
    Ok(parts.join("/"))
}

fn outside(project_dir: &Path, script_file: &Path) -> DiffError {
    DiffError::ScriptOutsideProject {
        script: script_file.to_path_buf(),
        project: project_dir.to_path_buf(),
    }
}
