//! Executable resolution for external tools.

use std::path::{Path, PathBuf};

/// Resolve an executable by name or path.
///
/// The search order is:
/// 1. Explicit paths (absolute, or relative with a separator) that exist.
/// 2. The current process PATH via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let found = which_async(executable).await;
    if found.is_none() {
        tracing::debug!(executable, "Executable not found on PATH");
    }
    found
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
