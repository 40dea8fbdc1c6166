//! Command line building for the kernel CLI.

use std::path::PathBuf;

use kernel_link_core::resolve_executable_path;
use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for the kernel CLI command line.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base command, shell-quoted.
    pub base: String,
    /// Extra arguments appended after the base.
    pub params: Vec<String>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(more.into_iter().map(Into::into));
        self
    }

    /// Split the base and append the params.
    ///
    /// # Errors
    /// Returns error if the base cannot be parsed or is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.params.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts {
            program,
            args: parts,
        })
    }
}

/// Quote a filesystem path for use as a base command.
///
/// # Errors
/// Returns error if the path contains a NUL byte.
pub fn quote_path(path: &std::path::Path) -> Result<String, CommandBuildError> {
    let path = path.to_string_lossy();
    Ok(shlex::try_quote(&path)?.into_owned())
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn test_build_splits_quoted_base() {
        let parts = CommandBuilder::new("sh -c 'echo hi'")
            .extend_params(["extra"])
            .build()
            .unwrap();
        assert_eq!(parts.program, "sh");
        assert_eq!(parts.args, vec!["-c", "echo hi", "extra"]);
    }

    #[test]
    fn test_empty_base_is_rejected() {
        assert!(matches!(
            CommandBuilder::new("   ").build(),
            Err(CommandBuildError::EmptyCommand)
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_unbalanced_quotes_are_rejected() {
        assert!(matches!(
            CommandBuilder::new("kernel 'oops").build(),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_quoted_path_survives_splitting() {
        let base = quote_path(Path::new("/opt/my kernel/bin/bowler-kernel")).unwrap();
        let parts = CommandBuilder::new(base).build().unwrap();
        assert_eq!(parts.program, "/opt/my kernel/bin/bowler-kernel");
        assert!(parts.args.is_empty());
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let parts = CommandBuilder::new("definitely-not-a-kernel-cli-xyz")
            .build()
            .unwrap();
        assert!(matches!(
            parts.into_resolved().await,
            Err(CommandBuildError::NotFound(name)) if name == "definitely-not-a-kernel-cli-xyz"
        ));
    }
}
