//! Local kernel server launcher.
//!
//! Provides:
//! - `KernelDaemon` - Start and stop a kernel server through its CLI
//! - `DaemonConfig` - Which CLI to run and under what discovery name
//! - `CommandBuilder` - Shell-split command line construction

pub mod command;
pub mod daemon;

pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use daemon::{DaemonConfig, DaemonError, KernelDaemon};
