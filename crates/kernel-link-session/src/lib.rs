//! Connection lifecycle and request multiplexing for kernel sessions.
//!
//! Provides:
//! - `ConnectionManager` - Owns the single kernel connection (connect, drain, forced shutdown)
//! - `SessionMultiplexer` - Correlates many run requests over one stream
//! - `RunProcess` - Waitable, cancellable handle for one script run
//! - Prompt policies for credentials and confirmation requests
//! - `ClientContext` / `KernelClient` - Explicit wiring for hosts

pub mod client;
pub mod context;
pub mod manager;
pub mod multiplexer;
pub mod process;
pub mod prompts;

#[cfg(test)]
mod test_support;

pub use client::{KernelClient, RunScriptError};
pub use context::ClientContext;
pub use manager::{ConnectionError, ConnectionManager, Endpoint};
pub use multiplexer::{SessionMultiplexer, SubmitError};
pub use process::{RunOutcome, RunProcess, StillRunning};
pub use prompts::{
    AutoApprove, ConfirmationPolicy, Credentials, CredentialsProvider, DenyAll, NoCredentials,
    PromptError, PromptPolicies,
};
