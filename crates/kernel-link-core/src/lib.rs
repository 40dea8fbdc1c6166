//! Wire protocol and shared types for kernel script sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `ClientMessage` / `ServerMessage` - Tagged wire messages
//! - `RequestId` - Correlation key for one run request
//! - `SessionConfig` - Tunables shared by the session and diff layers
//! - `RunStatus` / `ConnectionState` - Lifecycle states
//! - Executable resolution for the external tools the client drives

pub mod config;
pub mod exec;
pub mod protocol;
pub mod status;

pub use config::SessionConfig;
pub use exec::resolve_executable_path;
pub use protocol::{
    ClientMessage, ConfirmationVerdict, Credentials, FileSpec, ProjectSpec, ProtocolError, RequestId,
    ServerMessage,
};
pub use status::{ConnectionState, RunStatus};
