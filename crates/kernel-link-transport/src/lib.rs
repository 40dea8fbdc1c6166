//! Channel abstraction and TCP transport for kernel sessions.
//!
//! Provides:
//! - `Connector` / `KernelChannel` - The seam between the session engine and the wire
//! - `SessionStream` - One bidirectional, ordered message stream
//! - TCP transport with newline-delimited JSON framing (feature: tcp)

pub mod channel;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use channel::{Connector, KernelChannel, OutboundSender, SessionStream, TransportError};

#[cfg(feature = "tcp")]
pub use tcp::{TcpChannel, TcpConnector};
