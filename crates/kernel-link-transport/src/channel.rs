//! Channel traits shared by every transport.

use std::{io, time::Duration};

use async_trait::async_trait;
use kernel_link_core::{ClientMessage, ServerMessage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Ordered outbound queue. Sending `None` closes the outbound side.
pub type OutboundSender = mpsc::UnboundedSender<Option<ClientMessage>>;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {address}:{port}: {source}")]
    Connect {
        address: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Timed out connecting to {address}:{port}")]
    ConnectTimeout { address: String, port: u16 },
    #[error("Session stream already opened on this channel")]
    SessionAlreadyOpen,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One live bidirectional message stream.
///
/// All writes go through `outbound`, so concurrent senders never interleave
/// partial frames. `inbound` yields messages in arrival order.
pub struct SessionStream {
    /// Ordered outbound queue.
    pub outbound: OutboundSender,
    /// Inbound messages.
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
    /// Resolves once the outbound side has flushed and closed.
    pub outbound_closed: oneshot::Receiver<()>,
}

/// Opens physical channels to a kernel.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to the kernel at `address:port`.
    async fn connect(&self, address: &str, port: u16)
    -> Result<Box<dyn KernelChannel>, TransportError>;
}

/// A physical channel to a kernel.
///
/// Shutdown follows a two-step protocol: request termination with
/// [`shutdown`](Self::shutdown) or [`shutdown_now`](Self::shutdown_now),
/// then wait for it with [`await_termination`](Self::await_termination).
#[async_trait]
pub trait KernelChannel: Send {
    /// Start the session stream. Callable once per channel.
    ///
    /// # Errors
    /// Returns error if a session is already open.
    fn open_session(&mut self) -> Result<SessionStream, TransportError>;

    /// Ask the channel to finish in-flight work and close.
    fn shutdown(&mut self);

    /// Tear the channel down without waiting for in-flight work.
    fn shutdown_now(&mut self);

    /// Wait up to `timeout` for termination. Returns `false` on timeout.
    async fn await_termination(&mut self, timeout: Duration) -> bool;

    /// Whether the channel has fully terminated.
    fn is_terminated(&self) -> bool;
}
