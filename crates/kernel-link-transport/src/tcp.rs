//! TCP transport with newline-delimited JSON framing.

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use kernel_link_core::{
    ClientMessage, ServerMessage,
    protocol::{decode_frame, encode_line},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};

use crate::channel::{Connector, KernelChannel, OutboundSender, SessionStream, TransportError};

/// Default bound for establishing the TCP connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound for one inbound frame, newline included.
pub const DEFAULT_MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Opens plaintext TCP channels.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    max_frame_len: u64,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnector {
    /// Create a connector with the default connect timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Override the inbound frame bound. Longer frames are skipped.
    #[must_use]
    pub const fn with_max_frame_len(mut self, max_frame_len: u64) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
        port: u16,
    ) -> Result<Box<dyn KernelChannel>, TransportError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect((address, port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    address: address.to_string(),
                    port,
                    source,
                });
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    address: address.to_string(),
                    port,
                });
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(
            TcpChannel::new(stream)?.with_max_frame_len(self.max_frame_len),
        ))
    }
}

/// A TCP channel to a kernel.
///
/// Opening the session spawns one writer task that drains the outbound queue
/// and one reader task that decodes inbound frames.
pub struct TcpChannel {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    max_frame_len: u64,
    outbound: Option<OutboundSender>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpChannel {
    /// Wrap a connected stream.
    ///
    /// # Errors
    /// Returns error if the peer address is unavailable.
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            peer,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound: None,
            tasks: Vec::new(),
        })
    }

    /// Override the inbound frame bound. Longer frames are skipped.
    #[must_use]
    pub const fn with_max_frame_len(mut self, max_frame_len: u64) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// The kernel's socket address.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl KernelChannel for TcpChannel {
    fn open_session(&mut self) -> Result<SessionStream, TransportError> {
        let stream = self.stream.take().ok_or(TransportError::SessionAlreadyOpen)?;
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();

        let peer = self.peer;
        self.tasks
            .push(tokio::spawn(write_loop(write_half, outbound_rx, closed_tx, peer)));
        self.tasks
            .push(tokio::spawn(read_loop(
                read_half,
                inbound_tx,
                self.max_frame_len,
                peer,
            )));
        self.outbound = Some(outbound_tx.clone());

        Ok(SessionStream {
            outbound: outbound_tx,
            inbound: inbound_rx,
            outbound_closed: closed_rx,
        })
    }

    fn shutdown(&mut self) {
        // Half-close and let the reader run to the kernel's EOF.
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(None);
        }
        // A session that was never opened has nothing to drain.
        self.stream = None;
    }

    fn shutdown_now(&mut self) {
        self.outbound = None;
        self.stream = None;
        for task in &self.tasks {
            task.abort();
        }
    }

    async fn await_termination(&mut self, limit: Duration) -> bool {
        let tasks = &mut self.tasks;
        let drained = timeout(limit, async {
            while let Some(task) = tasks.last_mut() {
                let _ = task.await;
                tasks.pop();
            }
        })
        .await;
        drained.is_ok()
    }

    fn is_terminated(&self) -> bool {
        self.stream.is_none() && self.tasks.iter().all(JoinHandle::is_finished)
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Option<ClientMessage>>,
    closed: oneshot::Sender<()>,
    peer: SocketAddr,
) {
    while let Some(Some(message)) = outbound.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(request_id = %message.request_id(), "Failed to encode message: {e}");
                continue;
            }
        };
        tracing::debug!(%peer, request_id = %message.request_id(), "Sending: {line}");
        if let Err(e) = write_frame(&mut writer, &line).await {
            tracing::error!(%peer, "Failed to write to kernel: {e}");
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(%peer, "Failed to half-close the outbound stream: {e}");
    }
    let _ = closed.send(());
    tracing::debug!(%peer, "Outbound stream ended");
}

async fn write_frame(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_loop(
    reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    max_frame_len: u64,
    peer: SocketAddr,
) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        let mut frame = (&mut reader).take(max_frame_len);
        match frame.read_until(b'\n', &mut buffer).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                if frame.limit() == 0 && !buffer.ends_with(b"\n") {
                    tracing::warn!(%peer, "Dropping frame longer than {max_frame_len} bytes");
                    match skip_line(&mut reader).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            tracing::error!(%peer, "Error reading from kernel: {e}");
                            break;
                        }
                    }
                }
                if buffer.trim_ascii().is_empty() {
                    continue;
                }
                match decode_frame::<ServerMessage>(&buffer) {
                    Ok(message) => {
                        tracing::debug!(%peer, request_id = %message.request_id(), "Received: {}", String::from_utf8_lossy(buffer.trim_ascii()));
                        if inbound.send(message).is_err() {
                            tracing::debug!(%peer, "Inbound receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%peer, "Dropping malformed frame: {e}");
                    }
                }
            }
            Err(e) => {
                tracing::error!(%peer, "Error reading from kernel: {e}");
                break;
            }
        }
    }
    tracing::debug!(%peer, "Inbound stream ended");
}

/// Discard input up to and including the next newline.
///
/// Returns `false` if the stream ended first.
async fn skip_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<bool> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(false);
        }
        let (consumed, found) = available
            .iter()
            .position(|&byte| byte == b'\n')
            .map_or((available.len(), false), |newline| (newline + 1, true));
        reader.consume(consumed);
        if found {
            return Ok(true);
        }
    }
}
