//! Connection lifecycle.
//!
//! A single actor task owns the live channel. Callers send it commands over
//! an unbounded queue and wait on a oneshot reply, so connect and disconnect
//! are serialized without holding a lock across I/O. The current state is
//! published on a watch channel, which keeps `is_connected` non-blocking.

use std::{fmt, sync::Arc, time::Duration};

use kernel_link_core::{ConnectionState, FileSpec, SessionConfig};
use kernel_link_transport::{Connector, KernelChannel, OutboundSender, TransportError};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    multiplexer::{SessionMultiplexer, SubmitError},
    process::RunProcess,
    prompts::PromptPolicies,
};

/// Address of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Connection error.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Channel to {endpoint} did not terminate; the connection is still open")]
    ShutdownFailed { endpoint: Endpoint },
    #[error("Connection manager has stopped")]
    ManagerStopped,
}

/// Called with the endpoint on connect and with `None` on disconnect.
pub type ConnectionListener = Box<dyn Fn(Option<&Endpoint>) + Send + Sync>;

type Reply = oneshot::Sender<Result<(), ConnectionError>>;

enum Command {
    Connect { endpoint: Endpoint, reply: Reply },
    Disconnect { reply: Reply },
    AddListener(ConnectionListener),
}

#[derive(Clone, Default)]
struct Snapshot {
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    session: Option<SessionMultiplexer>,
}

/// Owns at most one live connection to a kernel.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ConnectionManager {
    /// Create a manager and spawn its actor task.
    ///
    /// Must be called from within a Tokio runtime. The actor exits once the
    /// manager is dropped, tearing down any live channel.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &SessionConfig,
        prompts: PromptPolicies,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(Snapshot::default());
        let actor = Actor {
            connector,
            prompts,
            shutdown_timeout: config.shutdown_timeout,
            listeners: Vec::new(),
            live: None,
            snapshot: snapshot_tx,
        };
        tokio::spawn(actor.run(rx));
        Self { commands, snapshot }
    }

    /// Connect to the kernel at `address:port`.
    ///
    /// Does nothing if a connection is already live.
    ///
    /// # Errors
    /// Returns error if the channel cannot be opened.
    pub async fn connect(
        &self,
        address: impl Into<String>,
        port: u16,
    ) -> Result<(), ConnectionError> {
        let endpoint = Endpoint::new(address, port);
        self.request(|reply| Command::Connect { endpoint, reply })
            .await
    }

    /// Drain and close the live connection.
    ///
    /// Each phase (outbound drain, graceful shutdown, forced shutdown) is
    /// bounded by the configured shutdown timeout. Does nothing if not
    /// connected.
    ///
    /// # Errors
    /// Returns [`ConnectionError::ShutdownFailed`] if the channel survives a
    /// forced shutdown. The connection stays open and the call may be retried.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Whether a connection is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().state.is_connected()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// The endpoint of the live connection.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.snapshot.borrow().endpoint.clone()
    }

    /// The session of the live connection.
    #[must_use]
    pub fn session(&self) -> Option<SessionMultiplexer> {
        let snapshot = self.snapshot.borrow();
        if snapshot.state.is_connected() {
            snapshot.session.clone()
        } else {
            None
        }
    }

    /// Register a listener for connection changes.
    ///
    /// Listeners run in registration order on the actor task and are never
    /// removed.
    pub fn add_connection_listener(
        &self,
        listener: impl Fn(Option<&Endpoint>) + Send + Sync + 'static,
    ) {
        if self
            .commands
            .send(Command::AddListener(Box::new(listener)))
            .is_err()
        {
            tracing::warn!("Connection manager has stopped, listener not registered");
        }
    }

    /// Submit a run request on the live connection.
    ///
    /// # Errors
    /// Returns [`SubmitError::NotConnected`] if no connection is live.
    pub fn submit_run(&self, file: FileSpec) -> Result<RunProcess, SubmitError> {
        self.session()
            .ok_or(SubmitError::NotConnected)?
            .submit(file)
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ConnectionError::ManagerStopped)?;
        rx.await.map_err(|_| ConnectionError::ManagerStopped)?
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.borrow();
        f.debug_struct("ConnectionManager")
            .field("state", &snapshot.state)
            .field("endpoint", &snapshot.endpoint)
            .finish_non_exhaustive()
    }
}

struct Live {
    endpoint: Endpoint,
    channel: Box<dyn KernelChannel>,
    session: SessionMultiplexer,
    outbound: OutboundSender,
    outbound_closed: Option<oneshot::Receiver<()>>,
    connection: CancellationToken,
}

struct Actor {
    connector: Arc<dyn Connector>,
    prompts: PromptPolicies,
    shutdown_timeout: Duration,
    listeners: Vec<ConnectionListener>,
    live: Option<Live>,
    snapshot: watch::Sender<Snapshot>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect { endpoint, reply } => {
                    let result = self.connect(endpoint).await;
                    let _ = reply.send(result);
                }
                Command::Disconnect { reply } => {
                    let result = self.disconnect().await;
                    let _ = reply.send(result);
                }
                Command::AddListener(listener) => self.listeners.push(listener),
            }
        }
        self.teardown();
    }

    async fn connect(&mut self, endpoint: Endpoint) -> Result<(), ConnectionError> {
        if let Some(live) = &self.live {
            if live.session.is_closed() {
                tracing::warn!(current = %live.endpoint, requested = %endpoint, "Kernel closed the session; disconnect before connecting again");
            } else {
                tracing::debug!(current = %live.endpoint, requested = %endpoint, "Already connected");
            }
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let live = match open(&self.connector, &self.prompts, endpoint).await {
            Ok(live) => live,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let endpoint = live.endpoint.clone();
        self.snapshot.send_replace(Snapshot {
            state: ConnectionState::Connected,
            endpoint: Some(endpoint.clone()),
            session: Some(live.session.clone()),
        });
        self.live = Some(live);

        tracing::info!(address = %endpoint.address, port = endpoint.port, "Connected to kernel");
        self.notify(Some(&endpoint));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        let Some(mut live) = self.live.take() else {
            tracing::debug!("Not connected, nothing to disconnect");
            return Ok(());
        };
        let limit = self.shutdown_timeout;
        let endpoint = live.endpoint.clone();
        self.set_state(ConnectionState::Draining);

        // End of stream: the kernel sees the half-close after queued messages.
        let _ = live.outbound.send(None);
        if let Some(closed) = live.outbound_closed.as_mut() {
            if timeout(limit, closed).await.is_ok() {
                live.outbound_closed = None;
            } else {
                tracing::warn!(%endpoint, "Outbound stream did not complete within {limit:?}, cancelling outstanding requests");
                live.connection.cancel();
            }
        }

        live.channel.shutdown();
        if !live.channel.await_termination(limit).await {
            tracing::warn!(%endpoint, "Channel did not shut down within {limit:?}, forcing");
            live.channel.shutdown_now();
            if !live.channel.await_termination(limit).await {
                tracing::error!(%endpoint, "Channel did not terminate after forced shutdown");
                self.set_state(ConnectionState::Connected);
                self.live = Some(live);
                return Err(ConnectionError::ShutdownFailed { endpoint });
            }
        }

        live.connection.cancel();
        self.snapshot.send_replace(Snapshot::default());
        tracing::info!(address = %endpoint.address, port = endpoint.port, "Disconnected from kernel");
        self.notify(None);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut live) = self.live.take() {
            tracing::debug!(endpoint = %live.endpoint, "Connection manager dropped, closing channel");
            live.connection.cancel();
            live.channel.shutdown_now();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.snapshot.send_modify(|snapshot| snapshot.state = state);
    }

    fn notify(&self, endpoint: Option<&Endpoint>) {
        for listener in &self.listeners {
            listener(endpoint);
        }
    }
}

/// Open a channel and start its session.
async fn open(
    connector: &Arc<dyn Connector>,
    prompts: &PromptPolicies,
    endpoint: Endpoint,
) -> Result<Live, ConnectionError> {
    let mut channel = connector
        .connect(&endpoint.address, endpoint.port)
        .await?;
    let stream = match channel.open_session() {
        Ok(stream) => stream,
        Err(e) => {
            channel.shutdown_now();
            return Err(e.into());
        }
    };

    let connection = CancellationToken::new();
    let session = SessionMultiplexer::start(
        stream.inbound,
        stream.outbound.clone(),
        prompts.clone(),
        connection.clone(),
    );
    Ok(Live {
        endpoint,
        channel,
        session,
        outbound: stream.outbound,
        outbound_closed: Some(stream.outbound_closed),
        connection,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use kernel_link_core::{ClientMessage, ConfirmationVerdict, RequestId, ServerMessage};
    use kernel_link_transport::TcpConnector;
    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::TcpListener,
    };

    use super::*;
    use crate::{
        prompts::DenyAll,
        test_support::{FakeKernel, StuckConnector, echo, file},
    };

    fn config() -> SessionConfig {
        SessionConfig::default().with_shutdown_timeout(Duration::from_millis(200))
    }

    fn tcp_manager(prompts: PromptPolicies) -> ConnectionManager {
        ConnectionManager::new(Arc::new(TcpConnector::new()), &config(), prompts)
    }

    fn counting(manager: &ConnectionManager) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));
        let (u, d) = (Arc::clone(&ups), Arc::clone(&downs));
        manager.add_connection_listener(move |endpoint| {
            if endpoint.is_some() {
                u.fetch_add(1, Ordering::SeqCst);
            } else {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });
        (ups, downs)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let kernel = FakeKernel::start(echo).await;
        let manager = tcp_manager(PromptPolicies::default());
        let (ups, downs) = counting(&manager);

        manager.connect("127.0.0.1", kernel.port()).await.unwrap();
        manager.connect("127.0.0.1", kernel.port()).await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            manager.endpoint(),
            Some(Endpoint::new("127.0.0.1", kernel.port()))
        );
        assert_eq!(ups.load(Ordering::SeqCst), 1);
        assert_eq!(downs.load(Ordering::SeqCst), 0);
        kernel.wait_for_connections(1).await;
        assert_eq!(kernel.connections(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_a_no_op() {
        let manager = tcp_manager(PromptPolicies::default());
        let (ups, downs) = counting(&manager);

        manager.disconnect().await.unwrap();
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(ups.load(Ordering::SeqCst), 0);
        assert_eq!(downs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listeners_fire_in_registration_order() {
        let kernel = FakeKernel::start(echo).await;
        let manager = tcp_manager(PromptPolicies::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            manager.add_connection_listener(move |endpoint| {
                seen.lock()
                    .unwrap()
                    .push((tag, endpoint.map(ToString::to_string)));
            });
        }

        manager.connect("127.0.0.1", kernel.port()).await.unwrap();
        manager.disconnect().await.unwrap();

        let addr = Some(format!("127.0.0.1:{}", kernel.port()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("first", addr.clone()),
                ("second", addr),
                ("first", None),
                ("second", None),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = tcp_manager(PromptPolicies::default());
        let (ups, _) = counting(&manager);
        let err = manager.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(ups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_requires_a_connection() {
        let manager = tcp_manager(PromptPolicies::default());
        assert_eq!(
            manager.submit_run(file("a.groovy")).err(),
            Some(SubmitError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_interleaved_runs_are_correlated() {
        // Holds the first reply until the second request arrives, then
        // answers in reverse order.
        let mut held = None;
        let kernel = FakeKernel::start(move |message: &ClientMessage| match message {
            ClientMessage::RunRequest { request_id, file } => {
                let reply = ServerMessage::ScriptOutput {
                    request_id: *request_id,
                    output: file.path.clone().into_bytes(),
                };
                match held.take() {
                    None => {
                        held = Some(reply);
                        Vec::new()
                    }
                    Some(first) => vec![reply, first],
                }
            }
            _ => Vec::new(),
        })
        .await;
        let manager = tcp_manager(PromptPolicies::default());
        manager.connect("127.0.0.1", kernel.port()).await.unwrap();

        let a = manager.submit_run(file("a.groovy")).unwrap();
        let b = manager.submit_run(file("b.groovy")).unwrap();

        assert_eq!(a.wait().await, 0);
        assert_eq!(b.wait().await, 0);
        assert_eq!(
            a.outcome(),
            Some(crate::RunOutcome::Succeeded {
                output: b"a.groovy".to_vec()
            })
        );
        assert_eq!(
            b.outcome(),
            Some(crate::RunOutcome::Succeeded {
                output: b"b.groovy".to_vec()
            })
        );
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_ids_reset_on_reconnect() {
        let kernel = FakeKernel::start(echo).await;
        let manager = tcp_manager(PromptPolicies::default());

        manager.connect("127.0.0.1", kernel.port()).await.unwrap();
        let first = manager.submit_run(file("a.groovy")).unwrap();
        let second = manager.submit_run(file("b.groovy")).unwrap();
        assert_eq!(first.wait().await, 0);
        assert_eq!(second.wait().await, 0);
        assert_eq!(second.request_id(), RequestId::new(2));
        manager.disconnect().await.unwrap();

        manager.connect("127.0.0.1", kernel.port()).await.unwrap();
        let again = manager.submit_run(file("a.groovy")).unwrap();
        assert_eq!(again.request_id(), RequestId::FIRST);
        assert_eq!(again.wait().await, 0);
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_confirmation_prompt_uses_the_policy() {
        let kernel = FakeKernel::start(|message: &ClientMessage| match message {
            ClientMessage::RunRequest { request_id, .. } => {
                vec![ServerMessage::ConfirmationRequest {
                    request_id: *request_id,
                }]
            }
            ClientMessage::ConfirmationResponse {
                request_id,
                verdict: ConfirmationVerdict::Denied,
            } => vec![ServerMessage::Error {
                request_id: *request_id,
                message: "denied".to_string(),
            }],
            _ => Vec::new(),
        })
        .await;
        let manager = tcp_manager(PromptPolicies::default().with_confirmation(DenyAll));
        manager.connect("127.0.0.1", kernel.port()).await.unwrap();

        let run = manager.submit_run(file("a.groovy")).unwrap();
        assert_eq!(run.wait().await, 1);
        assert!(kernel.received().contains(&ClientMessage::ConfirmationResponse {
            request_id: RequestId::FIRST,
            verdict: ConfirmationVerdict::Denied,
        }));
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_kernel_hang_up_fails_pending_runs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let kernel = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap();
            // Dropping the socket closes the connection mid-request.
        });

        let manager = tcp_manager(PromptPolicies::default());
        manager.connect("127.0.0.1", port).await.unwrap();
        let run = manager.submit_run(file("a.groovy")).unwrap();
        kernel.await.unwrap();

        assert_eq!(run.wait().await, 2);
        assert!(manager.session().unwrap().is_closed());

        // The dead session stays until the host disconnects.
        manager.connect("127.0.0.1", port).await.unwrap();
        assert!(manager.is_connected());
        manager.disconnect().await.unwrap();
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_forces_a_stuck_channel() {
        let connector = StuckConnector::new(true);
        let manager =
            ConnectionManager::new(Arc::new(connector.clone()), &config(), PromptPolicies::default());
        let (_, downs) = counting(&manager);
        manager.connect("kernel", 1).await.unwrap();
        let run = manager.submit_run(file("a.groovy")).unwrap();

        manager.disconnect().await.unwrap();

        assert_eq!(
            connector.calls(),
            vec![
                "open_session",
                "shutdown",
                "await_termination",
                "shutdown_now",
                "await_termination",
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        // The drain timeout cancelled outstanding work.
        assert_eq!(run.wait().await, 2);
    }

    #[tokio::test]
    async fn test_failed_shutdown_keeps_the_connection() {
        let connector = StuckConnector::new(false);
        let manager =
            ConnectionManager::new(Arc::new(connector.clone()), &config(), PromptPolicies::default());
        let (_, downs) = counting(&manager);
        manager.connect("kernel", 1).await.unwrap();

        let err = manager.disconnect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ShutdownFailed { .. }));
        assert!(manager.is_connected());
        assert_eq!(manager.endpoint(), Some(Endpoint::new("kernel", 1)));
        assert_eq!(downs.load(Ordering::SeqCst), 0);

        connector.allow_forced_termination();
        manager.disconnect().await.unwrap();
        assert!(!manager.is_connected());
        assert_eq!(downs.load(Ordering::SeqCst), 1);
    }
}
