//! In-process kernels for session tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use kernel_link_core::{
    ClientMessage, FileSpec, ProjectSpec, ServerMessage,
    protocol::{decode_line, encode_line},
};
use kernel_link_transport::{Connector, KernelChannel, SessionStream, TransportError};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

type Handler = Box<dyn FnMut(&ClientMessage) -> Vec<ServerMessage> + Send>;

pub fn file(path: &str) -> FileSpec {
    FileSpec {
        path: path.to_string(),
        project: ProjectSpec {
            repo_remote: "https://example.com/project.git".to_string(),
            revision: "0123abcd".to_string(),
            patch: Vec::new(),
        },
    }
}

/// Answers every run request with its script path as output.
pub fn echo(message: &ClientMessage) -> Vec<ServerMessage> {
    match message {
        ClientMessage::RunRequest { request_id, file } => vec![ServerMessage::ScriptOutput {
            request_id: *request_id,
            output: file.path.clone().into_bytes(),
        }],
        _ => Vec::new(),
    }
}

/// A loopback kernel driven by a message handler.
///
/// Closes each connection once the client half-closes it.
pub struct FakeKernel {
    port: u16,
    received: Arc<Mutex<Vec<ClientMessage>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeKernel {
    pub async fn start(
        handler: impl FnMut(&ClientMessage) -> Vec<ServerMessage> + Send + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler: Arc<Mutex<Handler>> = Arc::new(Mutex::new(Box::new(handler)));
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        socket,
                        Arc::clone(&handler),
                        Arc::clone(&received),
                    ));
                }
            })
        };

        Self {
            port,
            received,
            connections,
            task,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn received(&self) -> Vec<ClientMessage> {
        self.received.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.connections() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    socket: TcpStream,
    handler: Arc<Mutex<Handler>>,
    received: Arc<Mutex<Vec<ClientMessage>>>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = decode_line::<ClientMessage>(&line) else {
            continue;
        };
        let replies = {
            let mut handler = handler.lock();
            (*handler)(&message)
        };
        received.lock().push(message);
        for reply in replies {
            let line = encode_line(&reply).unwrap();
            if write_half.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Connector for channels that never drain and only terminate when forced,
/// if allowed to.
#[derive(Clone)]
pub struct StuckConnector {
    calls: Arc<Mutex<Vec<&'static str>>>,
    forced_terminates: Arc<AtomicBool>,
}

impl StuckConnector {
    pub fn new(forced_terminates: bool) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            forced_terminates: Arc::new(AtomicBool::new(forced_terminates)),
        }
    }

    pub fn allow_forced_termination(&self) {
        self.forced_terminates.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Connector for StuckConnector {
    async fn connect(
        &self,
        _address: &str,
        _port: u16,
    ) -> Result<Box<dyn KernelChannel>, TransportError> {
        self.calls.lock().clear();
        Ok(Box::new(StuckChannel {
            calls: Arc::clone(&self.calls),
            forced_terminates: Arc::clone(&self.forced_terminates),
            forced: false,
            held: None,
        }))
    }
}

struct StuckChannel {
    calls: Arc<Mutex<Vec<&'static str>>>,
    forced_terminates: Arc<AtomicBool>,
    forced: bool,
    #[allow(clippy::type_complexity)]
    held: Option<(
        mpsc::UnboundedReceiver<Option<ClientMessage>>,
        mpsc::UnboundedSender<ServerMessage>,
        oneshot::Sender<()>,
    )>,
}

#[async_trait]
impl KernelChannel for StuckChannel {
    fn open_session(&mut self) -> Result<SessionStream, TransportError> {
        self.calls.lock().push("open_session");
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (closed_tx, outbound_closed) = oneshot::channel();
        self.held = Some((outbound_rx, inbound_tx, closed_tx));
        Ok(SessionStream {
            outbound,
            inbound,
            outbound_closed,
        })
    }

    fn shutdown(&mut self) {
        self.calls.lock().push("shutdown");
    }

    fn shutdown_now(&mut self) {
        self.calls.lock().push("shutdown_now");
        self.forced = true;
    }

    async fn await_termination(&mut self, timeout: Duration) -> bool {
        self.calls.lock().push("await_termination");
        if self.is_terminated() {
            self.held = None;
            return true;
        }
        tokio::time::sleep(timeout).await;
        false
    }

    fn is_terminated(&self) -> bool {
        self.forced && self.forced_terminates.load(Ordering::SeqCst)
    }
}
