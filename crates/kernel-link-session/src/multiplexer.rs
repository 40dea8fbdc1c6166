//! Request correlation over one session stream.
//!
//! Every run request gets a fresh id and an entry in the pending table. The
//! receive loop routes inbound messages to the entry with the same id; each
//! request is then driven by its own task, which answers prompts and
//! completes the [`RunProcess`] on the terminal message.

use std::sync::Arc;

use kernel_link_core::{ClientMessage, FileSpec, RequestId, ServerMessage};
use kernel_link_transport::OutboundSender;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    process::{Completion, RunOutcome, RunProcess},
    prompts::PromptPolicies,
};

/// Submit error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Not connected to a kernel")]
    NotConnected,
    #[error("Connection to the kernel was lost")]
    ConnectionLost,
}

type Entry = mpsc::UnboundedSender<ServerMessage>;

struct Table {
    next_id: RequestId,
    entries: FxHashMap<RequestId, Entry>,
    closed: bool,
}

struct Shared {
    outbound: OutboundSender,
    table: Mutex<Table>,
    prompts: PromptPolicies,
    connection: CancellationToken,
    runtime: Handle,
}

/// Correlates concurrent run requests over a single session stream.
///
/// Cheap to clone; all clones share one pending table and one outbound queue.
#[derive(Clone)]
pub struct SessionMultiplexer {
    shared: Arc<Shared>,
}

impl SessionMultiplexer {
    /// Start the receive loop for a freshly opened session.
    ///
    /// Ids start at [`RequestId::FIRST`]. Cancelling `connection` stops the
    /// receive loop and every request of this session.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
        outbound: OutboundSender,
        prompts: PromptPolicies,
        connection: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            outbound,
            table: Mutex::new(Table {
                next_id: RequestId::FIRST,
                entries: FxHashMap::default(),
                closed: false,
            }),
            prompts,
            connection,
            runtime: Handle::current(),
        });
        shared.runtime.spawn(Arc::clone(&shared).receive_loop(inbound));
        Self { shared }
    }

    /// Submit a run request.
    ///
    /// The request is registered before it is queued, so a reply can never
    /// overtake its own registration.
    ///
    /// # Errors
    /// Returns [`SubmitError::ConnectionLost`] if the session has ended.
    pub fn submit(&self, file: FileSpec) -> Result<RunProcess, SubmitError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let request_id = {
            let mut table = self.shared.table.lock();
            if table.closed || self.shared.connection.is_cancelled() {
                return Err(SubmitError::ConnectionLost);
            }
            let id = table.next_id;
            table.next_id = id.next();
            table.entries.insert(id, tx);
            id
        };

        let cancel = self.shared.connection.child_token();
        let (process, completion) = RunProcess::new(request_id, cancel.clone(), self.clone());
        tracing::debug!(%request_id, path = %file.path, "Submitting run request");

        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(async move {
            let outcome = shared.drive(request_id, file, rx, &cancel).await;
            shared.release(request_id);
            tracing::debug!(%request_id, exit_code = outcome.exit_code(), "Run finished");
            completion.complete(outcome);
        });
        Ok(process)
    }

    /// Number of requests awaiting a terminal message.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.table.lock().entries.len()
    }

    /// Whether the receive loop has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.table.lock().closed
    }

    pub(crate) fn release(&self, request_id: RequestId) {
        self.shared.release(request_id);
    }
}

impl Shared {
    async fn receive_loop(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) {
        loop {
            let message = tokio::select! {
                () = self.connection.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.dispatch(message);
        }
        self.close();
    }

    fn dispatch(&self, message: ServerMessage) {
        let request_id = message.request_id();
        let entry = {
            let mut table = self.table.lock();
            if message.is_terminal() {
                table.entries.remove(&request_id)
            } else {
                table.entries.get(&request_id).cloned()
            }
        };

        match entry {
            Some(entry) => {
                if entry.send(message).is_err() {
                    tracing::debug!(%request_id, "Request finished before its message was routed");
                }
            }
            None => {
                tracing::warn!(%request_id, "Dropping message for unknown request: {message:?}");
            }
        }
    }

    fn close(&self) {
        let dropped = {
            let mut table = self.table.lock();
            table.closed = true;
            let dropped = table.entries.len();
            // Dropping the entries ends every request loop.
            table.entries.clear();
            dropped
        };
        tracing::debug!(pending = dropped, "Receive loop ended");
    }

    fn release(&self, request_id: RequestId) {
        self.table.lock().entries.remove(&request_id);
    }

    fn send(&self, message: ClientMessage) -> bool {
        self.outbound.send(Some(message)).is_ok()
    }

    fn interrupted(&self) -> RunOutcome {
        if self.connection.is_cancelled() {
            RunOutcome::ConnectionLost
        } else {
            RunOutcome::Cancelled
        }
    }

    async fn drive(
        &self,
        request_id: RequestId,
        file: FileSpec,
        mut replies: mpsc::UnboundedReceiver<ServerMessage>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            return self.interrupted();
        }
        if !self.send(ClientMessage::RunRequest { request_id, file }) {
            return RunOutcome::ConnectionLost;
        }

        loop {
            if cancel.is_cancelled() {
                return self.interrupted();
            }
            let message = tokio::select! {
                biased;
                () = cancel.cancelled() => return self.interrupted(),
                message = replies.recv() => message,
            };

            let response = match message {
                None => return RunOutcome::ConnectionLost,
                Some(ServerMessage::Error { message, .. }) => {
                    tracing::debug!(%request_id, "Kernel reported an error: {message}");
                    return RunOutcome::Failed { message };
                }
                Some(ServerMessage::ScriptOutput { output, .. }) => {
                    return RunOutcome::Succeeded { output };
                }
                Some(ServerMessage::CredentialsRequest { .. }) => {
                    ClientMessage::CredentialsResponse {
                        request_id,
                        credentials: self.prompts.answer_credentials(request_id).await,
                    }
                }
                Some(ServerMessage::ConfirmationRequest { .. }) => {
                    ClientMessage::ConfirmationResponse {
                        request_id,
                        verdict: self.prompts.verdict(request_id).await,
                    }
                }
            };

            if cancel.is_cancelled() {
                return self.interrupted();
            }
            match self.answer(request_id, response) {
                Some(true) => {}
                Some(false) => return RunOutcome::ConnectionLost,
                None => {
                    tracing::debug!(%request_id, "Request ended while its prompt was pending, dropping the answer");
                }
            }
        }
    }

    /// Queue a prompt answer while the request is still in the table.
    ///
    /// Holding the table lock orders the answer against the removal of the
    /// entry by a terminal message. Returns `None` once the entry is gone.
    fn answer(&self, request_id: RequestId, response: ClientMessage) -> Option<bool> {
        let table = self.table.lock();
        table
            .entries
            .contains_key(&request_id)
            .then(|| self.send(response))
    }
}

impl std::fmt::Debug for SessionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMultiplexer")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}
