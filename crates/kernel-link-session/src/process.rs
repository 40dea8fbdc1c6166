//! Handle for one submitted script run.

use std::sync::Arc;

use kernel_link_core::{RequestId, RunStatus};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::multiplexer::SessionMultiplexer;

/// Exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for a kernel-reported script error.
pub const EXIT_SCRIPT_ERROR: i32 = 1;
/// Exit code for a run cut short by the connection going away.
pub const EXIT_CONNECTION_LOST: i32 = 2;
/// Exit code for a run whose local tracking was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// Final result of a script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The kernel returned the script's output.
    Succeeded { output: Vec<u8> },
    /// The kernel reported an error.
    Failed { message: String },
    /// The connection ended before a terminal message arrived.
    ConnectionLost,
    /// Local tracking was cancelled.
    Cancelled,
}

impl RunOutcome {
    /// The process-style exit code for this outcome.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded { .. } => EXIT_SUCCESS,
            Self::Failed { .. } => EXIT_SCRIPT_ERROR,
            Self::ConnectionLost => EXIT_CONNECTION_LOST,
            Self::Cancelled => EXIT_CANCELLED,
        }
    }

    /// The run status this outcome maps to.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        match self {
            Self::Succeeded { .. } => RunStatus::Succeeded,
            Self::Failed { .. } | Self::ConnectionLost => RunStatus::Failed,
            Self::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Returned by [`RunProcess::try_wait`] while the run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Run is still in progress")]
pub struct StillRunning;

type OutcomeCell = Arc<watch::Sender<Option<RunOutcome>>>;

/// Write side of a run's outcome. The first completion wins.
#[derive(Clone)]
pub(crate) struct Completion(OutcomeCell);

impl Completion {
    pub(crate) fn complete(&self, outcome: RunOutcome) -> bool {
        self.0.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }
}

/// A script run in flight on the kernel.
///
/// Cancellation is local: the kernel keeps computing, but this handle stops
/// tracking the request and reports [`EXIT_CANCELLED`].
pub struct RunProcess {
    request_id: RequestId,
    cancel: CancellationToken,
    outcome: OutcomeCell,
    session: SessionMultiplexer,
}

impl RunProcess {
    pub(crate) fn new(
        request_id: RequestId,
        cancel: CancellationToken,
        session: SessionMultiplexer,
    ) -> (Self, Completion) {
        let (outcome, _) = watch::channel(None);
        let outcome = Arc::new(outcome);
        let process = Self {
            request_id,
            cancel,
            outcome: Arc::clone(&outcome),
            session,
        };
        (process, Completion(outcome))
    }

    /// The id this run is correlated by.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the run to finish and return its exit code.
    pub async fn wait(&self) -> i32 {
        self.wait_outcome().await.exit_code()
    }

    /// Wait for the run to finish and return its outcome.
    pub async fn wait_outcome(&self) -> RunOutcome {
        let mut rx = self.outcome.subscribe();
        let result = rx.wait_for(Option::is_some).await;
        match result {
            Ok(outcome) => outcome.clone().unwrap_or(RunOutcome::ConnectionLost),
            Err(_) => RunOutcome::ConnectionLost,
        }
    }

    /// Block the current thread until the run finishes.
    ///
    /// Must not be called from within an async task; use [`wait`](Self::wait)
    /// there.
    #[must_use]
    pub fn wait_blocking(&self) -> i32 {
        futures::executor::block_on(self.wait())
    }

    /// The exit code if the run has finished.
    ///
    /// # Errors
    /// Returns [`StillRunning`] while the run is in flight.
    pub fn try_wait(&self) -> Result<i32, StillRunning> {
        self.outcome
            .borrow()
            .as_ref()
            .map(RunOutcome::exit_code)
            .ok_or(StillRunning)
    }

    /// Stop tracking the run. No effect once the run has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.session.release(self.request_id);
        if Completion(Arc::clone(&self.outcome)).complete(RunOutcome::Cancelled) {
            tracing::debug!(request_id = %self.request_id, "Run cancelled");
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.outcome
            .borrow()
            .as_ref()
            .map_or(RunStatus::Running, RunOutcome::status)
    }

    /// The outcome, if the run has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.borrow().clone()
    }
}

impl std::fmt::Debug for RunProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunProcess")
            .field("request_id", &self.request_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Succeeded { output: vec![] }.exit_code(), 0);
        assert_eq!(
            RunOutcome::Failed {
                message: "boom".to_string()
            }
            .exit_code(),
            1
        );
        assert_eq!(RunOutcome::ConnectionLost.exit_code(), 2);
        assert_eq!(RunOutcome::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_connection_loss_reports_failed() {
        assert_eq!(RunOutcome::ConnectionLost.status(), RunStatus::Failed);
        assert_eq!(RunOutcome::Cancelled.status(), RunStatus::Cancelled);
    }

    #[test]
    fn test_first_completion_wins() {
        let (tx, rx) = watch::channel(None);
        let completion = Completion(Arc::new(tx));
        assert!(completion.complete(RunOutcome::Cancelled));
        assert!(!completion.complete(RunOutcome::Succeeded { output: vec![1] }));
        assert_eq!(*rx.borrow(), Some(RunOutcome::Cancelled));
    }
}
