//! Explicit wiring for hosts.

use std::sync::Arc;

use kernel_link_core::SessionConfig;
use kernel_link_git::DiffProvider;
use kernel_link_transport::{Connector, TcpConnector};

use crate::{
    client::KernelClient,
    manager::{ConnectionError, ConnectionManager},
    prompts::PromptPolicies,
};

/// Everything a host needs to talk to one kernel.
///
/// Construct one per host and pass it (or the [`KernelClient`] it hands
/// out) to whatever submits scripts.
#[derive(Debug)]
pub struct ClientContext {
    config: SessionConfig,
    connections: Arc<ConnectionManager>,
    diff: Arc<DiffProvider>,
}

impl ClientContext {
    /// TCP transport, auto-approving confirmations, declining credentials.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self::with_parts(config, Arc::new(TcpConnector::new()), PromptPolicies::default())
    }

    /// Build a context from an explicit transport and prompt policies.
    #[must_use]
    pub fn with_parts(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        prompts: PromptPolicies,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new(connector, &config, prompts));
        let diff = Arc::new(DiffProvider::new(&config));
        Self {
            config,
            connections,
            diff,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    #[must_use]
    pub const fn diff(&self) -> &Arc<DiffProvider> {
        &self.diff
    }

    /// A client sharing this context's connection and diff provider.
    #[must_use]
    pub fn client(&self) -> KernelClient {
        KernelClient::new(Arc::clone(&self.connections), Arc::clone(&self.diff))
    }

    /// Disconnect from the kernel, if connected.
    ///
    /// # Errors
    /// Returns error if the channel could not be shut down.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        self.connections.disconnect().await
    }
}
