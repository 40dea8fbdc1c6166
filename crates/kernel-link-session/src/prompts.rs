//! Policies for answering kernel prompts.
//!
//! The kernel may ask for credentials or for confirmation while a script
//! runs. The session engine owns the protocol; these traits let the host
//! own the answers.

use std::sync::Arc;

use async_trait::async_trait;
use kernel_link_core::{ConfirmationVerdict, RequestId};
use thiserror::Error;

pub use kernel_link_core::Credentials;

/// Prompt handling error.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Prompt handler unavailable")]
    Unavailable,
    #[error("Prompt failed: {0}")]
    Failed(String),
}

/// Decides confirmation prompts.
///
/// Implement this trait to integrate with your confirmation UI/system.
#[async_trait]
pub trait ConfirmationPolicy: Send + Sync {
    /// Decide the confirmation prompt raised for `request_id`.
    async fn confirm(&self, request_id: RequestId) -> Result<ConfirmationVerdict, PromptError>;
}

/// Supplies credentials for credentials prompts.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Credentials for the prompt raised by `request_id`, or `None` to decline.
    async fn credentials(&self, request_id: RequestId)
    -> Result<Option<Credentials>, PromptError>;
}

/// Confirmation policy that allows everything.
#[derive(Debug, Default, Clone)]
pub struct AutoApprove;

#[async_trait]
impl ConfirmationPolicy for AutoApprove {
    async fn confirm(&self, _request_id: RequestId) -> Result<ConfirmationVerdict, PromptError> {
        Ok(ConfirmationVerdict::Allowed)
    }
}

/// Confirmation policy that denies everything.
#[derive(Debug, Default, Clone)]
pub struct DenyAll;

#[async_trait]
impl ConfirmationPolicy for DenyAll {
    async fn confirm(&self, _request_id: RequestId) -> Result<ConfirmationVerdict, PromptError> {
        Ok(ConfirmationVerdict::Denied)
    }
}

/// Credentials provider that answers every prompt without credentials.
#[derive(Debug, Default, Clone)]
pub struct NoCredentials;

#[async_trait]
impl CredentialsProvider for NoCredentials {
    async fn credentials(
        &self,
        _request_id: RequestId,
    ) -> Result<Option<Credentials>, PromptError> {
        Ok(None)
    }
}

/// The pair of policies a session answers prompts with.
#[derive(Clone)]
pub struct PromptPolicies {
    pub confirmation: Arc<dyn ConfirmationPolicy>,
    pub credentials: Arc<dyn CredentialsProvider>,
}

impl Default for PromptPolicies {
    fn default() -> Self {
        Self {
            confirmation: Arc::new(AutoApprove),
            credentials: Arc::new(NoCredentials),
        }
    }
}

impl PromptPolicies {
    /// Replace the confirmation policy.
    #[must_use]
    pub fn with_confirmation(mut self, policy: impl ConfirmationPolicy + 'static) -> Self {
        self.confirmation = Arc::new(policy);
        self
    }

    /// Replace the credentials provider.
    #[must_use]
    pub fn with_credentials(mut self, provider: impl CredentialsProvider + 'static) -> Self {
        self.credentials = Arc::new(provider);
        self
    }

    /// Decide a confirmation prompt. Policy failures deny.
    pub(crate) async fn verdict(&self, request_id: RequestId) -> ConfirmationVerdict {
        match self.confirmation.confirm(request_id).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!(%request_id, "Confirmation policy failed, denying: {e}");
                ConfirmationVerdict::Denied
            }
        }
    }

    /// Answer a credentials prompt. Provider failures decline.
    pub(crate) async fn answer_credentials(&self, request_id: RequestId) -> Option<Credentials> {
        match self.credentials.credentials(request_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::error!(%request_id, "Credentials provider failed, declining: {e}");
                None
            }
        }
    }
}

impl std::fmt::Debug for PromptPolicies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptPolicies").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl ConfirmationPolicy for Broken {
        async fn confirm(&self, _: RequestId) -> Result<ConfirmationVerdict, PromptError> {
            Err(PromptError::Unavailable)
        }
    }

    #[async_trait]
    impl CredentialsProvider for Broken {
        async fn credentials(&self, _: RequestId) -> Result<Option<Credentials>, PromptError> {
            Err(PromptError::Failed("vault sealed".to_string()))
        }
    }

    #[tokio::test]
    async fn test_defaults_allow_and_decline() {
        let policies = PromptPolicies::default();
        assert_eq!(
            policies.verdict(RequestId::FIRST).await,
            ConfirmationVerdict::Allowed
        );
        assert!(policies.answer_credentials(RequestId::FIRST).await.is_none());
    }

    #[tokio::test]
    async fn test_deny_all() {
        let policies = PromptPolicies::default().with_confirmation(DenyAll);
        assert_eq!(
            policies.verdict(RequestId::FIRST).await,
            ConfirmationVerdict::Denied
        );
    }

    #[tokio::test]
    async fn test_failing_policies_fail_closed() {
        let policies = PromptPolicies::default()
            .with_confirmation(Broken)
            .with_credentials(Broken);
        assert_eq!(
            policies.verdict(RequestId::FIRST).await,
            ConfirmationVerdict::Denied
        );
        assert!(policies.answer_credentials(RequestId::FIRST).await.is_none());
    }
}
