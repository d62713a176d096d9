//! Credential Lifecycle
//!
//! Obtains access credentials from long-lived identity material, stores them
//! in the platform secret store and keeps them renewed through the scheduler.

mod exchange;
mod manager;
mod types;

pub use exchange::{ClientAuthMethod, CredentialExchange, OAuthTokenExchange, PatTokenExchange};
pub use manager::{CredentialManager, REFRESH_ACTION};
pub use types::{Credential, CredentialKind, Identity, RefreshSchedule};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::LifecycleResult;

/// Supplies the current access token to outbound calls.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current access token.
    async fn access_token(&self) -> LifecycleResult<SecretString>;
}

/// Fixed token, for tests and for providers configured with a static key.
pub struct StaticCredentialSource {
    token: SecretString,
}

impl StaticCredentialSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn access_token(&self) -> LifecycleResult<SecretString> {
        Ok(self.token.clone())
    }
}
