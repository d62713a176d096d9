//! Credential Manager
//!
//! Owns the stored credential of one integration instance and the refresh
//! chain that keeps it alive.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::exchange::CredentialExchange;
use super::types::{Credential, CredentialKind, Identity, RefreshSchedule};
use super::CredentialSource;
use crate::config::RefreshPolicy;
use crate::errors::{AuthError, ConfigurationError, LifecycleResult};
use crate::observability::{redact_token, LifecycleMetrics};
use crate::platform::{Scheduler, SecretStore};

/// Scheduler action fired when a credential is due for renewal.
pub const REFRESH_ACTION: &str = "credentials.refresh";

/// Credential lifecycle for one (instance, kind) pair.
pub struct CredentialManager<E: CredentialExchange> {
    instance: String,
    identity: Identity,
    exchange: E,
    secrets: Arc<dyn SecretStore>,
    scheduler: Arc<dyn Scheduler>,
    policy: RefreshPolicy,
    metrics: Arc<LifecycleMetrics>,
}

impl<E: CredentialExchange> CredentialManager<E> {
    /// Create a manager. The identity is validated here, once.
    pub fn new(
        instance: impl Into<String>,
        identity: Identity,
        exchange: E,
        secrets: Arc<dyn SecretStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> LifecycleResult<Self> {
        let instance = crate::config::require_non_empty("instance", &instance.into())?;
        let identity = identity.validate()?;
        if identity.kind() != exchange.kind() {
            return Err(ConfigurationError::invalid(
                "identity",
                format!(
                    "{} identity cannot drive a {} exchange",
                    identity.kind(),
                    exchange.kind()
                ),
            )
            .into());
        }

        Ok(Self {
            instance,
            identity,
            exchange,
            secrets,
            scheduler,
            policy: RefreshPolicy::default(),
            metrics: Arc::new(LifecycleMetrics::new()),
        })
    }

    /// Set the refresh policy.
    pub fn with_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Share a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<LifecycleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Credential kind managed.
    pub fn kind(&self) -> CredentialKind {
        self.exchange.kind()
    }

    /// Secret-store name of the live credential.
    pub fn secret_name(&self) -> String {
        format!("{}/credential/{}", self.instance, self.kind().as_str())
    }

    /// Load the stored credential.
    pub async fn stored(&self) -> LifecycleResult<Option<Credential>> {
        match self.secrets.get(&self.secret_name()).await? {
            Some(bytes) => Ok(Some(Credential::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Exchange the identity for a new credential. Nothing is stored.
    pub async fn obtain(&self) -> LifecycleResult<Credential> {
        self.exchange.obtain(&self.identity).await
    }

    /// Renew the stored credential. Nothing is stored.
    ///
    /// A result that is not at least as fresh as the stored credential is
    /// rejected with [`AuthError::StaleCredential`].
    pub async fn refresh(&self) -> LifecycleResult<Credential> {
        let current = self.stored().await?;
        let renewed = self.exchange.refresh(&self.identity, current.as_ref()).await?;
        ensure_fresher(current.as_ref(), &renewed, Utc::now())?;
        Ok(renewed)
    }

    /// Persist `credential`, then arm exactly one refresh.
    ///
    /// If arming fails the credential is already stored and the error is
    /// returned to the caller.
    pub async fn schedule_next(&self, credential: &Credential) -> LifecycleResult<RefreshSchedule> {
        let bytes = credential.to_bytes()?;
        self.secrets.set(&self.secret_name(), &bytes).await?;
        debug!(
            token = %redact_token(credential.access_token.expose_secret()),
            expires_at = ?credential.expires_at(),
            "Credential persisted"
        );

        let delay = self.policy.delay_for(credential);
        let payload = json!({
            "instance": self.instance,
            "kind": self.kind().as_str(),
        });
        self.scheduler
            .schedule_call(REFRESH_ACTION, payload, delay)
            .await?;

        let fire_at = ChronoDuration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Ok(RefreshSchedule {
            instance: self.instance.clone(),
            kind: self.kind(),
            delay,
            fire_at,
        })
    }

    /// Obtain the first credential and start the refresh chain.
    #[instrument(skip(self), fields(instance = %self.instance, kind = %self.kind()))]
    pub async fn start(&self) -> LifecycleResult<RefreshSchedule> {
        let result = match self.obtain().await {
            Ok(credential) => self.schedule_next(&credential).await,
            Err(e) => Err(e),
        };
        self.record("start", result)
    }

    /// Handle a refresh trigger from the scheduler.
    ///
    /// Safe to invoke more than once for the same due instant. On failure no
    /// new schedule is armed.
    #[instrument(skip(self), fields(instance = %self.instance, kind = %self.kind()))]
    pub async fn refresh_now(&self) -> LifecycleResult<RefreshSchedule> {
        let result = match self.refresh().await {
            Ok(credential) => self.schedule_next(&credential).await,
            Err(e) => Err(e),
        };
        self.record("refresh", result)
    }

    /// Refresh when a credential is stored, otherwise start the chain.
    pub async fn renew(&self) -> LifecycleResult<RefreshSchedule> {
        if self.stored().await?.is_some() {
            self.refresh_now().await
        } else {
            self.start().await
        }
    }

    fn record(
        &self,
        operation: &'static str,
        result: LifecycleResult<RefreshSchedule>,
    ) -> LifecycleResult<RefreshSchedule> {
        match &result {
            Ok(schedule) => {
                self.metrics.record_refresh_success();
                info!(
                    operation,
                    delay_secs = schedule.delay.as_secs(),
                    "Credential stored and refresh armed"
                );
            }
            Err(e) if e.needs_reauth() => {
                self.metrics.record_refresh_failure();
                error!(operation, error = %e, code = e.error_code(), "Credential chain broken");
            }
            Err(e) => {
                self.metrics.record_refresh_failure();
                warn!(operation, error = %e, code = e.error_code(), "Credential refresh failed");
            }
        }
        result
    }
}

#[async_trait]
impl<E: CredentialExchange> CredentialSource for CredentialManager<E> {
    async fn access_token(&self) -> LifecycleResult<SecretString> {
        match self.stored().await? {
            Some(credential) => Ok(credential.access_token),
            None => Err(AuthError::NotFound {
                name: self.secret_name(),
            }
            .into()),
        }
    }
}

/// Reject a renewed credential that is empty, expired, or expires before the
/// stored one.
pub(crate) fn ensure_fresher(
    stored: Option<&Credential>,
    renewed: &Credential,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    if renewed.is_empty() {
        return Err(AuthError::StaleCredential {
            message: "empty access token".to_string(),
        });
    }
    if renewed.is_expired_at(now) {
        return Err(AuthError::StaleCredential {
            message: "already expired".to_string(),
        });
    }
    if let (Some(old), Some(new)) = (
        stored.and_then(Credential::expires_at),
        renewed.expires_at(),
    ) {
        if new < old {
            return Err(AuthError::StaleCredential {
                message: format!("expires at {new}, stored credential expires at {old}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::PatTokenExchange;
    use crate::errors::LifecycleError;
    use crate::platform::{InMemorySecretStore, RecordingScheduler};
    use crate::transport::{HttpResponse, MockHttpTransport};
    use secrecy::ExposeSecret;
    use std::time::Duration;

    struct Fixture {
        transport: Arc<MockHttpTransport>,
        secrets: Arc<InMemorySecretStore>,
        scheduler: Arc<RecordingScheduler>,
        manager: CredentialManager<PatTokenExchange>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockHttpTransport::new());
        let secrets = Arc::new(InMemorySecretStore::new());
        let scheduler = Arc::new(RecordingScheduler::new());
        let manager = CredentialManager::new(
            "registry-1",
            Identity::pat("alice", "pat"),
            PatTokenExchange::new(transport.clone(), "https://registry.example.com"),
            secrets.clone(),
            scheduler.clone(),
        )
        .unwrap();
        Fixture {
            transport,
            secrets,
            scheduler,
            manager,
        }
    }

    #[tokio::test]
    async fn test_start_persists_then_arms() {
        let f = fixture();
        f.transport
            .queue_json_response(200, serde_json::json!({"access_token": "jwt-1"}));

        let schedule = f.manager.start().await.unwrap();

        assert_eq!(schedule.delay, Duration::from_secs(540));
        assert_eq!(f.secrets.writes(), vec!["registry-1/credential/pat".to_string()]);
        let calls = f.scheduler.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, REFRESH_ACTION);
        assert_eq!(calls[0].payload["instance"], "registry-1");

        let token = f.manager.access_token().await.unwrap();
        assert_eq!(token.expose_secret(), "jwt-1");
    }

    #[tokio::test]
    async fn test_schedule_failure_keeps_stored_credential() {
        let f = fixture();
        f.transport
            .queue_json_response(200, serde_json::json!({"access_token": "jwt-1"}));
        f.scheduler.fail_calls(true);

        assert!(f.manager.start().await.is_err());
        assert!(f.manager.stored().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_failure_does_not_rearm() {
        let f = fixture();
        f.transport
            .queue_json_response(200, serde_json::json!({"access_token": "jwt-1"}));
        f.manager.start().await.unwrap();

        f.transport.queue_response(HttpResponse::new(401, "revoked"));
        let err = f.manager.refresh_now().await.unwrap_err();

        assert!(err.needs_reauth());
        assert_eq!(f.scheduler.calls().len(), 1);
        let stored = f.manager.stored().await.unwrap().unwrap();
        assert_eq!(stored.access_token.expose_secret(), "jwt-1");
    }

    #[tokio::test]
    async fn test_access_token_before_start() {
        let f = fixture();
        let err = f.manager.access_token().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Auth(AuthError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_renew_starts_chain_when_empty() {
        let f = fixture();
        f.transport
            .queue_json_response(200, serde_json::json!({"access_token": "jwt-1"}));
        f.manager.renew().await.unwrap();
        assert_eq!(f.scheduler.calls().len(), 1);
    }

    #[test]
    fn test_mismatched_identity_rejected() {
        let transport = Arc::new(MockHttpTransport::new());
        let result = CredentialManager::new(
            "i",
            Identity::oauth("c", "s", "code", "https://cb"),
            PatTokenExchange::new(transport, "https://registry.example.com"),
            Arc::new(InMemorySecretStore::new()),
            Arc::new(RecordingScheduler::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_fresher() {
        let now = Utc::now();
        let stored = Credential::new(CredentialKind::OAuth, "old")
            .with_expires_in(Duration::from_secs(3600))
            .issued_at(now);

        let fresher = Credential::new(CredentialKind::OAuth, "new")
            .with_expires_in(Duration::from_secs(3600))
            .issued_at(now + ChronoDuration::seconds(5));
        assert!(ensure_fresher(Some(&stored), &fresher, now).is_ok());

        let shorter = Credential::new(CredentialKind::OAuth, "new")
            .with_expires_in(Duration::from_secs(60))
            .issued_at(now);
        assert!(ensure_fresher(Some(&stored), &shorter, now).is_err());

        let expired = Credential::new(CredentialKind::OAuth, "new")
            .with_expires_in(Duration::from_secs(1))
            .issued_at(now - ChronoDuration::seconds(10));
        assert!(ensure_fresher(None, &expired, now).is_err());

        let empty = Credential::new(CredentialKind::OAuth, "  ");
        assert!(ensure_fresher(None, &empty, now).is_err());
    }
}
