//! Reconciliation engine.

use chrono::Utc;
use secrecy::SecretString;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{compare_config, NodeMetadata, ReconcileState, WebhookConfig, WebhookRegistrar};
use crate::errors::{LifecycleError, LifecycleResult, RemoteError, StorageError};
use crate::observability::{redact_url, LifecycleMetrics};
use crate::platform::{MetadataStore, WebhookProvisioner};

/// Drives one node's registration through its states.
pub struct ReconciliationEngine<C: WebhookConfig, R: WebhookRegistrar<C>> {
    registrar: R,
    metadata: Arc<dyn MetadataStore>,
    provisioner: Arc<dyn WebhookProvisioner>,
    metrics: Arc<LifecycleMetrics>,
    _config: PhantomData<fn() -> C>,
}

impl<C: WebhookConfig, R: WebhookRegistrar<C>> ReconciliationEngine<C, R> {
    /// Create an engine for one node.
    pub fn new(
        registrar: R,
        metadata: Arc<dyn MetadataStore>,
        provisioner: Arc<dyn WebhookProvisioner>,
    ) -> Self {
        Self {
            registrar,
            metadata,
            provisioner,
            metrics: Arc::new(LifecycleMetrics::new()),
            _config: PhantomData,
        }
    }

    /// Share a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<LifecycleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registrar in use.
    pub fn registrar(&self) -> &R {
        &self.registrar
    }

    /// Load the node's metadata.
    pub async fn load(&self) -> LifecycleResult<Option<NodeMetadata<C>>> {
        match self.metadata.get().await? {
            Some(value) if !value.is_null() => Ok(Some(NodeMetadata::from_value(value)?)),
            _ => Ok(None),
        }
    }

    /// Converge the remote registration to `desired`.
    ///
    /// Equivalent config with a live registration returns `existing`
    /// unchanged without any remote call. Otherwise the target is verified,
    /// a new registration created and persisted, and any superseded
    /// registration removed. Metadata is written only after the provider
    /// returned an identifier.
    #[instrument(skip(self, desired, existing))]
    pub async fn setup(
        &self,
        desired: &C,
        existing: Option<NodeMetadata<C>>,
    ) -> LifecycleResult<NodeMetadata<C>> {
        desired.validate()?;

        if let Some(existing) = existing.as_ref() {
            if existing.state() == ReconcileState::Registered
                && compare_config::<C>(desired, &existing.config)?
            {
                self.metrics.record_registration_unchanged();
                debug!(
                    registration_id = %existing.registration_id,
                    "Registration already matches desired config"
                );
                return Ok(existing.clone());
            }
        }

        let previous = existing.filter(|m| m.state() == ReconcileState::Registered);
        let state = if previous.is_some() {
            ReconcileState::Reconciling
        } else {
            ReconcileState::Registering
        };
        info!(%state, filter = ?desired.filter(), "Reconciling webhook registration");

        let resource_id = self.registrar.verify_target(desired).await?;

        let webhook_url = match previous.as_ref().map(|m| m.webhook_url.trim()) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => self.provisioner.setup_delivery_url().await?,
        };

        // A live registration keeps signing with the current secret until
        // its replacement is persisted, so reconfiguration reuses it.
        let secret = if !self.registrar.needs_secret() {
            None
        } else if previous.is_some() {
            Some(self.current_secret().await?)
        } else {
            let (plain, _stored) = self.provisioner.reset_secret().await?;
            Some(plain)
        };

        let registration = self
            .registrar
            .register(desired, &webhook_url, secret.as_ref())
            .await?;
        if registration.id.trim().is_empty() {
            return Err(RemoteError::UnexpectedResponse {
                message: "registration returned an empty identifier".to_string(),
            }
            .into());
        }

        let metadata = NodeMetadata {
            config: desired.clone(),
            webhook_url,
            registration_id: registration.id,
            resource_id,
            updated_at: Utc::now(),
        };
        self.metadata.set(metadata.to_value()?).await?;
        self.metrics.record_registration_created();
        info!(
            state = %ReconcileState::Registered,
            registration_id = %metadata.registration_id,
            url = %redact_url(&metadata.webhook_url),
            "Webhook registered"
        );

        if let Some(old) = previous {
            if old.registration_id != metadata.registration_id {
                self.remove_superseded(&old).await;
            }
        }

        Ok(metadata)
    }

    /// Remove the registration described by `metadata`, then clear the
    /// stored record.
    ///
    /// The delete always uses the filter parameters the registration was
    /// created with. A `config` that has drifted from them is only logged.
    #[instrument(skip(self, metadata, config))]
    pub async fn cleanup(&self, metadata: &NodeMetadata<C>, config: &C) -> LifecycleResult<()> {
        if metadata.state() == ReconcileState::NotRegistered {
            debug!("No registration to remove");
            return Ok(());
        }
        if config.filter() != metadata.config.filter() {
            warn!(
                desired = ?config.filter(),
                registered = ?metadata.config.filter(),
                "Desired config differs from registration, removing with registered filter"
            );
        }

        info!(
            state = %ReconcileState::Removing,
            registration_id = %metadata.registration_id,
            "Removing webhook registration"
        );
        self.registrar
            .unregister(&metadata.config, &metadata.registration_id)
            .await?;
        self.metadata.set(Value::Null).await?;
        self.metrics.record_registration_removed();
        info!(state = %ReconcileState::NotRegistered, "Webhook registration removed");
        Ok(())
    }

    /// Load stored metadata and converge to `desired`.
    pub async fn sync(&self, desired: &C) -> LifecycleResult<NodeMetadata<C>> {
        let existing = self.load().await?;
        self.setup(desired, existing).await
    }

    /// Load stored metadata and remove its registration.
    pub async fn teardown(&self) -> LifecycleResult<()> {
        match self.load().await? {
            Some(metadata) => self.cleanup(&metadata, &metadata.config).await,
            None => Ok(()),
        }
    }

    async fn current_secret(&self) -> LifecycleResult<SecretString> {
        match self.provisioner.get_secret().await {
            Ok(stored) => String::from_utf8(stored).map(SecretString::new).map_err(|_| {
                LifecycleError::from(StorageError::ReadFailed {
                    message: "webhook secret is not valid UTF-8".to_string(),
                })
            }),
            Err(e) => {
                // Nothing can verify against a missing secret, so rotating loses nothing.
                warn!(error = %e, "No webhook secret to reuse, rotating");
                let (plain, _stored) = self.provisioner.reset_secret().await?;
                Ok(plain)
            }
        }
    }

    async fn remove_superseded(&self, old: &NodeMetadata<C>) {
        match self
            .registrar
            .unregister(&old.config, &old.registration_id)
            .await
        {
            Ok(()) => {
                self.metrics.record_registration_removed();
                debug!(registration_id = %old.registration_id, "Removed superseded registration");
            }
            Err(e) => warn!(
                registration_id = %old.registration_id,
                error = %e,
                "Failed to remove superseded registration"
            ),
        }
    }
}
