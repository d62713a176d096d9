//! Webhook Reconciliation
//!
//! Converges a provider's webhook registration to a desired configuration and
//! records the outcome as per-node metadata.

mod engine;

pub use engine::ReconciliationEngine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::{ConfigurationError, DecodeError, LifecycleResult};

/// Typed desired webhook configuration of one provider.
pub trait WebhookConfig:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Fields the provider indexes registrations by.
    type Filter: PartialEq + fmt::Debug;

    /// Project onto the filter fields.
    fn filter(&self) -> Self::Filter;

    /// Check required fields.
    fn validate(&self) -> Result<(), ConfigurationError>;
}

/// Decode a typed config or an untyped map into `C`.
pub fn decode_config<C: WebhookConfig>(value: &impl Serialize) -> Result<C, DecodeError> {
    let value = serde_json::to_value(value).map_err(|e| DecodeError::invalid("webhook config", e))?;
    serde_json::from_value(value).map_err(|e| DecodeError::invalid("webhook config", e))
}

/// Compare two configs on their filter fields.
///
/// Either side may be the typed config or an untyped map; both are decoded into
/// `C` first, and a decode failure is an error rather than a verdict.
pub fn compare_config<C: WebhookConfig>(
    a: &impl Serialize,
    b: &impl Serialize,
) -> Result<bool, DecodeError> {
    let a: C = decode_config(a)?;
    let b: C = decode_config(b)?;
    Ok(a.filter() == b.filter())
}

/// A registration the provider acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Provider-assigned identifier.
    pub id: String,
}

/// Provider-side operations the reconciliation engine drives.
#[async_trait]
pub trait WebhookRegistrar<C: WebhookConfig>: Send + Sync {
    /// Whether registrations carry a platform-provisioned secret.
    fn needs_secret(&self) -> bool {
        false
    }

    /// Check the referenced remote resource exists and is reachable, returning
    /// the identity deliveries will carry.
    async fn verify_target(&self, config: &C) -> LifecycleResult<String>;

    /// Create a registration delivering to `url`.
    async fn register(
        &self,
        config: &C,
        url: &str,
        secret: Option<&SecretString>,
    ) -> LifecycleResult<Registration>;

    /// Delete a registration, indexed by the config it was created with.
    async fn unregister(&self, config: &C, registration_id: &str) -> LifecycleResult<()>;
}

/// Reconciliation state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    NotRegistered,
    Registering,
    Registered,
    Reconciling,
    Removing,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotRegistered => "not_registered",
            Self::Registering => "registering",
            Self::Registered => "registered",
            Self::Reconciling => "reconciling",
            Self::Removing => "removing",
        };
        f.write_str(name)
    }
}

/// Persisted per-node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata<C> {
    /// Last-applied desired config.
    pub config: C,
    /// Delivery URL issued by the platform.
    #[serde(default)]
    pub webhook_url: String,
    /// Provider-assigned registration identifier.
    #[serde(default)]
    pub registration_id: String,
    /// Resource identity deliveries must carry.
    #[serde(default)]
    pub resource_id: String,
    pub updated_at: DateTime<Utc>,
}

impl<C: WebhookConfig> NodeMetadata<C> {
    /// Durable state: registered only with a non-empty registration id.
    pub fn state(&self) -> ReconcileState {
        if self.registration_id.trim().is_empty() {
            ReconcileState::NotRegistered
        } else {
            ReconcileState::Registered
        }
    }

    /// Decode from the metadata store.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        serde_json::from_value(value).map_err(|e| DecodeError::invalid("node metadata", e))
    }

    /// Encode for the metadata store.
    pub fn to_value(&self) -> Result<Value, DecodeError> {
        serde_json::to_value(self).map_err(|e| DecodeError::invalid("node metadata", e))
    }
}
