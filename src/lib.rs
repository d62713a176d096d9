//! # Webhook Lifecycle
//!
//! Credential and webhook lifecycle for SaaS provider integrations:
//! - Obtain access credentials from identity material and keep them renewed
//!   through a platform scheduler
//! - Reconcile a provider's webhook registration with a desired configuration,
//!   idempotently
//! - Authenticate, filter and normalize inbound deliveries
//! - Shared string matching for event filters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use integrations_webhook_lifecycle::platform::{
//!     InMemoryMetadataStore, InMemoryProvisioner, InMemorySecretStore, RecordingScheduler,
//! };
//! use integrations_webhook_lifecycle::transport::ReqwestHttpTransport;
//! use integrations_webhook_lifecycle::{ProviderContext, ProviderRegistry};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = ProviderContext::new(
//!         "registry-prod",
//!         json!({
//!             "base_url": "https://registry.example.com",
//!             "username": "ci",
//!             "token": "pat_xxxxxxxx",
//!         }),
//!         Arc::new(ReqwestHttpTransport::new(Duration::from_secs(30))?),
//!         Arc::new(InMemorySecretStore::new()),
//!         Arc::new(InMemoryMetadataStore::new()),
//!         Arc::new(RecordingScheduler::new()),
//!         Arc::new(InMemoryProvisioner::new("https://hooks.example.com")),
//!     );
//!
//!     let provider = ProviderRegistry::with_defaults().get("registry")?;
//!     provider.refresh(&ctx).await?;
//!     let metadata = provider
//!         .reconcile(&ctx, &json!({"namespace": "acme", "repository": "app"}))
//!         .await?;
//!     println!("registered {}", metadata["registration_id"]);
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;

// Outbound HTTP
pub mod transport;

// Platform collaborators
pub mod platform;

// Credential lifecycle
pub mod credentials;

// Webhook registration
pub mod reconcile;

// Inbound deliveries
pub mod matcher;
pub mod webhooks;

// Provider variants
pub mod providers;

// Example payloads
pub mod fixtures;

// Observability
pub mod observability;

// Re-exports for convenience
pub use config::{LifecycleConfig, LifecycleConfigBuilder, RefreshPolicy, SignatureMode};
pub use credentials::{Credential, CredentialKind, CredentialManager, Identity, RefreshSchedule};
pub use errors::{DeliveryError, LifecycleError, LifecycleResult};
pub use matcher::{MatchMode, Predicate};
pub use providers::{Provider, ProviderContext, ProviderRegistry};
pub use reconcile::{compare_config, NodeMetadata, ReconcileState, ReconciliationEngine};
pub use webhooks::{DeliveryOutcome, DeliveryResponse, NormalizedEvent, WebhookDelivery};
