//! Inbound webhook deliveries.
//!
//! [`DeliveryPipeline::handle`] takes one delivery through authentication,
//! tolerant parsing, event classification, scope check, filtering and
//! normalization. Every outcome is an HTTP status plus at most one event.

mod payload;
mod signature;

pub use payload::{parse_tolerant, strip_control_bytes};
pub use signature::{
    authenticate, compute_signature, verify_hmac, verify_shared_secret, SignatureScheme,
};

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::SignatureMode;
use crate::errors::{DeliveryError, MalformedPayloadError};
use crate::observability::LifecycleMetrics;
use crate::reconcile::{NodeMetadata, WebhookConfig};

/// One inbound HTTP request.
#[derive(Debug, Clone, Default)]
pub struct WebhookDelivery {
    /// Headers keyed by lower-cased name.
    pub headers: HashMap<String, String>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl WebhookDelivery {
    /// Create a delivery with no headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Node state a delivery is checked against.
#[derive(Debug)]
pub struct DeliveryContext<'a, C> {
    /// Current desired config of the node.
    pub config: &'a C,
    /// Persisted metadata; `None` when the node never registered.
    pub metadata: Option<&'a NodeMetadata<C>>,
    /// Verification secret.
    pub secret: Option<&'a [u8]>,
    /// Treatment of unsigned deliveries.
    pub signature_mode: SignatureMode,
}

/// Event handed to the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    /// Provider-specific type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Resource-specific payload subset.
    pub data: Value,
}

impl NormalizedEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Why an authenticated delivery produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// The node has no live registration.
    NotRegistered,
    /// The payload belongs to another resource.
    ScopeMismatch,
    /// Configured filters did not match.
    PredicateMismatch,
}

/// Result of evaluating a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Accepted(NormalizedEvent),
    FilteredOut(FilterReason),
    Rejected(DeliveryError),
}

/// HTTP answer to the provider plus the emitted event.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResponse {
    pub status: u16,
    pub event: Option<NormalizedEvent>,
}

impl DeliveryResponse {
    /// Answer for a delivery the node could not evaluate, such as unreadable
    /// stored state. The provider is expected to redeliver.
    pub fn internal_error() -> Self {
        Self {
            status: 500,
            event: None,
        }
    }
}

impl From<DeliveryOutcome> for DeliveryResponse {
    fn from(outcome: DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Accepted(event) => Self {
                status: 200,
                event: Some(event),
            },
            DeliveryOutcome::FilteredOut(_) => Self {
                status: 200,
                event: None,
            },
            DeliveryOutcome::Rejected(err) => Self {
                status: err.http_status(),
                event: None,
            },
        }
    }
}

/// Provider-specific delivery handling.
pub trait DeliveryRules: Send + Sync {
    /// Desired config type of the provider.
    type Config: WebhookConfig;

    /// Authentication scheme.
    fn scheme(&self) -> SignatureScheme;

    /// Header carrying the event type, if the provider sends one.
    fn event_type_header(&self) -> Option<&'static str> {
        None
    }

    /// JSON pointer to the event type inside the body.
    fn event_type_pointer(&self) -> Option<&'static str> {
        None
    }

    /// Resource identity embedded in the payload.
    fn resource_identity(&self, payload: &Value) -> Option<String>;

    /// Apply configured filters.
    fn accept(&self, config: &Self::Config, event_type: &str, payload: &Value) -> bool;

    /// Build the emitted event.
    fn normalize(&self, config: &Self::Config, event_type: &str, payload: Value)
        -> NormalizedEvent;
}

/// Runs deliveries through a provider's [`DeliveryRules`].
pub struct DeliveryPipeline<R: DeliveryRules> {
    rules: R,
    metrics: Arc<LifecycleMetrics>,
}

impl<R: DeliveryRules> DeliveryPipeline<R> {
    pub fn new(rules: R) -> Self {
        Self {
            rules,
            metrics: Arc::new(LifecycleMetrics::new()),
        }
    }

    /// Share a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<LifecycleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Handle a delivery and answer with a status and optional event.
    pub fn handle(
        &self,
        delivery: &WebhookDelivery,
        context: DeliveryContext<'_, R::Config>,
    ) -> DeliveryResponse {
        self.evaluate(delivery, context).into()
    }

    /// Evaluate a delivery.
    #[instrument(skip_all, fields(body_len = delivery.body.len()))]
    pub fn evaluate(
        &self,
        delivery: &WebhookDelivery,
        context: DeliveryContext<'_, R::Config>,
    ) -> DeliveryOutcome {
        let outcome = self.run(delivery, context);
        match &outcome {
            DeliveryOutcome::Accepted(event) => {
                self.metrics.record_delivery_accepted();
                info!(event_type = %event.event_type, "Delivery accepted");
            }
            DeliveryOutcome::FilteredOut(reason) => {
                self.metrics.record_delivery_filtered();
                debug!(?reason, "Delivery filtered out");
            }
            DeliveryOutcome::Rejected(err) => {
                self.metrics.record_delivery_rejected();
                warn!(status = err.http_status(), error = %err, "Delivery rejected");
            }
        }
        outcome
    }

    fn run(
        &self,
        delivery: &WebhookDelivery,
        context: DeliveryContext<'_, R::Config>,
    ) -> DeliveryOutcome {
        if let Err(e) = authenticate(
            self.rules.scheme(),
            &delivery.headers,
            &delivery.body,
            context.secret,
            context.signature_mode,
        ) {
            return DeliveryOutcome::Rejected(e.into());
        }

        let payload = match parse_tolerant(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => return DeliveryOutcome::Rejected(e.into()),
        };

        let event_type = match self.event_type(delivery, &payload) {
            Some(event_type) => event_type,
            None => return DeliveryOutcome::Rejected(MalformedPayloadError::MissingEventType.into()),
        };

        let metadata = match context.metadata {
            Some(metadata) if !metadata.resource_id.is_empty() => metadata,
            _ => return DeliveryOutcome::FilteredOut(FilterReason::NotRegistered),
        };

        match self.rules.resource_identity(&payload) {
            Some(identity) if identity == metadata.resource_id => {}
            other => {
                debug!(
                    expected = %metadata.resource_id,
                    received = ?other,
                    "Delivery for another resource"
                );
                return DeliveryOutcome::FilteredOut(FilterReason::ScopeMismatch);
            }
        }

        if !self.rules.accept(context.config, &event_type, &payload) {
            return DeliveryOutcome::FilteredOut(FilterReason::PredicateMismatch);
        }

        DeliveryOutcome::Accepted(self.rules.normalize(context.config, &event_type, payload))
    }

    fn event_type(&self, delivery: &WebhookDelivery, payload: &Value) -> Option<String> {
        let from_header = self
            .rules
            .event_type_header()
            .and_then(|name| delivery.header(name))
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let from_body = || {
            self.rules
                .event_type_pointer()
                .and_then(|pointer| payload.pointer(pointer))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        from_header.or_else(from_body).map(str::to_string)
    }
}
