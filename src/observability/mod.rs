//! Observability: structured logging setup, secret redaction and lifecycle metrics.

mod logging;
mod metrics;

pub use logging::{init_logging, redact_token, redact_url, LogFormat, LogLevel, LoggingConfig};
pub use metrics::{LifecycleMetrics, MetricsSnapshot};
