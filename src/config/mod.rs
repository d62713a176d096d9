//! Configuration for the lifecycle engine.
//!
//! Supports configuration via:
//! - Explicit values
//! - Environment variables
//! - Builder pattern

use crate::credentials::{Credential, CredentialKind};
use crate::errors::{ConfigurationError, LifecycleResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Refresh interval for PAT-derived credentials when the provider declares no lifetime.
pub const DEFAULT_PAT_REFRESH_INTERVAL: Duration = Duration::from_secs(9 * 60);

/// Refresh interval for OAuth credentials when the provider declares no lifetime.
pub const DEFAULT_OAUTH_REFRESH_FALLBACK: Duration = Duration::from_secs(60 * 60);

/// Lower bound for any computed refresh delay.
pub const DEFAULT_MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Default timeout handed to the transport for outbound calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How an absent signature header is treated on inbound deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// Every delivery must carry a valid signature.
    #[default]
    Required,
    /// Unsigned deliveries are accepted; the delivery URL itself is the secret.
    /// A signature that is present is still verified.
    UrlSecrecyOnly,
}

impl SignatureMode {
    /// Parse from a boolean "require signature" flag.
    pub fn from_required(required: bool) -> Self {
        if required {
            Self::Required
        } else {
            Self::UrlSecrecyOnly
        }
    }
}

/// Credential refresh policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Interval for PAT-derived tokens without a declared lifetime.
    pub pat_interval: Duration,
    /// Interval for OAuth tokens without a declared lifetime.
    pub oauth_fallback: Duration,
    /// Minimum delay between refreshes.
    pub min_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            pat_interval: DEFAULT_PAT_REFRESH_INTERVAL,
            oauth_fallback: DEFAULT_OAUTH_REFRESH_FALLBACK,
            min_delay: DEFAULT_MIN_REFRESH_DELAY,
        }
    }
}

impl RefreshPolicy {
    /// Delay until `credential` should be renewed.
    ///
    /// Half the declared lifetime when there is one, otherwise the fallback
    /// interval for the credential kind. A declared lifetime always fires
    /// before expiry, even when `min_delay` is longer than the lifetime.
    pub fn delay_for(&self, credential: &Credential) -> Duration {
        match credential.expires_in {
            Some(lifetime) if !lifetime.is_zero() => {
                let latest = lifetime.saturating_sub((lifetime / 10).max(Duration::from_nanos(1)));
                (lifetime / 2).max(self.min_delay).min(latest)
            }
            _ => match credential.kind {
                CredentialKind::Pat => self.pat_interval,
                CredentialKind::OAuth => self.oauth_fallback,
            },
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Credential refresh policy.
    pub refresh: RefreshPolicy,
    /// Default signature mode for providers that sign deliveries.
    pub signature_mode: SignatureMode,
    /// Timeout attached to outbound requests.
    pub request_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh: RefreshPolicy::default(),
            signature_mode: SignatureMode::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl LifecycleConfig {
    /// Create a new configuration builder.
    pub fn builder() -> LifecycleConfigBuilder {
        LifecycleConfigBuilder::new()
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> LifecycleResult<Self> {
        let mut builder = LifecycleConfigBuilder::new();

        if let Ok(value) = std::env::var("LIFECYCLE_PAT_REFRESH_SECS") {
            builder = builder.pat_interval(parse_secs("LIFECYCLE_PAT_REFRESH_SECS", &value)?);
        }

        if let Ok(value) = std::env::var("LIFECYCLE_OAUTH_FALLBACK_SECS") {
            builder =
                builder.oauth_fallback(parse_secs("LIFECYCLE_OAUTH_FALLBACK_SECS", &value)?);
        }

        if let Ok(value) = std::env::var("LIFECYCLE_REQUIRE_SIGNATURE") {
            let required = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(ConfigurationError::invalid(
                        "LIFECYCLE_REQUIRE_SIGNATURE",
                        format!("expected a boolean, got {other:?}"),
                    )
                    .into())
                }
            };
            builder = builder.signature_mode(SignatureMode::from_required(required));
        }

        if let Ok(value) = std::env::var("LIFECYCLE_REQUEST_TIMEOUT_SECS") {
            builder =
                builder.request_timeout(parse_secs("LIFECYCLE_REQUEST_TIMEOUT_SECS", &value)?);
        }

        builder.build()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LifecycleResult<()> {
        if self.refresh.pat_interval.is_zero() {
            return Err(ConfigurationError::invalid("pat_interval", "must be non-zero").into());
        }
        if self.refresh.oauth_fallback.is_zero() {
            return Err(ConfigurationError::invalid("oauth_fallback", "must be non-zero").into());
        }
        if self.refresh.min_delay > self.refresh.pat_interval {
            return Err(ConfigurationError::invalid(
                "min_delay",
                "must not exceed the PAT refresh interval",
            )
            .into());
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigurationError::invalid("request_timeout", "must be non-zero").into());
        }
        Ok(())
    }
}

fn parse_secs(var: &str, value: &str) -> LifecycleResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigurationError::invalid(var, e.to_string()).into())
}

/// Builder for [`LifecycleConfig`].
#[derive(Debug, Default)]
pub struct LifecycleConfigBuilder {
    pat_interval: Option<Duration>,
    oauth_fallback: Option<Duration>,
    min_delay: Option<Duration>,
    signature_mode: Option<SignatureMode>,
    request_timeout: Option<Duration>,
}

impl LifecycleConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the PAT refresh interval.
    pub fn pat_interval(mut self, interval: Duration) -> Self {
        self.pat_interval = Some(interval);
        self
    }

    /// Set the OAuth fallback interval.
    pub fn oauth_fallback(mut self, interval: Duration) -> Self {
        self.oauth_fallback = Some(interval);
        self
    }

    /// Set the minimum refresh delay.
    pub fn min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = Some(delay);
        self
    }

    /// Set the default signature mode.
    pub fn signature_mode(mut self, mode: SignatureMode) -> Self {
        self.signature_mode = Some(mode);
        self
    }

    /// Set the outbound request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> LifecycleResult<LifecycleConfig> {
        let config = LifecycleConfig {
            refresh: RefreshPolicy {
                pat_interval: self.pat_interval.unwrap_or(DEFAULT_PAT_REFRESH_INTERVAL),
                oauth_fallback: self.oauth_fallback.unwrap_or(DEFAULT_OAUTH_REFRESH_FALLBACK),
                min_delay: self.min_delay.unwrap_or(DEFAULT_MIN_REFRESH_DELAY),
            },
            signature_mode: self.signature_mode.unwrap_or_default(),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Trim a required string field, rejecting empty values.
pub fn require_non_empty(field: &str, value: &str) -> Result<String, ConfigurationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigurationError::missing(field));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LifecycleConfig::default();
        assert_eq!(config.refresh.pat_interval, Duration::from_secs(540));
        assert_eq!(config.refresh.oauth_fallback, Duration::from_secs(3600));
        assert_eq!(config.signature_mode, SignatureMode::Required);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LifecycleConfig::builder()
            .pat_interval(Duration::from_secs(120))
            .signature_mode(SignatureMode::UrlSecrecyOnly)
            .build()
            .unwrap();

        assert_eq!(config.refresh.pat_interval, Duration::from_secs(120));
        assert_eq!(config.signature_mode, SignatureMode::UrlSecrecyOnly);
    }

    #[test]
    fn test_builder_rejects_zero_interval() {
        let result = LifecycleConfig::builder()
            .pat_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_delay_for() {
        let policy = RefreshPolicy::default();

        let declared = Credential::new(CredentialKind::OAuth, "t")
            .with_expires_in(Duration::from_secs(7200));
        assert_eq!(policy.delay_for(&declared), Duration::from_secs(3600));

        let undeclared = Credential::new(CredentialKind::OAuth, "t");
        assert_eq!(policy.delay_for(&undeclared), Duration::from_secs(3600));

        let pat = Credential::new(CredentialKind::Pat, "t");
        assert_eq!(policy.delay_for(&pat), Duration::from_secs(540));

        let tiny = Credential::new(CredentialKind::Pat, "t").with_expires_in(Duration::from_secs(1));
        assert_eq!(policy.delay_for(&tiny), Duration::from_millis(900));

        let short = Credential::new(CredentialKind::Pat, "t").with_expires_in(Duration::from_secs(4));
        assert_eq!(policy.delay_for(&short), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_for_fires_before_expiry() {
        let policy = RefreshPolicy {
            min_delay: Duration::from_secs(60),
            ..RefreshPolicy::default()
        };
        let lifetime = Duration::from_secs(30);
        let credential = Credential::new(CredentialKind::OAuth, "t").with_expires_in(lifetime);

        let delay = policy.delay_for(&credential);
        assert!(delay < lifetime);
        assert_eq!(delay, Duration::from_secs(27));

        let long = Credential::new(CredentialKind::OAuth, "t")
            .with_expires_in(Duration::from_secs(600));
        assert_eq!(policy.delay_for(&long), Duration::from_secs(300));
    }

    #[test]
    fn test_require_non_empty() {
        assert_eq!(require_non_empty("username", "  alice ").unwrap(), "alice");
        assert!(require_non_empty("username", "   ").is_err());
        assert!(require_non_empty("username", "").is_err());
    }

    #[test]
    fn test_signature_mode_serde() {
        let mode: SignatureMode = serde_json::from_str("\"url_secrecy_only\"").unwrap();
        assert_eq!(mode, SignatureMode::UrlSecrecyOnly);
    }
}
