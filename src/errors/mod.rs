//! Error types for the webhook lifecycle engine.
//!
//! Setup-time and refresh-time failures surface as [`LifecycleError`]. Inbound
//! delivery failures are [`DeliveryError`] values that map onto an HTTP status
//! code and never escape the dispatcher.

use std::time::Duration;
use thiserror::Error;

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Root error type for credential, reconciliation and collaborator failures.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Credential exchange or refresh rejected.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Provider answered a data call with a non-success status.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A remote resource referenced by configuration does not exist.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A stored or supplied value could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Secret store, metadata store or scheduler failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport failure.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl LifecycleError {
    /// Get error code for telemetry.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "LIFECYCLE_CONFIG",
            Self::Auth(_) => "LIFECYCLE_AUTH",
            Self::Remote(_) => "LIFECYCLE_REMOTE",
            Self::Validation(_) => "LIFECYCLE_VALIDATION",
            Self::Decode(_) => "LIFECYCLE_DECODE",
            Self::Storage(_) => "LIFECYCLE_STORAGE",
            Self::Network(_) => "LIFECYCLE_NETWORK",
        }
    }

    /// Check if the caller may retry the operation unchanged.
    ///
    /// Configuration, validation and credential failures are not retryable:
    /// retrying them would only repeat the same answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Remote(e) => e.is_retryable(),
            Self::Storage(_) => true,
            _ => false,
        }
    }

    /// Check if the credential chain is broken and needs operator attention.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Provider status code attached to the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth(AuthError::Rejected { status, .. }) => Some(*status),
            Self::Remote(RemoteError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Missing required field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Unknown provider: {name}")]
    UnknownProvider { name: String },
}

impl ConfigurationError {
    /// Shorthand for a missing required field.
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
        }
    }

    /// Shorthand for an invalid field value.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Credential exchange error.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Provider rejected the exchange; status and body are kept verbatim.
    #[error("Credential exchange rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("No credential stored for {name}")]
    NotFound { name: String },

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refreshed credential is not newer than the stored one: {message}")]
    StaleCredential { message: String },

    #[error("Invalid token response: {message}")]
    InvalidResponse { message: String },
}

/// Non-success answer from the provider on a data call.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Registration call succeeded at HTTP level but reported per-result errors.
    #[error("Webhook registration rejected: {}", .errors.join("; "))]
    RegistrationRejected { errors: Vec<String> },

    #[error("Unexpected response: {message}")]
    UnexpectedResponse { message: String },
}

impl RemoteError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A referenced remote resource does not exist or is not accessible.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{kind} not found: {name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("{kind} not accessible: {name}")]
    ResourceInaccessible { kind: String, name: String },
}

/// Decoding failure.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to decode {what}: {message}")]
    Invalid { what: String, message: String },
}

impl DecodeError {
    /// Build a decode error for the named value.
    pub fn invalid(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Invalid {
            what: what.into(),
            message: err.to_string(),
        }
    }
}

/// Collaborator storage error.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("Schedule failed: {message}")]
    ScheduleFailed { message: String },

    #[error("Provisioning failed: {message}")]
    ProvisioningFailed { message: String },
}

/// Transport error.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
}

/// Inbound delivery rejected at the authentication stage (HTTP 403).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("Missing signature header {header}")]
    MissingSignature { header: String },

    #[error("Malformed signature header {header}")]
    MalformedSignature { header: String },

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("No verification secret configured")]
    MissingSecret,
}

/// Inbound delivery body or discriminator is unusable (HTTP 400).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPayloadError {
    #[error("Body is not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("Missing event type")]
    MissingEventType,
}

/// Delivery-time error expressed purely as an HTTP status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] MalformedPayloadError),
}

impl DeliveryError {
    /// HTTP status to answer the provider with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Authentication(_) => 403,
            Self::MalformedPayload(_) => 400,
        }
    }
}

/// Build a credential-exchange error from a provider response.
pub fn auth_error_from_response(status: u16, body: &str) -> LifecycleError {
    LifecycleError::Auth(AuthError::Rejected {
        status,
        body: body.to_string(),
    })
}

/// Build a data-call error from a provider response.
pub fn remote_error_from_response(status: u16, body: &str) -> LifecycleError {
    LifecycleError::Remote(RemoteError::Status {
        status,
        body: body.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_keeps_status_and_body() {
        let err = auth_error_from_response(401, r#"{"message":"bad credentials"}"#);
        assert_eq!(err.status(), Some(401));
        assert!(err.to_string().contains("bad credentials"));
        assert!(err.needs_reauth());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_remote_retryable() {
        assert!(remote_error_from_response(503, "").is_retryable());
        assert!(remote_error_from_response(429, "").is_retryable());
        assert!(!remote_error_from_response(404, "").is_retryable());
        assert!(!LifecycleError::Remote(RemoteError::RegistrationRejected {
            errors: vec!["bad jql".to_string()]
        })
        .is_retryable());
    }

    #[test]
    fn test_delivery_status_mapping() {
        let err: DeliveryError = AuthenticationError::SignatureMismatch.into();
        assert_eq!(err.http_status(), 403);

        let err: DeliveryError = MalformedPayloadError::MissingEventType.into();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_registration_rejected_display() {
        let err = RemoteError::RegistrationRejected {
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Webhook registration rejected: a; b");
    }
}
