//! Credential Types

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::require_non_empty;
use crate::errors::{ConfigurationError, DecodeError};

/// How a credential is obtained and renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialKind {
    /// Short-lived token derived from a long-lived personal access token.
    #[serde(rename = "pat")]
    Pat,
    /// OAuth bearer token with a refresh token.
    #[serde(rename = "oauth")]
    OAuth,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pat => "pat",
            Self::OAuth => "oauth",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access credential held by the lifecycle manager.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Credential kind.
    pub kind: CredentialKind,
    /// Access token.
    pub access_token: SecretString,
    /// Refresh token (OAuth only).
    pub refresh_token: Option<SecretString>,
    /// Lifetime declared by the provider, if any.
    pub expires_in: Option<Duration>,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    /// Create a credential issued now.
    pub fn new(kind: CredentialKind, access_token: impl Into<String>) -> Self {
        Self {
            kind,
            access_token: SecretString::new(access_token.into()),
            refresh_token: None,
            expires_in: None,
            issued_at: Utc::now(),
        }
    }

    /// Set the refresh token.
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::new(token.into()));
        self
    }

    /// Set the declared lifetime.
    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Set the issue instant.
    pub fn issued_at(mut self, at: DateTime<Utc>) -> Self {
        self.issued_at = at;
        self
    }

    /// Expiry instant, when a lifetime was declared.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let lifetime = self.expires_in?;
        let lifetime = ChronoDuration::from_std(lifetime).ok()?;
        self.issued_at.checked_add_signed(lifetime)
    }

    /// Check whether the credential is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|at| at <= now).unwrap_or(false)
    }

    /// Check for an empty access token.
    pub fn is_empty(&self) -> bool {
        self.access_token.expose_secret().trim().is_empty()
    }

    /// Encode for the secret store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        let stored = StoredCredential {
            kind: self.kind,
            access_token: self.access_token.expose_secret().clone(),
            refresh_token: self
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().clone()),
            expires_in_secs: self.expires_in.map(|d| d.as_secs()),
            issued_at: self.issued_at,
        };
        serde_json::to_vec(&stored).map_err(|e| DecodeError::invalid("credential", e))
    }

    /// Decode from the secret store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let stored: StoredCredential =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::invalid("credential", e))?;
        Ok(Self {
            kind: stored.kind,
            access_token: SecretString::new(stored.access_token),
            refresh_token: stored.refresh_token.map(SecretString::new),
            expires_in: stored.expires_in_secs.map(Duration::from_secs),
            issued_at: stored.issued_at,
        })
    }
}

/// Secret-store encoding of a [`Credential`].
#[derive(Serialize, Deserialize)]
struct StoredCredential {
    kind: CredentialKind,
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_in_secs: Option<u64>,
    issued_at: DateTime<Utc>,
}

/// Long-lived identity material used to obtain credentials.
#[derive(Clone)]
pub enum Identity {
    /// Username and personal access token.
    Pat {
        username: String,
        token: SecretString,
    },
    /// OAuth client registration plus the one-time authorization code.
    OAuth {
        client_id: String,
        client_secret: SecretString,
        authorization_code: SecretString,
        redirect_uri: String,
    },
}

impl Identity {
    /// Build a PAT identity.
    pub fn pat(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self::Pat {
            username: username.into(),
            token: SecretString::new(token.into()),
        }
    }

    /// Build an OAuth identity.
    pub fn oauth(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        authorization_code: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self::OAuth {
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into()),
            authorization_code: SecretString::new(authorization_code.into()),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Kind of credential this identity produces.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Pat { .. } => CredentialKind::Pat,
            Self::OAuth { .. } => CredentialKind::OAuth,
        }
    }

    /// Trim all fields and reject empty ones.
    pub fn validate(&self) -> Result<Self, ConfigurationError> {
        match self {
            Self::Pat { username, token } => Ok(Self::Pat {
                username: require_non_empty("username", username)?,
                token: SecretString::new(require_non_empty("token", token.expose_secret())?),
            }),
            Self::OAuth {
                client_id,
                client_secret,
                authorization_code,
                redirect_uri,
            } => Ok(Self::OAuth {
                client_id: require_non_empty("client_id", client_id)?,
                client_secret: SecretString::new(require_non_empty(
                    "client_secret",
                    client_secret.expose_secret(),
                )?),
                authorization_code: SecretString::new(require_non_empty(
                    "authorization_code",
                    authorization_code.expose_secret(),
                )?),
                redirect_uri: require_non_empty("redirect_uri", redirect_uri)?,
            }),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pat { username, .. } => f
                .debug_struct("Pat")
                .field("username", username)
                .field("token", &"[REDACTED]")
                .finish(),
            Self::OAuth {
                client_id,
                redirect_uri,
                ..
            } => f
                .debug_struct("OAuth")
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .field("authorization_code", &"[REDACTED]")
                .field("redirect_uri", redirect_uri)
                .finish(),
        }
    }
}

/// An armed refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSchedule {
    /// Integration instance.
    pub instance: String,
    /// Credential kind being refreshed.
    pub kind: CredentialKind,
    /// Delay handed to the scheduler.
    pub delay: Duration,
    /// Instant the refresh is due.
    pub fire_at: DateTime<Utc>,
}
