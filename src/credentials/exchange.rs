//! Credential Exchange
//!
//! Provider-facing half of the credential lifecycle: turning identity material
//! into an access token and renewing it.

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::types::{Credential, CredentialKind, Identity};
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::errors::{auth_error_from_response, AuthError, ConfigurationError, LifecycleResult};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Exchanges identity material for access credentials.
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Kind of credential produced.
    fn kind(&self) -> CredentialKind;

    /// Exchange identity material for a fresh credential.
    async fn obtain(&self, identity: &Identity) -> LifecycleResult<Credential>;

    /// Renew a credential. `current` is the last stored credential, if any.
    async fn refresh(
        &self,
        identity: &Identity,
        current: Option<&Credential>,
    ) -> LifecycleResult<Credential>;
}

/// Token endpoint response shared by both exchanges.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn parse_token_response(response: &HttpResponse) -> LifecycleResult<TokenResponse> {
    if !response.is_success() {
        return Err(auth_error_from_response(response.status, &response.body));
    }

    let token: TokenResponse =
        serde_json::from_str(&response.body).map_err(|e| AuthError::InvalidResponse {
            message: e.to_string(),
        })?;

    if token.access_token.trim().is_empty() {
        return Err(AuthError::InvalidResponse {
            message: "token response carries no access_token".to_string(),
        }
        .into());
    }

    Ok(token)
}

fn wrong_identity(expected: CredentialKind) -> ConfigurationError {
    ConfigurationError::invalid("identity", format!("expected a {expected} identity"))
}

/// Derives short-lived tokens from a username and personal access token.
pub struct PatTokenExchange {
    transport: Arc<dyn HttpTransport>,
    token_url: String,
    timeout: Duration,
}

impl PatTokenExchange {
    /// Create an exchange against `{base_url}/v2/auth/token`.
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: &str) -> Self {
        Self {
            transport,
            token_url: format!("{}/v2/auth/token", base_url.trim_end_matches('/')),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CredentialExchange for PatTokenExchange {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Pat
    }

    #[instrument(skip(self, identity), fields(kind = "pat"))]
    async fn obtain(&self, identity: &Identity) -> LifecycleResult<Credential> {
        let (username, token) = match identity.validate()? {
            Identity::Pat { username, token } => (username, token),
            Identity::OAuth { .. } => return Err(wrong_identity(CredentialKind::Pat).into()),
        };

        let request = HttpRequest::post(&self.token_url)
            .json(&serde_json::json!({
                "identifier": username,
                "secret": token.expose_secret(),
            }))?
            .timeout(self.timeout);

        let response = self.transport.send(request).await?;
        let token = parse_token_response(&response)?;
        debug!(expires_in = ?token.expires_in, "Obtained PAT-derived token");

        let mut credential = Credential::new(CredentialKind::Pat, token.access_token);
        credential.expires_in = token.expires_in.map(Duration::from_secs);
        Ok(credential)
    }

    async fn refresh(
        &self,
        identity: &Identity,
        _current: Option<&Credential>,
    ) -> LifecycleResult<Credential> {
        self.obtain(identity).await
    }
}

/// Where OAuth client credentials are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `client_id` and `client_secret` form fields.
    #[default]
    RequestBody,
    /// HTTP Basic `Authorization` header.
    BasicAuth,
}

/// OAuth authorization-code and refresh-token grants.
pub struct OAuthTokenExchange {
    transport: Arc<dyn HttpTransport>,
    token_url: String,
    auth_method: ClientAuthMethod,
    timeout: Duration,
}

impl OAuthTokenExchange {
    /// Create an exchange against a token endpoint.
    pub fn new(transport: Arc<dyn HttpTransport>, token_url: impl Into<String>) -> Self {
        Self {
            transport,
            token_url: token_url.into(),
            auth_method: ClientAuthMethod::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the client authentication method.
    pub fn with_auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request_token(
        &self,
        client_id: &str,
        client_secret: &SecretString,
        mut params: Vec<(&'static str, String)>,
    ) -> LifecycleResult<TokenResponse> {
        if self.auth_method == ClientAuthMethod::RequestBody {
            params.push(("client_id", client_id.to_string()));
            params.push(("client_secret", client_secret.expose_secret().clone()));
        }

        let mut request = HttpRequest::post(&self.token_url)
            .form(&params)?
            .timeout(self.timeout);

        if self.auth_method == ClientAuthMethod::BasicAuth {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", client_id, client_secret.expose_secret()));
            request = request.header("authorization", format!("Basic {encoded}"));
        }

        let response = self.transport.send(request).await?;
        parse_token_response(&response)
    }
}

fn oauth_credential(token: TokenResponse, previous_refresh: Option<&SecretString>) -> Credential {
    let mut credential = Credential::new(CredentialKind::OAuth, token.access_token);
    credential.expires_in = token.expires_in.map(Duration::from_secs);
    credential.refresh_token = token
        .refresh_token
        .filter(|t| !t.trim().is_empty())
        .map(SecretString::new)
        .or_else(|| previous_refresh.cloned());
    credential
}

#[async_trait]
impl CredentialExchange for OAuthTokenExchange {
    fn kind(&self) -> CredentialKind {
        CredentialKind::OAuth
    }

    #[instrument(skip(self, identity), fields(kind = "oauth"))]
    async fn obtain(&self, identity: &Identity) -> LifecycleResult<Credential> {
        let Identity::OAuth {
            client_id,
            client_secret,
            authorization_code,
            redirect_uri,
        } = identity.validate()?
        else {
            return Err(wrong_identity(CredentialKind::OAuth).into());
        };

        let params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", authorization_code.expose_secret().clone()),
            ("redirect_uri", redirect_uri),
        ];

        let token = self.request_token(&client_id, &client_secret, params).await?;
        debug!(
            expires_in = ?token.expires_in,
            has_refresh_token = token.refresh_token.is_some(),
            "Exchanged authorization code"
        );
        Ok(oauth_credential(token, None))
    }

    #[instrument(skip(self, identity, current), fields(kind = "oauth"))]
    async fn refresh(
        &self,
        identity: &Identity,
        current: Option<&Credential>,
    ) -> LifecycleResult<Credential> {
        let Identity::OAuth {
            client_id,
            client_secret,
            ..
        } = identity.validate()?
        else {
            return Err(wrong_identity(CredentialKind::OAuth).into());
        };

        let refresh_token = current
            .and_then(|c| c.refresh_token.as_ref())
            .filter(|t| !t.expose_secret().trim().is_empty())
            .ok_or(AuthError::NoRefreshToken)?;

        let params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.expose_secret().clone()),
        ];

        let token = self.request_token(&client_id, &client_secret, params).await?;
        debug!(
            expires_in = ?token.expires_in,
            rotated = token.refresh_token.is_some(),
            "Refreshed OAuth token"
        );
        Ok(oauth_credential(token, Some(refresh_token)))
    }
}
