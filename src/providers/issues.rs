//! Issue tracker.
//!
//! OAuth credentials; one dynamic webhook per project, scoped by a JQL filter.
//! Registrations carry no secret, so unsigned deliveries are accepted on URL
//! secrecy unless the instance opts into signatures.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{id_string, segment, ApiClient, ProviderVariant};
use crate::config::{require_non_empty, SignatureMode};
use crate::credentials::{ClientAuthMethod, CredentialKind, Identity, OAuthTokenExchange};
use crate::errors::{ConfigurationError, LifecycleResult, RemoteError};
use crate::fixtures;
use crate::matcher::{matches_field, MatchMode, Predicate};
use crate::reconcile::{Registration, WebhookConfig, WebhookRegistrar};
use crate::transport::{HttpRequest, HttpTransport};
use crate::webhooks::{DeliveryRules, NormalizedEvent, SignatureScheme};

/// Signature header, `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

/// Events registered when the config names none.
pub const DEFAULT_EVENTS: [&str; 3] = [
    "jira:issue_created",
    "jira:issue_updated",
    "jira:issue_deleted",
];

#[derive(Debug, Clone, Deserialize)]
pub struct IssueTrackerSettings {
    /// Site URL, e.g. `https://tracker.example.com`.
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub authorization_code: SecretString,
    pub redirect_uri: String,
    #[serde(default)]
    pub client_auth: ClientAuthMethod,
    #[serde(default)]
    pub signature_mode: Option<SignatureMode>,
}

/// Desired webhook of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueWebhookConfig {
    /// Project key.
    pub project: String,
    /// Event allow-list. Empty registers [`DEFAULT_EVENTS`] and accepts all.
    #[serde(default)]
    pub events: Vec<String>,
    /// Issue type names to accept. Empty accepts all.
    #[serde(default)]
    pub issue_types: Vec<String>,
}

impl IssueWebhookConfig {
    /// Events to register, trimmed, sorted and deduplicated.
    pub fn registered_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .events
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if events.is_empty() {
            events = DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect();
        }
        events.sort();
        events.dedup();
        events
    }
}

impl WebhookConfig for IssueWebhookConfig {
    type Filter = (String, Vec<String>);

    fn filter(&self) -> Self::Filter {
        (self.project.trim().to_string(), self.registered_events())
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        require_non_empty("project", &self.project)?;
        Ok(())
    }
}

/// Dynamic webhook calls.
pub struct IssueRegistrar {
    client: ApiClient,
    base_url: String,
}

impl IssueRegistrar {
    pub fn new(client: ApiClient, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn webhook_url(&self) -> String {
        format!("{}/rest/api/3/webhook", self.base_url)
    }
}

#[async_trait]
impl WebhookRegistrar<IssueWebhookConfig> for IssueRegistrar {
    async fn verify_target(&self, config: &IssueWebhookConfig) -> LifecycleResult<String> {
        let project = config.project.trim();
        let url = format!("{}/rest/api/3/project/{}", self.base_url, segment(project));
        let body = self
            .client
            .verify(HttpRequest::get(url), "project", project)
            .await?;

        // Deliveries carry the key, even when the config names the project by id.
        Ok(body["key"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| project.to_string()))
    }

    async fn register(
        &self,
        config: &IssueWebhookConfig,
        url: &str,
        _secret: Option<&SecretString>,
    ) -> LifecycleResult<Registration> {
        let body = json!({
            "url": url,
            "webhooks": [{
                "events": config.registered_events(),
                "jqlFilter": format!("project = \"{}\"", config.project.trim()),
            }],
        });
        let request = HttpRequest::post(self.webhook_url()).json(&body)?;
        let response = self.client.send_json(request).await?;
        registration_from_response(&response)
    }

    async fn unregister(
        &self,
        _config: &IssueWebhookConfig,
        registration_id: &str,
    ) -> LifecycleResult<()> {
        let id = match registration_id.parse::<u64>() {
            Ok(n) => json!(n),
            Err(_) => json!(registration_id),
        };
        let request = HttpRequest::delete(self.webhook_url()).json(&json!({ "webhookIds": [id] }))?;
        self.client.delete(request).await
    }
}

/// Read the created id from a registration response.
///
/// The call succeeds at the HTTP level even when individual webhooks are
/// refused; any per-result error fails the whole registration.
fn registration_from_response(response: &Value) -> LifecycleResult<Registration> {
    let results = response["webhookRegistrationResult"]
        .as_array()
        .filter(|results| !results.is_empty())
        .ok_or_else(|| RemoteError::UnexpectedResponse {
            message: "no webhook registration result".to_string(),
        })?;

    let errors: Vec<String> = results
        .iter()
        .filter_map(|result| result["errors"].as_array())
        .flatten()
        .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
        .collect();
    if !errors.is_empty() {
        warn!(?errors, "Webhook registration refused");
        return Err(RemoteError::RegistrationRejected { errors }.into());
    }

    let id = id_string(&results[0]["createdWebhookId"]).ok_or_else(|| {
        RemoteError::UnexpectedResponse {
            message: "registration result carries no webhook id".to_string(),
        }
    })?;
    debug!(webhook_id = %id, "Issue webhook created");
    Ok(Registration { id })
}

/// Issue event handling.
pub struct IssueRules;

impl DeliveryRules for IssueRules {
    type Config = IssueWebhookConfig;

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::Hmac {
            header: SIGNATURE_HEADER,
            prefix: Some("sha256="),
        }
    }

    fn event_type_pointer(&self) -> Option<&'static str> {
        Some("/webhookEvent")
    }

    fn resource_identity(&self, payload: &Value) -> Option<String> {
        payload
            .pointer("/issue/fields/project/key")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn accept(&self, config: &IssueWebhookConfig, event_type: &str, payload: &Value) -> bool {
        if !config.events.is_empty() && !config.events.iter().any(|e| e.trim() == event_type) {
            return false;
        }
        let issue_types: Vec<Predicate> =
            config.issue_types.iter().map(Predicate::equals).collect();
        matches_field(
            payload,
            "/issue/fields/issuetype/name",
            &issue_types,
            MatchMode::Any,
        )
    }

    fn normalize(
        &self,
        _config: &IssueWebhookConfig,
        event_type: &str,
        payload: Value,
    ) -> NormalizedEvent {
        let action = event_type.strip_prefix("jira:issue_").unwrap_or(event_type);
        NormalizedEvent::new(
            format!("issues.issue.{action}"),
            payload.get("issue").cloned().unwrap_or(Value::Null),
        )
    }
}

/// Issue tracker provider.
pub struct IssueTracker;

impl ProviderVariant for IssueTracker {
    const NAME: &'static str = "issues";
    const EXAMPLE: &'static str = fixtures::ISSUES_ISSUE_CREATED;
    const KIND: CredentialKind = CredentialKind::OAuth;

    type Settings = IssueTrackerSettings;
    type Exchange = OAuthTokenExchange;
    type Config = IssueWebhookConfig;
    type Registrar = IssueRegistrar;
    type Rules = IssueRules;

    fn validate(settings: &IssueTrackerSettings) -> Result<(), ConfigurationError> {
        for (field, value) in [("base_url", &settings.base_url), ("token_url", &settings.token_url)] {
            let value = require_non_empty(field, value)?;
            Url::parse(&value).map_err(|e| ConfigurationError::invalid(field, e.to_string()))?;
        }
        Ok(())
    }

    fn identity(settings: &IssueTrackerSettings) -> Identity {
        Identity::oauth(
            &settings.client_id,
            settings.client_secret.expose_secret(),
            settings.authorization_code.expose_secret(),
            &settings.redirect_uri,
        )
    }

    fn exchange(
        settings: &IssueTrackerSettings,
        transport: Arc<dyn HttpTransport>,
        timeout: Duration,
    ) -> OAuthTokenExchange {
        OAuthTokenExchange::new(transport, settings.token_url.trim())
            .with_auth_method(settings.client_auth)
            .with_timeout(timeout)
    }

    fn registrar(
        settings: &IssueTrackerSettings,
        client: ApiClient,
    ) -> LifecycleResult<IssueRegistrar> {
        Ok(IssueRegistrar::new(client, &settings.base_url))
    }

    fn rules() -> IssueRules {
        IssueRules
    }

    fn signature_mode(settings: &IssueTrackerSettings, _default: SignatureMode) -> SignatureMode {
        settings
            .signature_mode
            .unwrap_or(SignatureMode::UrlSecrecyOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialSource;
    use crate::errors::LifecycleError;
    use crate::reconcile::NodeMetadata;
    use crate::transport::{HttpMethod, HttpResponse, MockHttpTransport};
    use crate::webhooks::{compute_signature, DeliveryContext, DeliveryPipeline, WebhookDelivery};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn registrar(transport: Arc<MockHttpTransport>) -> IssueRegistrar {
        let client = ApiClient::new(
            transport,
            Arc::new(StaticCredentialSource::new("oauth-token")),
            Duration::from_secs(5),
        );
        IssueRegistrar::new(client, "https://tracker.test")
    }

    fn config() -> IssueWebhookConfig {
        IssueWebhookConfig {
            project: "OPS".to_string(),
            events: vec![],
            issue_types: vec!["Bug".to_string()],
        }
    }

    #[test]
    fn test_filter_normalizes_events() {
        let a = IssueWebhookConfig {
            events: vec!["jira:issue_updated".into(), " jira:issue_created".into()],
            ..config()
        };
        let b = IssueWebhookConfig {
            events: vec![
                "jira:issue_created".into(),
                "jira:issue_updated".into(),
                "jira:issue_created".into(),
            ],
            issue_types: vec![],
            ..config()
        };
        assert_eq!(a.filter(), b.filter());
        assert_eq!(config().registered_events().len(), DEFAULT_EVENTS.len());
    }

    #[tokio::test]
    async fn test_register_reads_created_id() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(
            200,
            json!({"webhookRegistrationResult": [{"createdWebhookId": 10042}]}),
        );

        let registration = registrar(transport.clone())
            .register(&config(), "https://hooks.test/a", None)
            .await
            .unwrap();
        assert_eq!(registration.id, "10042");

        let request = transport.get_last_request().unwrap();
        let body: Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["webhooks"][0]["jqlFilter"], "project = \"OPS\"");
        assert_eq!(body["url"], "https://hooks.test/a");
    }

    #[tokio::test]
    async fn test_register_with_result_errors_fails() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(
            200,
            json!({"webhookRegistrationResult": [{"errors": ["Invalid JQL: project"]}]}),
        );

        let err = registrar(transport)
            .register(&config(), "https://hooks.test/a", None)
            .await
            .unwrap_err();
        match err {
            LifecycleError::Remote(RemoteError::RegistrationRejected { errors }) => {
                assert_eq!(errors, vec!["Invalid JQL: project".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verify_returns_project_key() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(200, json!({"id": "10000", "key": "OPS"}));
        let key = registrar(transport.clone())
            .verify_target(&IssueWebhookConfig {
                project: "10000".to_string(),
                ..config()
            })
            .await
            .unwrap();
        assert_eq!(key, "OPS");
        assert_eq!(
            transport.get_last_request().unwrap().url,
            "https://tracker.test/rest/api/3/project/10000"
        );
    }

    #[tokio::test]
    async fn test_unregister_sends_numeric_id() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_response(HttpResponse::new(202, ""));
        registrar(transport.clone())
            .unregister(&config(), "10042")
            .await
            .unwrap();

        let request = transport.get_last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Delete);
        assert_eq!(request.body.as_deref(), Some(r#"{"webhookIds":[10042]}"#));
    }

    fn metadata() -> NodeMetadata<IssueWebhookConfig> {
        NodeMetadata {
            config: config(),
            webhook_url: "https://hooks.test/a".to_string(),
            registration_id: "10042".to_string(),
            resource_id: "OPS".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_signed_delivery_with_carriage_return() {
        let body = br#"{"webhookEvent":"jira:issue_created","issue":{"key":"OPS-1","fields":{"summary":"a
b","project":{"key":"OPS"},"issuetype":{"name":"Bug"}}}}"#
            .to_vec();
        let mut body_with_cr = body.clone();
        let newline = body_with_cr.iter().position(|&b| b == b'\n').unwrap();
        body_with_cr.insert(newline, b'\r');

        let delivery = WebhookDelivery::new(body_with_cr.clone()).with_header(
            SIGNATURE_HEADER,
            format!("sha256={}", compute_signature(b"k", &body_with_cr)),
        );
        let config = config();
        let metadata = metadata();
        let response = DeliveryPipeline::new(IssueRules).handle(
            &delivery,
            DeliveryContext {
                config: &config,
                metadata: Some(&metadata),
                secret: Some(b"k".as_slice()),
                signature_mode: SignatureMode::Required,
            },
        );

        assert_eq!(response.status, 200);
        let event = response.event.unwrap();
        assert_eq!(event.event_type, "issues.issue.created");
        assert_eq!(event.data["fields"]["summary"], "ab");
    }

    #[test]
    fn test_rules_filter_issue_types_and_events() {
        let payload = (*fixtures::example(fixtures::ISSUES_ISSUE_CREATED)).clone();
        let rules = IssueRules;
        assert_eq!(rules.resource_identity(&payload).as_deref(), Some("OPS"));
        assert!(rules.accept(&config(), "jira:issue_created", &payload));

        let stories = IssueWebhookConfig {
            issue_types: vec!["Story".to_string()],
            ..config()
        };
        assert!(!rules.accept(&stories, "jira:issue_created", &payload));

        let updates_only = IssueWebhookConfig {
            events: vec!["jira:issue_updated".to_string()],
            ..config()
        };
        assert!(!rules.accept(&updates_only, "jira:issue_created", &payload));
    }

    #[test]
    fn test_unsigned_delivery_defaults_to_url_secrecy() {
        let settings: IssueTrackerSettings = serde_json::from_value(json!({
            "base_url": "https://tracker.test",
            "token_url": "https://auth.tracker.test/oauth/token",
            "client_id": "cid",
            "client_secret": "cs",
            "authorization_code": "code",
            "redirect_uri": "https://app.test/callback",
        }))
        .unwrap();
        IssueTracker::validate(&settings).unwrap();
        assert_eq!(settings.client_auth, ClientAuthMethod::RequestBody);
        assert_eq!(
            IssueTracker::signature_mode(&settings, SignatureMode::Required),
            SignatureMode::UrlSecrecyOnly
        );
    }
}
