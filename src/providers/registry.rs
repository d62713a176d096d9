//! Container image registry.
//!
//! Authenticates with a username and personal access token, registers
//! repository webhooks that echo a shared secret header, and emits
//! `registry.image.<type>` events for pushes.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{id_string, segment, ApiClient, ProviderVariant};
use crate::config::{require_non_empty, SignatureMode};
use crate::credentials::{CredentialKind, Identity, PatTokenExchange};
use crate::errors::{ConfigurationError, LifecycleResult, RemoteError};
use crate::fixtures;
use crate::matcher::{matches_field, MatchMode, Predicate};
use crate::reconcile::{Registration, WebhookConfig, WebhookRegistrar};
use crate::transport::{HttpRequest, HttpTransport};
use crate::webhooks::{DeliveryRules, NormalizedEvent, SignatureScheme};

/// Header the registry echoes the provisioned secret in.
pub const SECRET_HEADER: &str = "x-registry-webhook-secret";

/// Header carrying the event type.
pub const EVENT_HEADER: &str = "x-registry-event";

/// Instance settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    /// API base URL, e.g. `https://registry.example.com`.
    pub base_url: String,
    pub username: String,
    /// Personal access token.
    pub token: SecretString,
    #[serde(default)]
    pub signature_mode: Option<SignatureMode>,
}

/// Desired webhook of one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryWebhookConfig {
    pub namespace: String,
    pub repository: String,
    /// Tag filters; any match accepts. Empty accepts every push.
    #[serde(default)]
    pub tags: Vec<Predicate>,
}

impl RegistryWebhookConfig {
    /// `namespace/repository`, as pushes report it.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace.trim(), self.repository.trim())
    }
}

impl WebhookConfig for RegistryWebhookConfig {
    type Filter = (String, String);

    fn filter(&self) -> Self::Filter {
        (
            self.namespace.trim().to_string(),
            self.repository.trim().to_string(),
        )
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        require_non_empty("namespace", &self.namespace)?;
        require_non_empty("repository", &self.repository)?;
        Ok(())
    }
}

/// Repository webhook calls.
pub struct RegistryRegistrar {
    client: ApiClient,
    base_url: String,
}

impl RegistryRegistrar {
    pub fn new(client: ApiClient, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn repository_url(&self, config: &RegistryWebhookConfig) -> String {
        format!(
            "{}/v2/namespaces/{}/repositories/{}",
            self.base_url,
            segment(config.namespace.trim()),
            segment(config.repository.trim())
        )
    }
}

#[async_trait]
impl WebhookRegistrar<RegistryWebhookConfig> for RegistryRegistrar {
    fn needs_secret(&self) -> bool {
        true
    }

    async fn verify_target(&self, config: &RegistryWebhookConfig) -> LifecycleResult<String> {
        let name = config.full_name();
        self.client
            .verify(HttpRequest::get(self.repository_url(config)), "repository", &name)
            .await?;
        Ok(name)
    }

    async fn register(
        &self,
        config: &RegistryWebhookConfig,
        url: &str,
        secret: Option<&SecretString>,
    ) -> LifecycleResult<Registration> {
        let mut body = json!({
            "name": format!("lifecycle-{}", config.repository.trim()),
            "webhook_url": url,
        });
        if let Some(secret) = secret {
            body["headers"] = json!({ SECRET_HEADER: secret.expose_secret() });
        }

        let request =
            HttpRequest::post(format!("{}/webhooks", self.repository_url(config))).json(&body)?;
        let response = self.client.send_json(request).await?;

        let id = id_string(&response["id"]).ok_or_else(|| RemoteError::UnexpectedResponse {
            message: "webhook response carries no id".to_string(),
        })?;
        debug!(webhook_id = %id, "Registry webhook created");
        Ok(Registration { id })
    }

    async fn unregister(
        &self,
        config: &RegistryWebhookConfig,
        registration_id: &str,
    ) -> LifecycleResult<()> {
        let url = format!(
            "{}/webhooks/{}",
            self.repository_url(config),
            segment(registration_id)
        );
        self.client.delete(HttpRequest::delete(url)).await
    }
}

/// Push delivery handling.
pub struct RegistryRules;

impl DeliveryRules for RegistryRules {
    type Config = RegistryWebhookConfig;

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::SharedSecret {
            header: SECRET_HEADER,
        }
    }

    fn event_type_header(&self) -> Option<&'static str> {
        Some(EVENT_HEADER)
    }

    fn event_type_pointer(&self) -> Option<&'static str> {
        Some("/type")
    }

    fn resource_identity(&self, payload: &Value) -> Option<String> {
        payload
            .pointer("/repository/repo_name")
            .and_then(Value::as_str)
            .map(|name| name.trim().to_string())
    }

    fn accept(&self, config: &RegistryWebhookConfig, _event_type: &str, payload: &Value) -> bool {
        matches_field(payload, "/push_data/tag", &config.tags, MatchMode::Any)
    }

    fn normalize(
        &self,
        _config: &RegistryWebhookConfig,
        event_type: &str,
        payload: Value,
    ) -> NormalizedEvent {
        NormalizedEvent::new(
            format!("registry.image.{event_type}"),
            json!({
                "repository": payload.get("repository").cloned().unwrap_or(Value::Null),
                "push_data": payload.get("push_data").cloned().unwrap_or(Value::Null),
            }),
        )
    }
}

/// Image registry provider.
pub struct ImageRegistry;

impl ProviderVariant for ImageRegistry {
    const NAME: &'static str = "registry";
    const EXAMPLE: &'static str = fixtures::REGISTRY_PUSH;
    const KIND: CredentialKind = CredentialKind::Pat;

    type Settings = RegistrySettings;
    type Exchange = PatTokenExchange;
    type Config = RegistryWebhookConfig;
    type Registrar = RegistryRegistrar;
    type Rules = RegistryRules;

    fn validate(settings: &RegistrySettings) -> Result<(), ConfigurationError> {
        let base_url = require_non_empty("base_url", &settings.base_url)?;
        Url::parse(&base_url).map_err(|e| ConfigurationError::invalid("base_url", e.to_string()))?;
        require_non_empty("username", &settings.username)?;
        require_non_empty("token", settings.token.expose_secret())?;
        Ok(())
    }

    fn identity(settings: &RegistrySettings) -> Identity {
        Identity::pat(&settings.username, settings.token.expose_secret())
    }

    fn exchange(
        settings: &RegistrySettings,
        transport: Arc<dyn HttpTransport>,
        timeout: Duration,
    ) -> PatTokenExchange {
        PatTokenExchange::new(transport, &settings.base_url).with_timeout(timeout)
    }

    fn registrar(
        settings: &RegistrySettings,
        client: ApiClient,
    ) -> LifecycleResult<RegistryRegistrar> {
        Ok(RegistryRegistrar::new(client, &settings.base_url))
    }

    fn rules() -> RegistryRules {
        RegistryRules
    }

    fn signature_mode(settings: &RegistrySettings, default: SignatureMode) -> SignatureMode {
        settings.signature_mode.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialSource;
    use crate::errors::{LifecycleError, ValidationError};
    use crate::platform::{
        InMemoryMetadataStore, InMemoryProvisioner, InMemorySecretStore, RecordingScheduler,
        WebhookProvisioner,
    };
    use crate::providers::{Integration, Provider, ProviderContext};
    use crate::transport::{HttpMethod, HttpResponse, MockHttpTransport};
    use crate::webhooks::WebhookDelivery;
    use pretty_assertions::assert_eq;

    fn client(transport: Arc<MockHttpTransport>) -> ApiClient {
        ApiClient::new(
            transport,
            Arc::new(StaticCredentialSource::new("jwt")),
            Duration::from_secs(5),
        )
    }

    fn config() -> RegistryWebhookConfig {
        RegistryWebhookConfig {
            namespace: "acme".to_string(),
            repository: "app".to_string(),
            tags: vec![Predicate::wildcard("v*")],
        }
    }

    #[tokio::test]
    async fn test_register_sends_secret_header() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(201, json!({"id": 77}));
        let registrar = RegistryRegistrar::new(client(transport.clone()), "https://reg.test/");

        let secret = SecretString::new("shh".to_string());
        let registration = registrar
            .register(&config(), "https://hooks.test/1", Some(&secret))
            .await
            .unwrap();
        assert_eq!(registration.id, "77");

        let request = transport.get_last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(
            request.url,
            "https://reg.test/v2/namespaces/acme/repositories/app/webhooks"
        );
        let body: Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["webhook_url"], "https://hooks.test/1");
        assert_eq!(body["headers"][SECRET_HEADER], "shh");
    }

    #[tokio::test]
    async fn test_register_without_id_fails() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(201, json!({"name": "x"}));
        let registrar = RegistryRegistrar::new(client(transport), "https://reg.test");

        let err = registrar
            .register(&config(), "https://hooks.test/1", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Remote(RemoteError::UnexpectedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_missing_repository() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_response(HttpResponse::new(404, "{}"));
        let registrar = RegistryRegistrar::new(client(transport), "https://reg.test");

        let err = registrar.verify_target(&config()).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Validation(ValidationError::ResourceNotFound { ref name, .. })
                if name == "acme/app"
        ));
    }

    #[tokio::test]
    async fn test_unregister_addresses_hook() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_response(HttpResponse::new(204, ""));
        let registrar = RegistryRegistrar::new(client(transport.clone()), "https://reg.test");

        registrar.unregister(&config(), "77").await.unwrap();
        let request = transport.get_last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Delete);
        assert!(request.url.ends_with("/repositories/app/webhooks/77"));
    }

    #[test]
    fn test_filter_ignores_tags_and_whitespace() {
        let mut other = config();
        other.namespace = " acme ".to_string();
        other.tags.clear();
        assert_eq!(config().filter(), other.filter());
    }

    #[test]
    fn test_rules_on_example_payload() {
        let payload = (*fixtures::example(fixtures::REGISTRY_PUSH)).clone();
        let rules = RegistryRules;
        assert_eq!(rules.resource_identity(&payload).as_deref(), Some("acme/app"));
        assert!(rules.accept(&config(), "push", &payload));

        let mut release_only = config();
        release_only.tags = vec![Predicate::wildcard("release-*")];
        assert!(!rules.accept(&release_only, "push", &payload));

        let event = rules.normalize(&config(), "push", payload);
        assert_eq!(event.event_type, "registry.image.push");
        assert_eq!(event.data["push_data"]["tag"], "v1.4.2");
    }

    #[tokio::test]
    async fn test_provider_lifecycle() {
        let transport = Arc::new(MockHttpTransport::new());
        let secrets = Arc::new(InMemorySecretStore::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let scheduler = Arc::new(RecordingScheduler::new());
        let provisioner = Arc::new(InMemoryProvisioner::new("https://hooks.test"));
        let ctx = ProviderContext::new(
            "reg-1",
            json!({
                "base_url": "https://reg.test",
                "username": "ci",
                "token": "dckr_pat_123",
            }),
            transport.clone(),
            secrets,
            metadata.clone(),
            scheduler.clone(),
            provisioner,
        );
        let provider = Integration::<ImageRegistry>::new();
        let desired = json!({"namespace": "acme", "repository": "app"});

        transport.queue_json_response(200, json!({"access_token": "jwt-1", "expires_in": 300}));
        provider.refresh(&ctx).await.unwrap();
        assert_eq!(scheduler.calls().len(), 1);

        transport
            .queue_json_response(200, json!({"name": "app"}))
            .queue_json_response(201, json!({"id": "hook-9"}));
        let stored = provider.reconcile(&ctx, &desired).await.unwrap();
        assert_eq!(stored["registration_id"], "hook-9");
        assert_eq!(stored["resource_id"], "acme/app");
        assert_eq!(
            transport.get_last_request().unwrap().headers["authorization"],
            "Bearer jwt-1"
        );

        // Equivalent config: no further remote calls.
        let before = transport.request_count();
        provider.reconcile(&ctx, &desired).await.unwrap();
        assert_eq!(transport.request_count(), before);

        let body = fixtures::example(fixtures::REGISTRY_PUSH).to_string();
        let secret = String::from_utf8(provider_secret(&ctx).await).unwrap();
        let accepted = provider
            .authenticate(
                &ctx,
                &desired,
                &WebhookDelivery::new(body.clone()).with_header(SECRET_HEADER, secret),
            )
            .await;
        assert_eq!(accepted.status, 200);
        assert_eq!(accepted.event.unwrap().event_type, "registry.image.push");

        let rejected = provider
            .authenticate(
                &ctx,
                &desired,
                &WebhookDelivery::new(body).with_header(SECRET_HEADER, "wrong"),
            )
            .await;
        assert_eq!(rejected.status, 403);
        assert!(rejected.event.is_none());

        transport.queue_response(HttpResponse::new(204, ""));
        provider.cleanup(&ctx, &desired).await.unwrap();
        assert_eq!(metadata.snapshot(), None);
    }

    #[tokio::test]
    async fn test_failed_reconfigure_keeps_live_hook_working() {
        let transport = Arc::new(MockHttpTransport::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let ctx = ProviderContext::new(
            "reg-1",
            json!({"base_url": "https://reg.test", "username": "ci", "token": "pat"}),
            transport.clone(),
            Arc::new(InMemorySecretStore::new()),
            metadata.clone(),
            Arc::new(RecordingScheduler::new()),
            Arc::new(InMemoryProvisioner::new("https://hooks.test")),
        );
        let provider = Integration::<ImageRegistry>::new();
        let live = json!({"namespace": "acme", "repository": "app"});
        let moved = json!({"namespace": "acme", "repository": "app2"});

        transport
            .queue_json_response(200, json!({"access_token": "jwt-1"}))
            .queue_json_response(200, json!({"name": "app"}))
            .queue_json_response(201, json!({"id": 5}));
        provider.refresh(&ctx).await.unwrap();
        provider.reconcile(&ctx, &live).await.unwrap();
        let secret = String::from_utf8(provider_secret(&ctx).await).unwrap();
        let stored = metadata.snapshot();

        transport
            .queue_json_response(200, json!({"name": "app2"}))
            .queue_response(HttpResponse::new(500, "upstream down"));
        let err = provider.reconcile(&ctx, &moved).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Remote(_)));
        assert_eq!(metadata.snapshot(), stored);

        let body = fixtures::example(fixtures::REGISTRY_PUSH).to_string();
        let response = provider
            .authenticate(
                &ctx,
                &live,
                &WebhookDelivery::new(body).with_header(SECRET_HEADER, secret),
            )
            .await;
        assert_eq!(response.status, 200);
        assert!(response.event.is_some());

        transport.queue_response(HttpResponse::new(204, ""));
        provider.cleanup(&ctx, &moved).await.unwrap();
        assert_eq!(
            transport.get_last_request().unwrap().url,
            "https://reg.test/v2/namespaces/acme/repositories/app/webhooks/5"
        );
        assert_eq!(metadata.snapshot(), None);
    }

    async fn provider_secret(ctx: &ProviderContext) -> Vec<u8> {
        ctx.provisioner.get_secret().await.unwrap()
    }

    #[test]
    fn test_settings_validation() {
        let settings: RegistrySettings = serde_json::from_value(json!({
            "base_url": "not a url",
            "username": "ci",
            "token": "t",
        }))
        .unwrap();
        assert!(ImageRegistry::validate(&settings).is_err());
    }
}
