//! IT service management platform.
//!
//! OAuth credentials against the instance's own token endpoint. Webhooks are
//! registered per table and signed with a provisioned secret.

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
use crate::credentials::{ClientAuthMethod, CredentialKind, Identity, OAuthTokenExchange};
use crate::errors::{ConfigurationError, LifecycleResult, RemoteError, ValidationError};
use crate::fixtures;
use crate::matcher::{matches_predicates, MatchMode, Predicate};
use crate::reconcile::{Registration, WebhookConfig, WebhookRegistrar};
use crate::transport::{HttpRequest, HttpTransport};
use crate::webhooks::{DeliveryRules, NormalizedEvent, SignatureScheme};

/// Hex HMAC-SHA256 of the body, no prefix.
pub const SIGNATURE_HEADER: &str = "x-itsm-signature";

pub const EVENT_HEADER: &str = "x-itsm-event";

#[derive(Debug, Clone, Deserialize)]
pub struct ItsmSettings {
    /// Instance URL, e.g. `https://acme-prod.itsm.example.com`.
    pub instance_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub authorization_code: SecretString,
    pub redirect_uri: String,
    #[serde(default)]
    pub client_auth: ClientAuthMethod,
    #[serde(default)]
    pub signature_mode: Option<SignatureMode>,
}

impl ItsmSettings {
    fn base_url(&self) -> &str {
        self.instance_url.trim().trim_end_matches('/')
    }
}

/// Instance name: the first label of the instance host.
pub fn instance_name(instance_url: &str) -> Result<String, ConfigurationError> {
    let url = Url::parse(instance_url.trim())
        .map_err(|e| ConfigurationError::invalid("instance_url", e.to_string()))?;
    url.host_str()
        .and_then(|host| host.split('.').next())
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigurationError::invalid("instance_url", "URL has no host"))
}

/// Desired webhook of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItsmWebhookConfig {
    pub table: String,
    /// Record event filters, e.g. `inserted`, `updated`. Empty accepts all.
    #[serde(default)]
    pub event_types: Vec<Predicate>,
}

impl WebhookConfig for ItsmWebhookConfig {
    type Filter = String;

    fn filter(&self) -> String {
        self.table.trim().to_string()
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        require_non_empty("table", &self.table)?;
        Ok(())
    }
}

/// Table webhook calls.
pub struct ItsmRegistrar {
    client: ApiClient,
    base_url: String,
    instance: String,
}

impl ItsmRegistrar {
    pub fn new(client: ApiClient, instance_url: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            client,
            base_url: instance_url.trim().trim_end_matches('/').to_string(),
            instance: instance_name(instance_url)?,
        })
    }

    fn webhooks_url(&self) -> String {
        format!("{}/api/now/v1/webhooks", self.base_url)
    }
}

#[async_trait]
impl WebhookRegistrar<ItsmWebhookConfig> for ItsmRegistrar {
    fn needs_secret(&self) -> bool {
        true
    }

    async fn verify_target(&self, config: &ItsmWebhookConfig) -> LifecycleResult<String> {
        let table = config.table.trim();
        let url = format!(
            "{}/api/now/table/sys_db_object?sysparm_query=name%3D{}&sysparm_limit=1",
            self.base_url,
            segment(table)
        );
        let body = self.client.verify(HttpRequest::get(url), "table", table).await?;

        let found = body["result"].as_array().is_some_and(|rows| !rows.is_empty());
        if !found {
            return Err(ValidationError::ResourceNotFound {
                kind: "table".to_string(),
                name: table.to_string(),
            }
            .into());
        }
        Ok(self.instance.clone())
    }

    async fn register(
        &self,
        config: &ItsmWebhookConfig,
        url: &str,
        secret: Option<&SecretString>,
    ) -> LifecycleResult<Registration> {
        let body = json!({
            "table": config.table.trim(),
            "url": url,
            "secret": secret.map(|s| s.expose_secret().as_str()),
        });
        let request = HttpRequest::post(self.webhooks_url()).json(&body)?;
        let response = self.client.send_json(request).await?;

        let id = id_string(&response["result"]["sys_id"]).ok_or_else(|| {
            RemoteError::UnexpectedResponse {
                message: "webhook response carries no sys_id".to_string(),
            }
        })?;
        debug!(sys_id = %id, table = %config.table, "Table webhook created");
        Ok(Registration { id })
    }

    async fn unregister(
        &self,
        config: &ItsmWebhookConfig,
        registration_id: &str,
    ) -> LifecycleResult<()> {
        let url = format!(
            "{}/{}?table={}",
            self.webhooks_url(),
            segment(registration_id),
            segment(config.table.trim())
        );
        self.client.delete(HttpRequest::delete(url)).await
    }
}

/// Record event handling.
pub struct ItsmRules;

impl DeliveryRules for ItsmRules {
    type Config = ItsmWebhookConfig;

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::Hmac {
            header: SIGNATURE_HEADER,
            prefix: None,
        }
    }

    fn event_type_header(&self) -> Option<&'static str> {
        Some(EVENT_HEADER)
    }

    fn event_type_pointer(&self) -> Option<&'static str> {
        Some("/event_type")
    }

    fn resource_identity(&self, payload: &Value) -> Option<String> {
        payload
            .get("instance")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn accept(&self, config: &ItsmWebhookConfig, event_type: &str, payload: &Value) -> bool {
        let same_table = match payload.get("table").and_then(Value::as_str) {
            Some(table) => table == config.table.trim(),
            None => true,
        };
        same_table && matches_predicates(event_type, &config.event_types, MatchMode::Any)
    }

    fn normalize(
        &self,
        config: &ItsmWebhookConfig,
        event_type: &str,
        payload: Value,
    ) -> NormalizedEvent {
        NormalizedEvent::new(
            format!("itsm.{}.{}", config.table.trim(), event_type),
            payload.get("record").cloned().unwrap_or(Value::Null),
        )
    }
}

/// ITSM provider.
pub struct Itsm;

impl ProviderVariant for Itsm {
    const NAME: &'static str = "itsm";
    const EXAMPLE: &'static str = fixtures::ITSM_RECORD_UPDATED;
    const KIND: CredentialKind = CredentialKind::OAuth;

    type Settings = ItsmSettings;
    type Exchange = OAuthTokenExchange;
    type Config = ItsmWebhookConfig;
    type Registrar = ItsmRegistrar;
    type Rules = ItsmRules;

    fn validate(settings: &ItsmSettings) -> Result<(), ConfigurationError> {
        instance_name(&settings.instance_url)?;
        Ok(())
    }

    fn identity(settings: &ItsmSettings) -> Identity {
        Identity::oauth(
            &settings.client_id,
            settings.client_secret.expose_secret(),
            settings.authorization_code.expose_secret(),
            &settings.redirect_uri,
        )
    }

    fn exchange(
        settings: &ItsmSettings,
        transport: Arc<dyn HttpTransport>,
        timeout: Duration,
    ) -> OAuthTokenExchange {
        OAuthTokenExchange::new(transport, format!("{}/oauth_token.do", settings.base_url()))
            .with_auth_method(settings.client_auth)
            .with_timeout(timeout)
    }

    fn registrar(settings: &ItsmSettings, client: ApiClient) -> LifecycleResult<ItsmRegistrar> {
        Ok(ItsmRegistrar::new(client, &settings.instance_url)?)
    }

    fn rules() -> ItsmRules {
        ItsmRules
    }

    fn signature_mode(settings: &ItsmSettings, default: SignatureMode) -> SignatureMode {
        settings.signature_mode.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialSource;
    use crate::errors::LifecycleError;
    use crate::transport::MockHttpTransport;
    use pretty_assertions::assert_eq;

    fn registrar(transport: Arc<MockHttpTransport>) -> ItsmRegistrar {
        let client = ApiClient::new(
            transport,
            Arc::new(StaticCredentialSource::new("tok")),
            Duration::from_secs(5),
        );
        ItsmRegistrar::new(client, "https://acme-prod.itsm.test/").unwrap()
    }

    fn config() -> ItsmWebhookConfig {
        ItsmWebhookConfig {
            table: "incident".to_string(),
            event_types: vec![],
        }
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("https://acme-prod.itsm.test").unwrap(), "acme-prod");
        assert!(instance_name("not a url").is_err());
    }

    #[tokio::test]
    async fn test_verify_checks_table_exists() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_json_response(200, json!({"result": [{"name": "incident"}]}))
            .queue_json_response(200, json!({"result": []}));
        let registrar = registrar(transport.clone());

        assert_eq!(registrar.verify_target(&config()).await.unwrap(), "acme-prod");
        assert_eq!(
            transport.get_last_request().unwrap().url,
            "https://acme-prod.itsm.test/api/now/table/sys_db_object?sysparm_query=name%3Dincident&sysparm_limit=1"
        );

        let err = registrar.verify_target(&config()).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Validation(ValidationError::ResourceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_json_response(201, json!({"result": {"sys_id": "abc123"}}))
            .queue_json_response(200, json!({}));
        let registrar = registrar(transport.clone());

        let secret = SecretString::new("hmac-key".to_string());
        let registration = registrar
            .register(&config(), "https://hooks.test/i", Some(&secret))
            .await
            .unwrap();
        assert_eq!(registration.id, "abc123");

        let sent: Value =
            serde_json::from_str(transport.get_requests()[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(sent["secret"], "hmac-key");
        assert_eq!(sent["table"], "incident");

        registrar.unregister(&config(), "abc123").await.unwrap();
        assert_eq!(
            transport.get_last_request().unwrap().url,
            "https://acme-prod.itsm.test/api/now/v1/webhooks/abc123?table=incident"
        );
    }

    #[test]
    fn test_rules_on_example_payload() {
        let payload = (*fixtures::example(fixtures::ITSM_RECORD_UPDATED)).clone();
        let rules = ItsmRules;
        assert_eq!(rules.resource_identity(&payload).as_deref(), Some("acme-prod"));
        assert!(rules.accept(&config(), "updated", &payload));

        let inserts_only = ItsmWebhookConfig {
            event_types: vec![Predicate::equals("inserted")],
            ..config()
        };
        assert!(!rules.accept(&inserts_only, "updated", &payload));

        let problems = ItsmWebhookConfig {
            table: "problem".to_string(),
            ..config()
        };
        assert!(!rules.accept(&problems, "updated", &payload));

        let event = rules.normalize(&config(), "updated", payload);
        assert_eq!(event.event_type, "itsm.incident.updated");
        assert_eq!(event.data["number"], "INC0010023");
    }

    #[test]
    fn test_exchange_targets_instance_token_endpoint() {
        let settings: ItsmSettings = serde_json::from_value(json!({
            "instance_url": "https://acme-prod.itsm.test/",
            "client_id": "cid",
            "client_secret": "cs",
            "authorization_code": "code",
            "redirect_uri": "https://app.test/cb",
            "client_auth": "basic_auth",
        }))
        .unwrap();
        assert_eq!(settings.base_url(), "https://acme-prod.itsm.test");
        assert_eq!(settings.client_auth, ClientAuthMethod::BasicAuth);
        Itsm::validate(&settings).unwrap();
    }
}
