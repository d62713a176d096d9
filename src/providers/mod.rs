//! Provider Integrations
//!
//! Every provider exposes the same capability set through [`Provider`]:
//! refresh its credential, reconcile its webhook registration, and
//! authenticate inbound deliveries. [`ProviderRegistry`] selects an
//! implementation by name.
//!
//! The three variants share [`Integration`], which decodes untyped settings
//! and desired config once, then drives the credential manager,
//! reconciliation engine and delivery pipeline with typed values.

pub mod issues;
pub mod itsm;
pub mod registry;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, instrument};

use crate::config::{LifecycleConfig, SignatureMode};
use crate::credentials::{
    CredentialExchange, CredentialKind, CredentialManager, CredentialSource, Identity,
    RefreshSchedule,
};
use crate::errors::{
    remote_error_from_response, ConfigurationError, DecodeError, LifecycleResult, ValidationError,
};
use crate::fixtures;
use crate::observability::LifecycleMetrics;
use crate::platform::{MetadataStore, Scheduler, SecretStore, WebhookProvisioner};
use crate::reconcile::{
    decode_config, NodeMetadata, ReconciliationEngine, WebhookConfig, WebhookRegistrar,
};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::webhooks::{
    DeliveryContext, DeliveryPipeline, DeliveryResponse, DeliveryRules, WebhookDelivery,
};

/// Collaborators and settings of one integration node.
pub struct ProviderContext {
    /// Integration instance name; keys the stored credential.
    pub instance: String,
    /// Untyped instance settings.
    pub settings: Value,
    pub transport: Arc<dyn HttpTransport>,
    pub secrets: Arc<dyn SecretStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub provisioner: Arc<dyn WebhookProvisioner>,
    pub config: LifecycleConfig,
    pub metrics: Arc<LifecycleMetrics>,
}

impl ProviderContext {
    /// Create a context with default engine configuration.
    pub fn new(
        instance: impl Into<String>,
        settings: Value,
        transport: Arc<dyn HttpTransport>,
        secrets: Arc<dyn SecretStore>,
        metadata: Arc<dyn MetadataStore>,
        scheduler: Arc<dyn Scheduler>,
        provisioner: Arc<dyn WebhookProvisioner>,
    ) -> Self {
        Self {
            instance: instance.into(),
            settings,
            transport,
            secrets,
            metadata,
            scheduler,
            provisioner,
            config: LifecycleConfig::default(),
            metrics: Arc::new(LifecycleMetrics::new()),
        }
    }

    /// Set the engine configuration.
    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<LifecycleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Capabilities every provider offers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key.
    fn name(&self) -> &'static str;

    /// Credential kind the provider uses.
    fn credential_kind(&self) -> CredentialKind;

    /// Renew the credential, starting the chain if none is stored.
    async fn refresh(&self, ctx: &ProviderContext) -> LifecycleResult<RefreshSchedule>;

    /// Converge the webhook registration, returning the stored metadata.
    async fn reconcile(&self, ctx: &ProviderContext, desired: &Value) -> LifecycleResult<Value>;

    /// Remove the webhook registration.
    async fn cleanup(&self, ctx: &ProviderContext, desired: &Value) -> LifecycleResult<()>;

    /// Handle an inbound delivery.
    async fn authenticate(
        &self,
        ctx: &ProviderContext,
        desired: &Value,
        delivery: &WebhookDelivery,
    ) -> DeliveryResponse;

    /// Example delivery payload.
    fn example_event(&self) -> Arc<Value>;
}

/// Typed description of one provider.
pub trait ProviderVariant: Send + Sync + 'static {
    /// Registry key.
    const NAME: &'static str;
    /// Fixture path of the example payload.
    const EXAMPLE: &'static str;
    /// Credential kind.
    const KIND: CredentialKind;

    /// Instance settings.
    type Settings: DeserializeOwned + Send + Sync;
    type Exchange: CredentialExchange + 'static;
    type Config: WebhookConfig;
    type Registrar: WebhookRegistrar<Self::Config>;
    type Rules: DeliveryRules<Config = Self::Config>;

    /// Check required settings.
    fn validate(settings: &Self::Settings) -> Result<(), ConfigurationError>;

    /// Identity material used to obtain credentials.
    fn identity(settings: &Self::Settings) -> Identity;

    fn exchange(
        settings: &Self::Settings,
        transport: Arc<dyn HttpTransport>,
        timeout: Duration,
    ) -> Self::Exchange;

    fn registrar(
        settings: &Self::Settings,
        client: ApiClient,
    ) -> LifecycleResult<Self::Registrar>;

    fn rules() -> Self::Rules;

    /// Signature mode for deliveries; `default` comes from engine config.
    fn signature_mode(settings: &Self::Settings, default: SignatureMode) -> SignatureMode;
}

/// [`Provider`] implementation shared by all variants.
pub struct Integration<V: ProviderVariant> {
    _variant: PhantomData<fn() -> V>,
}

impl<V: ProviderVariant> Integration<V> {
    pub fn new() -> Self {
        Self {
            _variant: PhantomData,
        }
    }

    /// Decode and validate instance settings.
    pub fn settings(ctx: &ProviderContext) -> LifecycleResult<V::Settings> {
        let settings: V::Settings = serde_json::from_value(ctx.settings.clone())
            .map_err(|e| DecodeError::invalid(format!("{} settings", V::NAME), e))?;
        V::validate(&settings)?;
        Ok(settings)
    }

    /// Decode and validate a desired webhook config.
    pub fn desired(desired: &Value) -> LifecycleResult<V::Config> {
        let config: V::Config = decode_config(desired)?;
        config.validate()?;
        Ok(config)
    }

    fn credentials(
        ctx: &ProviderContext,
        settings: &V::Settings,
    ) -> LifecycleResult<CredentialManager<V::Exchange>> {
        let exchange = V::exchange(settings, ctx.transport.clone(), ctx.config.request_timeout);
        Ok(CredentialManager::new(
            ctx.instance.clone(),
            V::identity(settings),
            exchange,
            ctx.secrets.clone(),
            ctx.scheduler.clone(),
        )?
        .with_policy(ctx.config.refresh.clone())
        .with_metrics(ctx.metrics.clone()))
    }

    fn engine(
        ctx: &ProviderContext,
        settings: &V::Settings,
    ) -> LifecycleResult<ReconciliationEngine<V::Config, V::Registrar>> {
        let credentials: Arc<dyn CredentialSource> = Arc::new(Self::credentials(ctx, settings)?);
        let client = ApiClient::new(ctx.transport.clone(), credentials, ctx.config.request_timeout);
        let registrar = V::registrar(settings, client)?;
        Ok(
            ReconciliationEngine::new(registrar, ctx.metadata.clone(), ctx.provisioner.clone())
                .with_metrics(ctx.metrics.clone()),
        )
    }
}

impl<V: ProviderVariant> Default for Integration<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V: ProviderVariant> Provider for Integration<V> {
    fn name(&self) -> &'static str {
        V::NAME
    }

    fn credential_kind(&self) -> CredentialKind {
        V::KIND
    }

    #[instrument(skip_all, fields(provider = V::NAME, instance = %ctx.instance))]
    async fn refresh(&self, ctx: &ProviderContext) -> LifecycleResult<RefreshSchedule> {
        let settings = Self::settings(ctx)?;
        Self::credentials(ctx, &settings)?.renew().await
    }

    #[instrument(skip_all, fields(provider = V::NAME, instance = %ctx.instance))]
    async fn reconcile(&self, ctx: &ProviderContext, desired: &Value) -> LifecycleResult<Value> {
        let settings = Self::settings(ctx)?;
        let desired = Self::desired(desired)?;
        let metadata = Self::engine(ctx, &settings)?.sync(&desired).await?;
        Ok(metadata.to_value()?)
    }

    #[instrument(skip_all, fields(provider = V::NAME, instance = %ctx.instance))]
    async fn cleanup(&self, ctx: &ProviderContext, desired: &Value) -> LifecycleResult<()> {
        let settings = Self::settings(ctx)?;
        let desired = Self::desired(desired)?;
        let engine = Self::engine(ctx, &settings)?;
        match engine.load().await? {
            Some(metadata) => engine.cleanup(&metadata, &desired).await,
            None => Ok(()),
        }
    }

    #[instrument(skip_all, fields(provider = V::NAME, instance = %ctx.instance))]
    async fn authenticate(
        &self,
        ctx: &ProviderContext,
        desired: &Value,
        delivery: &WebhookDelivery,
    ) -> DeliveryResponse {
        let prepared = async {
            let settings = Self::settings(ctx)?;
            let config = Self::desired(desired)?;
            let metadata = match ctx.metadata.get().await? {
                Some(value) if !value.is_null() => Some(NodeMetadata::<V::Config>::from_value(value)?),
                _ => None,
            };
            LifecycleResult::Ok((settings, config, metadata))
        }
        .await;

        let (settings, config, metadata) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Cannot evaluate delivery");
                return DeliveryResponse::internal_error();
            }
        };

        // An unprovisioned secret only matters if the delivery is signed.
        let secret = ctx.provisioner.get_secret().await.ok();

        let pipeline = DeliveryPipeline::new(V::rules()).with_metrics(ctx.metrics.clone());
        pipeline.handle(
            delivery,
            DeliveryContext {
                config: &config,
                metadata: metadata.as_ref(),
                secret: secret.as_deref(),
                signature_mode: V::signature_mode(&settings, ctx.config.signature_mode),
            },
        )
    }

    fn example_event(&self) -> Arc<Value> {
        fixtures::example(V::EXAMPLE)
    }
}

/// Authorized JSON calls against a provider API.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            credentials,
            timeout,
        }
    }

    /// Send a request with the current bearer token.
    pub async fn send(&self, request: HttpRequest) -> LifecycleResult<HttpResponse> {
        let token = self.credentials.access_token().await?;
        let request = request.bearer(&token).timeout(self.timeout);
        self.transport.send(request).await
    }

    /// Send and decode a successful JSON response.
    pub async fn send_json(&self, request: HttpRequest) -> LifecycleResult<Value> {
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(remote_error_from_response(response.status, &response.body));
        }
        parse_json(&response)
    }

    /// Send a read-verify request for a named resource.
    ///
    /// 404 maps to not found, 401 and 403 to inaccessible.
    pub async fn verify(
        &self,
        request: HttpRequest,
        kind: &str,
        name: &str,
    ) -> LifecycleResult<Value> {
        let response = self.send(request).await?;
        match response.status {
            404 => Err(ValidationError::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            }
            .into()),
            401 | 403 => Err(ValidationError::ResourceInaccessible {
                kind: kind.to_string(),
                name: name.to_string(),
            }
            .into()),
            _ if response.is_success() => parse_json(&response),
            status => Err(remote_error_from_response(status, &response.body)),
        }
    }

    /// Send a delete; 404 counts as already deleted.
    pub async fn delete(&self, request: HttpRequest) -> LifecycleResult<()> {
        let response = self.send(request).await?;
        if response.is_success() || response.status == 404 {
            Ok(())
        } else {
            Err(remote_error_from_response(response.status, &response.body))
        }
    }
}

fn parse_json(response: &HttpResponse) -> LifecycleResult<Value> {
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&response.body)
        .map_err(|e| DecodeError::invalid("provider response", e).into())
}

/// Identifier that may arrive as a JSON string or number.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Percent-encode one URL path segment.
pub(crate) fn segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Providers keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Integration::<registry::ImageRegistry>::new()));
        registry.register(Arc::new(Integration::<issues::IssueTracker>::new()));
        registry.register(Arc::new(Integration::<itsm::Itsm>::new()));
        registry
    }

    /// Add or replace a provider.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name(), provider);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ConfigurationError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownProvider {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
