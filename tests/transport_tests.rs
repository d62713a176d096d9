//! Integration tests against a local HTTP server.

use integrations_webhook_lifecycle::credentials::{
    CredentialExchange, Identity, PatTokenExchange,
};
use integrations_webhook_lifecycle::errors::{LifecycleError, NetworkError};
use integrations_webhook_lifecycle::platform::{
    InMemoryMetadataStore, InMemoryProvisioner, InMemorySecretStore, RecordingScheduler,
};
use integrations_webhook_lifecycle::transport::{HttpRequest, HttpTransport, ReqwestHttpTransport};
use integrations_webhook_lifecycle::{ProviderContext, ProviderRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport() -> Arc<ReqwestHttpTransport> {
    Arc::new(ReqwestHttpTransport::new(Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn test_pat_exchange_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/auth/token"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"identifier": "ci", "secret": "pat-123"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"access_token": "jwt", "expires_in": 600})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let exchange = PatTokenExchange::new(transport(), &server.uri());
    let credential = assert_ok!(exchange.obtain(&Identity::pat("ci", "pat-123")).await);
    assert_eq!(credential.expires_in, Some(Duration::from_secs(600)));
}

#[tokio::test]
async fn test_rejected_pat_keeps_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/auth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let exchange = PatTokenExchange::new(transport(), &server.uri());
    let err = assert_err!(exchange.obtain(&Identity::pat("ci", "wrong")).await);
    assert!(err.needs_reauth());
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let request = HttpRequest::get(format!("{}/slow", server.uri()))
        .timeout(Duration::from_millis(50));
    let err = assert_err!(transport().send(request).await);
    assert!(matches!(
        err,
        LifecycleError::Network(NetworkError::Timeout { .. })
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_registry_setup_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "jwt"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/namespaces/acme/repositories/app"))
        .and(header("authorization", "Bearer jwt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "app"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/namespaces/acme/repositories/app/webhooks"))
        .and(body_partial_json(json!({"name": "lifecycle-app"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 31})))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = ProviderContext::new(
        "reg-1",
        json!({"base_url": server.uri(), "username": "ci", "token": "pat-123"}),
        transport(),
        Arc::new(InMemorySecretStore::new()),
        Arc::new(InMemoryMetadataStore::new()),
        Arc::new(RecordingScheduler::new()),
        Arc::new(InMemoryProvisioner::new("https://hooks.test")),
    );
    let provider = ProviderRegistry::with_defaults().get("registry").unwrap();
    let desired = json!({"namespace": "acme", "repository": "app", "tags": []});

    assert_ok!(provider.refresh(&ctx).await);
    let metadata = assert_ok!(provider.reconcile(&ctx, &desired).await);
    assert_eq!(metadata["registration_id"], "31");

    // Repeated setup stays local; the expectations above verify on drop.
    assert_ok!(provider.reconcile(&ctx, &desired).await);
}
