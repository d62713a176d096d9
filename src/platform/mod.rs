//! Platform Collaborators
//!
//! Durable storage, scheduling and delivery-endpoint provisioning are owned by
//! the host platform. The engine only talks to them through these traits.

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::errors::{LifecycleResult, StorageError};

/// Named secret storage for one integration instance.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a secret; `None` when nothing is stored under the name.
    async fn get(&self, name: &str) -> LifecycleResult<Option<Vec<u8>>>;

    /// Write a secret, replacing any previous value.
    async fn set(&self, name: &str, value: &[u8]) -> LifecycleResult<()>;
}

/// Per-node metadata record.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read the record; `None` when it was never written or was cleared.
    async fn get(&self) -> LifecycleResult<Option<Value>>;

    /// Replace the record. Writing `Value::Null` clears it.
    async fn set(&self, value: Value) -> LifecycleResult<()>;
}

/// Deferred action scheduling with at-least-once delivery.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Ask the host to invoke `action` with `payload` after `delay`.
    async fn schedule_call(&self, action: &str, payload: Value, delay: Duration)
        -> LifecycleResult<()>;
}

/// Platform-managed delivery endpoint and signing secret.
#[async_trait]
pub trait WebhookProvisioner: Send + Sync {
    /// Allocate the delivery URL for this node.
    async fn setup_delivery_url(&self) -> LifecycleResult<String>;

    /// Current verification secret in stored form.
    async fn get_secret(&self) -> LifecycleResult<Vec<u8>>;

    /// Rotate the secret, returning the plain value and its stored form.
    async fn reset_secret(&self) -> LifecycleResult<(SecretString, Vec<u8>)>;
}

/// In-memory secret store with write history and failure injection.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
    writes: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
}

impl InMemorySecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Names written so far, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    /// Raw stored bytes for a name.
    pub fn raw(&self, name: &str) -> Option<Vec<u8>> {
        self.secrets.lock().get(name).cloned()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, name: &str) -> LifecycleResult<Option<Vec<u8>>> {
        Ok(self.secrets.lock().get(name).cloned())
    }

    async fn set(&self, name: &str, value: &[u8]) -> LifecycleResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed {
                message: format!("secret {name} is not writable"),
            }
            .into());
        }
        self.secrets.lock().insert(name.to_string(), value.to_vec());
        self.writes.lock().push(name.to_string());
        Ok(())
    }
}

/// In-memory metadata record.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    value: Mutex<Option<Value>>,
    write_count: Mutex<usize>,
    fail_writes: AtomicBool,
}

impl InMemoryMetadataStore {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record holding `value`.
    pub fn with_value(value: Value) -> Self {
        let store = Self::default();
        *store.value.lock() = Some(value);
        store
    }

    /// Make every subsequent `set` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        *self.write_count.lock()
    }

    /// Current value without going through the trait.
    pub fn snapshot(&self) -> Option<Value> {
        self.value.lock().clone()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self) -> LifecycleResult<Option<Value>> {
        Ok(self.value.lock().clone().filter(|v| !v.is_null()))
    }

    async fn set(&self, value: Value) -> LifecycleResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed {
                message: "metadata is not writable".to_string(),
            }
            .into());
        }
        *self.value.lock() = if value.is_null() { None } else { Some(value) };
        *self.write_count.lock() += 1;
        Ok(())
    }
}

/// A call recorded by [`RecordingScheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCall {
    pub action: String,
    pub payload: Value,
    pub delay: Duration,
}

/// Scheduler that records calls instead of running them.
#[derive(Default)]
pub struct RecordingScheduler {
    calls: Mutex<Vec<ScheduledCall>>,
    fail: AtomicBool,
}

impl RecordingScheduler {
    /// Create a scheduler with no recorded calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `schedule_call` fail.
    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<ScheduledCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn schedule_call(
        &self,
        action: &str,
        payload: Value,
        delay: Duration,
    ) -> LifecycleResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::ScheduleFailed {
                message: format!("cannot schedule {action}"),
            }
            .into());
        }
        self.calls.lock().push(ScheduledCall {
            action: action.to_string(),
            payload,
            delay,
        });
        Ok(())
    }
}

/// Provisioner that hands out URLs under a fixed base and random secrets.
pub struct InMemoryProvisioner {
    base_url: String,
    secret: Mutex<Vec<u8>>,
    urls_issued: Mutex<usize>,
    resets: Mutex<usize>,
}

impl InMemoryProvisioner {
    /// Create a provisioner issuing URLs under `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: Mutex::new(Vec::new()),
            urls_issued: Mutex::new(0),
            resets: Mutex::new(0),
        }
    }

    /// Use a fixed secret instead of waiting for a reset.
    pub fn with_secret(self, secret: impl AsRef<[u8]>) -> Self {
        *self.secret.lock() = secret.as_ref().to_vec();
        self
    }

    /// Number of URLs handed out.
    pub fn urls_issued(&self) -> usize {
        *self.urls_issued.lock()
    }

    /// Number of secret rotations.
    pub fn resets(&self) -> usize {
        *self.resets.lock()
    }
}

#[async_trait]
impl WebhookProvisioner for InMemoryProvisioner {
    async fn setup_delivery_url(&self) -> LifecycleResult<String> {
        *self.urls_issued.lock() += 1;
        Ok(format!("{}/{}", self.base_url, uuid::Uuid::new_v4().simple()))
    }

    async fn get_secret(&self) -> LifecycleResult<Vec<u8>> {
        let secret = self.secret.lock().clone();
        if secret.is_empty() {
            return Err(StorageError::ReadFailed {
                message: "no webhook secret provisioned".to_string(),
            }
            .into());
        }
        Ok(secret)
    }

    async fn reset_secret(&self) -> LifecycleResult<(SecretString, Vec<u8>)> {
        let plain = SecretString::new(uuid::Uuid::new_v4().simple().to_string());
        let stored = plain.expose_secret().as_bytes().to_vec();
        *self.secret.lock() = stored.clone();
        *self.resets.lock() += 1;
        Ok((plain, stored))
    }
}
