//! Example payloads.
//!
//! Each payload is parsed on first use and shared afterwards.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Image push delivered by the registry.
pub const REGISTRY_PUSH: &str = "payloads/registry_push.json";
/// Issue creation delivered by the issue tracker.
pub const ISSUES_ISSUE_CREATED: &str = "payloads/issues_issue_created.json";
/// Record update delivered by the ITSM system.
pub const ITSM_RECORD_UPDATED: &str = "payloads/itsm_record_updated.json";

static CACHE: Lazy<Mutex<HashMap<&'static str, Arc<Value>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn source(path: &str) -> Option<&'static str> {
    match path {
        REGISTRY_PUSH => Some(include_str!("payloads/registry_push.json")),
        ISSUES_ISSUE_CREATED => Some(include_str!("payloads/issues_issue_created.json")),
        ITSM_RECORD_UPDATED => Some(include_str!("payloads/itsm_record_updated.json")),
        _ => None,
    }
}

/// Parsed payload for `path`, memoized. Unknown paths yield `Value::Null`.
pub fn example(path: &'static str) -> Arc<Value> {
    let mut cache = CACHE.lock();
    if let Some(value) = cache.get(path) {
        return value.clone();
    }

    let value = match source(path).map(serde_json::from_str::<Value>) {
        Some(Ok(value)) => value,
        Some(Err(e)) => {
            warn!(path, error = %e, "Example payload does not parse");
            Value::Null
        }
        None => Value::Null,
    };

    let value = Arc::new(value);
    cache.insert(path, value.clone());
    value
}
