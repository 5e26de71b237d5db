//! In-process key-value cache used for list memoization and the
//! version-gated read billing markers.
//!
//! The client is constructed once at process start and handed to callers
//! through `AppState`; nothing in the crate reaches for a global handle.
//! Keys are plain strings, values are version tokens (timestamp strings)
//! or JSON blobs, and no key carries secrets. All cache traffic is
//! best-effort: the callers treat a miss and an absent entry identically.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct CacheClient {
    entries: RwLock<HashMap<String, String>>,
}

impl CacheClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) {
        self.entries.write().await.insert(key.to_string(), value.into());
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Fetch and decode a JSON value; decode failures count as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        serde_json::from_str(&raw).ok()
    }

    /// Encode and store a JSON value; encode failures are logged and dropped.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, raw).await,
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to encode cache value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = CacheClient::new();
        assert!(cache.get("k").await.is_none());

        cache.set("k", "v1").await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v1"));

        cache.set("k", "v2").await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v2"));

        assert!(cache.delete("k").await);
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_json_round_trip_and_bad_payload() {
        let cache = CacheClient::new();
        cache.set_json("list", &vec![1, 2, 3]).await;
        assert_eq!(cache.get_json::<Vec<i32>>("list").await, Some(vec![1, 2, 3]));

        cache.set("broken", "{not json").await;
        assert_eq!(cache.get_json::<Vec<i32>>("broken").await, None);
    }
}
