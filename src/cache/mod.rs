/// Caching layer for the TuneTrail serving plane
///
/// Backs rate-limit counters and their window-limit stamps, recommendation
/// result caching, and session liveness tags. Production uses Redis; the
/// in-process adapter serves tests and single-node deployments.

pub mod memory;
pub mod redis;

use crate::error::ApiResult;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

pub use memory::MemoryCache;
pub use redis::RedisCache;

/// Key/value store with TTLs and atomic counter primitives
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> ApiResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ApiResult<()>;

    /// Atomically increment a counter, setting `ttl` when the key is created.
    /// Returns the post-increment value.
    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> ApiResult<i64>;

    /// Compare-and-swap: set `new` only if the current value equals `old`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        old: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> ApiResult<bool>;

    async fn delete(&self, key: &str) -> ApiResult<()>;

    /// List keys under a prefix. Used only by the session expiry sweep.
    async fn keys_by_prefix(&self, prefix: &str) -> ApiResult<Vec<String>>;

    /// Remaining TTL in seconds, if the key exists and has one.
    async fn ttl(&self, key: &str) -> ApiResult<Option<i64>>;
}

/// JSON helpers over the string-valued cache
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn Cache,
    key: &str,
) -> ApiResult<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "dropping corrupt cache entry");
                let _ = cache.delete(key).await;
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> ApiResult<()> {
    let raw = serde_json::to_string(value)
        .map_err(|e| crate::error::ApiError::Internal(format!("cache serialization: {}", e)))?;
    cache.set(key, &raw, ttl).await
}

/// Cache key namespaces
pub mod keys {
    use uuid::Uuid;

    pub fn quota(bucket: &str, org_id: Uuid, window: &str, quantum: i64) -> String {
        format!("quota:{}:{}:{}:{}", bucket, org_id, window, quantum)
    }

    /// Limit in force for the window, recorded when its counter is created.
    pub fn quota_limit(bucket: &str, org_id: Uuid, window: &str, quantum: i64) -> String {
        format!("quota:{}:{}:{}:{}:limit", bucket, org_id, window, quantum)
    }

    pub fn recommendation(fingerprint: &str) -> String {
        format!("reco:{}", fingerprint)
    }

    pub fn session_active(session_id: Uuid) -> String {
        format!("session:active:{}", session_id)
    }

    pub const SESSION_ACTIVE_PREFIX: &str = "session:active:";

    pub fn session_seq(session_id: Uuid) -> String {
        format!("session:seq:{}", session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_keys_are_window_aligned() {
        let org = uuid::Uuid::from_u128(7);
        let key = keys::quota("api_calls_per_minute", org, "minute", 29_000_000);
        assert!(key.starts_with("quota:api_calls_per_minute:"));
        assert!(key.ends_with(":minute:29000000"));

        let limit_key = keys::quota_limit("api_calls_per_minute", org, "minute", 29_000_000);
        assert_eq!(limit_key, format!("{}:limit", key));
    }

    #[tokio::test]
    async fn json_roundtrip_through_memory_cache() {
        let cache = MemoryCache::new();
        set_json(&cache, "k", &vec![1, 2, 3], None).await.unwrap();
        let value: Option<Vec<i32>> = get_json(&cache, "k").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn corrupt_entries_are_evicted_not_fatal() {
        let cache = MemoryCache::new();
        cache.set("bad", "{not json", None).await.unwrap();
        let value: Option<Vec<i32>> = get_json(&cache, "bad").await.unwrap();
        assert_eq!(value, None);
        assert_eq!(cache.get("bad").await.unwrap(), None);
    }
}
