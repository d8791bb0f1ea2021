/// In-process cache adapter
///
/// Single-node stand-in for Redis with the same semantics the gate and
/// dispatcher rely on: TTLs, atomic counters, compare-and-swap.
use super::Cache;
use crate::error::ApiResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(map: &mut HashMap<String, Entry>, now: Instant) {
        map.retain(|_, entry| !entry.is_expired(now));
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> ApiResult<Option<String>> {
        let mut map = self.entries.lock().unwrap();
        let now = Instant::now();
        match map.get(key) {
            Some(entry) if entry.is_expired(now) => {
                map.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ApiResult<()> {
        let mut map = self.entries.lock().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> ApiResult<i64> {
        let mut map = self.entries.lock().unwrap();
        let now = Instant::now();

        let current = match map.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.value.parse::<i64>().unwrap_or(0)
            }
            _ => 0,
        };

        let next = current + amount;
        let expires_at = match map.get(key) {
            // Preserve the original window deadline
            Some(entry) if !entry.is_expired(now) => entry.expires_at,
            _ => Some(now + ttl),
        };
        map.insert(key.to_string(), Entry { value: next.to_string(), expires_at });

        Ok(next)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        old: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> ApiResult<bool> {
        let mut map = self.entries.lock().unwrap();
        let now = Instant::now();

        let current = match map.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.as_str()),
            _ => None,
        };

        if current != old {
            return Ok(false);
        }

        map.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at: ttl.map(|d| now + d),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> ApiResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> ApiResult<Vec<String>> {
        let mut map = self.entries.lock().unwrap();
        let now = Instant::now();
        Self::prune(&mut map, now);
        Ok(map.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn ttl(&self, key: &str) -> ApiResult<Option<i64>> {
        let map = self.entries.lock().unwrap();
        let now = Instant::now();
        Ok(map.get(key).and_then(|entry| {
            entry.expires_at.and_then(|at| {
                if at <= now {
                    None
                } else {
                    Some((at - now).as_secs() as i64)
                }
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("a", "1", None).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some("1".to_string()));
        cache.delete("a").await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_counts_and_keeps_window_ttl() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(cache.incr("c", 1, ttl).await.unwrap(), 1);
        assert_eq!(cache.incr("c", 1, ttl).await.unwrap(), 2);
        assert_eq!(cache.incr("c", 3, ttl).await.unwrap(), 5);
        assert!(cache.ttl("c").await.unwrap().unwrap() <= 60);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let cache = MemoryCache::new();
        cache.set("gone", "x", Some(Duration::from_millis(5))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_requires_expected_value() {
        let cache = MemoryCache::new();
        assert!(cache.compare_and_swap("seq", None, "1", None).await.unwrap());
        assert!(!cache.compare_and_swap("seq", None, "2", None).await.unwrap());
        assert!(cache.compare_and_swap("seq", Some("1"), "2", None).await.unwrap());
        assert_eq!(cache.get("seq").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn prefix_listing_skips_expired() {
        let cache = MemoryCache::new();
        cache.set("session:active:a", "1", None).await.unwrap();
        cache
            .set("session:active:b", "1", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        cache.set("other", "1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let keys = cache.keys_by_prefix("session:active:").await.unwrap();
        assert_eq!(keys, vec!["session:active:a".to_string()]);
    }
}
