/// Redis cache adapter
use super::Cache;
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{error, info, warn};

// CAS as a single server-side step; WATCH/MULTI does not compose with a
// shared ConnectionManager.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or (current ~= false and current == ARGV[1]) then
    if tonumber(ARGV[3]) > 0 then
        redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
    else
        redis.call('SET', KEYS[1], ARGV[2])
    end
    return 1
end
return 0
"#;

// INCR and first-write EXPIRE must land together or a crash between them
// leaves an immortal counter.
const INCR_SCRIPT: &str = r#"
local value = redis.call('INCRBY', KEYS[1], tonumber(ARGV[1]))
if value == tonumber(ARGV[1]) then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
end
return value
"#;

pub struct RedisCache {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> ApiResult<Self> {
        info!("Connecting to Redis at {}", redis_url);

        let client = redis::Client::open(redis_url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            ApiError::Internal(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            ApiError::Internal(format!("Redis connection failed: {}", e))
        })?;

        info!("Redis connection established");

        Ok(Self { connection, key_prefix: key_prefix.to_string() })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> ApiResult<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(self.full_key(key)).await.map_err(|e| {
            warn!(key, "Redis GET failed: {}", e);
            ApiError::Internal(format!("Cache get failed: {}", e))
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ApiResult<()> {
        let mut conn = self.connection.clone();
        let full = self.full_key(key);
        let result: Result<(), redis::RedisError> = match ttl {
            Some(ttl) => conn.set_ex(&full, value, ttl.as_secs()).await,
            None => conn.set(&full, value).await,
        };
        result.map_err(|e| {
            warn!(key, "Redis SET failed: {}", e);
            ApiError::Internal(format!("Cache set failed: {}", e))
        })
    }

    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> ApiResult<i64> {
        let mut conn = self.connection.clone();
        redis::Script::new(INCR_SCRIPT)
            .key(self.full_key(key))
            .arg(amount)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key, "Redis INCR failed: {}", e);
                ApiError::Internal(format!("Cache increment failed: {}", e))
            })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        old: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> ApiResult<bool> {
        let mut conn = self.connection.clone();
        let swapped: i64 = redis::Script::new(CAS_SCRIPT)
            .key(self.full_key(key))
            .arg(old.unwrap_or(""))
            .arg(new)
            .arg(ttl.map(|d| d.as_secs() as i64).unwrap_or(0))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key, "Redis CAS failed: {}", e);
                ApiError::Internal(format!("Cache compare-and-swap failed: {}", e))
            })?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> ApiResult<()> {
        let mut conn = self.connection.clone();
        conn.del(self.full_key(key)).await.map_err(|e| {
            warn!(key, "Redis DEL failed: {}", e);
            ApiError::Internal(format!("Cache delete failed: {}", e))
        })
    }

    async fn keys_by_prefix(&self, prefix: &str) -> ApiResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}{}*", self.key_prefix, prefix);
        let keys: Vec<String> = conn.keys(&pattern).await.map_err(|e| {
            warn!(prefix, "Redis KEYS failed: {}", e);
            ApiError::Internal(format!("Cache keys lookup failed: {}", e))
        })?;

        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.key_prefix).map(str::to_string))
            .collect())
    }

    async fn ttl(&self, key: &str) -> ApiResult<Option<i64>> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.ttl(self.full_key(key)).await.map_err(|e| {
            warn!(key, "Redis TTL failed: {}", e);
            ApiError::Internal(format!("Cache TTL check failed: {}", e))
        })?;

        // -2 = missing key, -1 = no expiry
        Ok(if ttl >= 0 { Some(ttl) } else { None })
    }
}
