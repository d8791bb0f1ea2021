/// Configuration management for the TuneTrail serving plane
use crate::error::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
    pub sessions: SessionConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Deployment edition; community installs skip some premium gating.
    pub edition: Edition,
    pub cors_origins: Vec<String>,
    /// Default per-request deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Graceful shutdown drain deadline in seconds.
    pub shutdown_deadline_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Community,
    Cloud,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
    pub max_connections: u32,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret for session tokens
    pub jwt_secret: String,
    /// Session token lifetime in minutes
    pub access_token_expire_minutes: i64,
    /// Grace window applied to rotated API keys, in hours
    pub key_rotation_grace_hours: i64,
    /// Requests per minute allowed on unauthenticated auth endpoints
    pub public_requests_per_minute: u32,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL; unset selects the in-process cache
    pub redis_url: Option<String>,
    /// Key prefix for all cache entries
    pub key_prefix: String,
}

/// Recommendation engine endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub base_url: String,
    /// Deadlines per request kind, milliseconds
    pub timeout_personal_ms: u64,
    pub timeout_mix_ms: u64,
    pub timeout_profile_ms: u64,
}

/// Listening-session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions with no heartbeat for this long are expired
    pub idle_timeout_secs: i64,
    /// Expiry sweep cadence
    pub sweep_interval_secs: u64,
}

/// Recommendation dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Fresh-cache TTL for recommendation results
    pub cache_ttl_secs: u64,
    /// How long an expired entry may still be served when the engine fails
    pub stale_while_error_secs: u64,
    /// Impression buffer capacity; oldest entries drop on overflow
    pub impression_buffer_capacity: usize,
    /// Impression flush cadence in milliseconds
    pub impression_flush_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> ApiResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("TT_HOSTNAME").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("TT_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ApiError::Validation("Invalid port number".to_string()))?;

        let edition = match env::var("TT_EDITION").as_deref() {
            Ok("cloud") => Edition::Cloud,
            _ => Edition::Community,
        };

        let cors_origins = env::var("TT_CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let data_directory: PathBuf = env::var("TT_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let database = env::var("TT_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("tunetrail.sqlite"));

        let jwt_secret = env::var("TT_JWT_SECRET")
            .map_err(|_| ApiError::Validation("JWT secret required (TT_JWT_SECRET)".to_string()))?;

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                edition,
                cors_origins,
                request_timeout_ms: env_or("TT_REQUEST_TIMEOUT_MS", 15_000),
                shutdown_deadline_secs: env_or("TT_SHUTDOWN_DEADLINE_SECS", 10),
            },
            storage: StorageConfig {
                data_directory,
                database,
                max_connections: env_or("TT_DB_MAX_CONNECTIONS", 10),
            },
            auth: AuthConfig {
                jwt_secret,
                access_token_expire_minutes: env_or("TT_ACCESS_TOKEN_EXPIRE_MINUTES", 30),
                key_rotation_grace_hours: env_or("TT_KEY_ROTATION_GRACE_HOURS", 24),
                public_requests_per_minute: env_or("TT_PUBLIC_REQUESTS_PER_MINUTE", 30),
            },
            cache: CacheConfig {
                redis_url: env::var("TT_REDIS_URL").ok(),
                key_prefix: env::var("TT_CACHE_KEY_PREFIX")
                    .unwrap_or_else(|_| "tt:".to_string()),
            },
            engine: EngineConfig {
                base_url: env::var("TT_ENGINE_URL")
                    .unwrap_or_else(|_| "http://ml-engine:8001".to_string()),
                timeout_personal_ms: env_or("TT_ENGINE_TIMEOUT_PERSONAL_MS", 2_000),
                timeout_mix_ms: env_or("TT_ENGINE_TIMEOUT_MIX_MS", 5_000),
                timeout_profile_ms: env_or("TT_ENGINE_TIMEOUT_PROFILE_MS", 10_000),
            },
            sessions: SessionConfig {
                idle_timeout_secs: env_or("TT_SESSION_IDLE_TIMEOUT_SECS", 900),
                sweep_interval_secs: env_or("TT_SESSION_SWEEP_INTERVAL_SECS", 60),
            },
            dispatch: DispatchConfig {
                cache_ttl_secs: env_or("TT_RECO_CACHE_TTL_SECS", 300),
                stale_while_error_secs: env_or("TT_RECO_STALE_TTL_SECS", 3_600),
                impression_buffer_capacity: env_or("TT_IMPRESSION_BUFFER_CAPACITY", 10_000),
                impression_flush_interval_ms: env_or("TT_IMPRESSION_FLUSH_INTERVAL_MS", 500),
            },
            logging: LoggingConfig {
                level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            },
        })
    }

    /// Self-contained defaults for tests and local tooling: in-memory
    /// friendly paths, no Redis, no engine reachable.
    pub fn test_defaults() -> Self {
        ServerConfig {
            service: ServiceConfig {
                hostname: "127.0.0.1".into(),
                port: 0,
                edition: Edition::Community,
                cors_origins: vec![],
                request_timeout_ms: 15_000,
                shutdown_deadline_secs: 10,
            },
            storage: StorageConfig {
                data_directory: "./data".into(),
                database: "./data/tunetrail.sqlite".into(),
                max_connections: 5,
            },
            auth: AuthConfig {
                jwt_secret: "test-secret-test-secret-test-secret!".into(),
                access_token_expire_minutes: 30,
                key_rotation_grace_hours: 24,
                public_requests_per_minute: 1_000,
            },
            cache: CacheConfig { redis_url: None, key_prefix: "tt:".into() },
            engine: EngineConfig {
                base_url: "http://127.0.0.1:1".into(),
                timeout_personal_ms: 2_000,
                timeout_mix_ms: 5_000,
                timeout_profile_ms: 10_000,
            },
            sessions: SessionConfig { idle_timeout_secs: 900, sweep_interval_secs: 60 },
            dispatch: DispatchConfig {
                cache_ttl_secs: 300,
                stale_while_error_secs: 3_600,
                impression_buffer_capacity: 10_000,
                impression_flush_interval_ms: 500,
            },
            logging: LoggingConfig { level: "info".into() },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> ApiResult<()> {
        if self.service.hostname.is_empty() {
            return Err(ApiError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.auth.jwt_secret.len() < 32 {
            return Err(ApiError::Validation(
                "JWT secret must be at least 32 characters".to_string(),
            ));
        }

        if self.dispatch.impression_buffer_capacity == 0 {
            return Err(ApiError::Validation(
                "Impression buffer capacity must be positive".to_string(),
            ));
        }

        if self.sessions.idle_timeout_secs <= 0 {
            return Err(ApiError::Validation(
                "Session idle timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig::test_defaults()
    }

    #[test]
    fn validate_accepts_sane_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_jwt_secret() {
        let mut config = base_config();
        config.auth.jwt_secret = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_buffer() {
        let mut config = base_config();
        config.dispatch.impression_buffer_capacity = 0;
        assert!(config.validate().is_err());
    }
}
