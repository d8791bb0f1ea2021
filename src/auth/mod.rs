/// Credential verification and principal resolution
///
/// A bearer token is either a `tt_`-prefixed API key or a signed session
/// token; the verifier resolves both to the same Principal shape.

pub mod hashing;
pub mod tokens;

use crate::clock::SharedClock;
use crate::context::AppContext;
use crate::db::models::{ApiKey, Plan};
use crate::error::{ApiError, ApiResult};
use crate::gate::plans::role_scopes;
use crate::metrics;
use crate::repo::Repository;
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokens::TokenSigner;
use uuid::Uuid;

pub const API_KEY_PREFIX: &str = "tt_";
/// Characters of the presented key stored and indexed for lookup.
pub const STORED_PREFIX_LEN: usize = 10;
const MIN_KEY_BODY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    SessionToken,
    ApiKey,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::SessionToken => "session_token",
            AuthMethod::ApiKey => "api_key",
        }
    }
}

/// Per-key request limits carried into the quota gate.
#[derive(Debug, Clone, Copy)]
pub struct KeyLimits {
    pub per_minute: i64,
    pub per_hour: i64,
    pub per_day: i64,
}

/// The verified identity backing a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub plan: Plan,
    pub scopes: Vec<String>,
    pub auth_method: AuthMethod,
    pub key_id: Option<Uuid>,
    pub key_limits: Option<KeyLimits>,
    pub feature_overrides: HashMap<String, bool>,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }

    pub fn require_scope(&self, scope: &str) -> ApiResult<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ApiError::ScopeInsufficient { required: scope.to_string() })
        }
    }
}

/// True when the token matches the API-key shape: literal prefix plus at
/// least 32 url-safe characters.
pub fn looks_like_api_key(token: &str) -> bool {
    match token.strip_prefix(API_KEY_PREFIX) {
        Some(body) => {
            body.len() >= MIN_KEY_BODY_LEN
                && body
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        }
        None => false,
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[derive(Clone)]
pub struct CredentialVerifier {
    repo: Repository,
    clock: SharedClock,
    signer: TokenSigner,
}

impl CredentialVerifier {
    pub fn new(repo: Repository, clock: SharedClock, signer: TokenSigner) -> Self {
        Self { repo, clock, signer }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Resolve a bearer token to a Principal.
    pub async fn verify(&self, token: &str, client_ip: Option<IpAddr>) -> ApiResult<Principal> {
        let result = if looks_like_api_key(token) {
            self.verify_api_key(token, client_ip).await
        } else {
            self.verify_session_token(token).await
        };

        if let Err(ref e) = result {
            metrics::AUTH_FAILURES_TOTAL.with_label_values(&[e.kind()]).inc();
        }
        result
    }

    async fn verify_session_token(&self, token: &str) -> ApiResult<Principal> {
        if token.is_empty() {
            return Err(ApiError::MalformedCredential);
        }

        let now = self.clock.now();
        let user_id = self.signer.verify(token, now)?;

        let user = self
            .repo
            .get_user(user_id)
            .await
            .map_err(|_| ApiError::UnknownCredential)?;
        if !user.is_active {
            return Err(ApiError::RevokedCredential);
        }

        let org = self.repo.get_organization(user.org_id).await?;

        Ok(Principal {
            user_id: user.id,
            org_id: org.id,
            plan: org.plan,
            scopes: role_scopes(user.role),
            auth_method: AuthMethod::SessionToken,
            key_id: None,
            key_limits: None,
            feature_overrides: org.feature_overrides,
        })
    }

    async fn verify_api_key(&self, token: &str, client_ip: Option<IpAddr>) -> ApiResult<Principal> {
        let now = self.clock.now();
        let prefix: String = token.chars().take(STORED_PREFIX_LEN).collect();

        // Prefix collisions are possible; the match is the unique row whose
        // hash verifies.
        let candidates = self.repo.api_keys_by_prefix(&prefix).await?;
        if candidates.is_empty() {
            return Err(ApiError::UnknownCredential);
        }

        let mut matched: Option<ApiKey> = None;
        for candidate in candidates {
            if hashing::verify_secret(token, &candidate.key_hash) {
                matched = Some(candidate);
                break;
            }
        }
        let key = matched.ok_or(ApiError::UnknownCredential)?;

        if let Some(revoked_at) = key.revoked_at {
            if revoked_at <= now {
                return Err(ApiError::RevokedCredential);
            }
        }
        if !key.is_active {
            return Err(ApiError::RevokedCredential);
        }
        if let Some(expires_at) = key.expires_at {
            if expires_at <= now {
                return Err(ApiError::ExpiredCredential);
            }
        }

        if let Some(allowlist) = &key.ip_allowlist {
            if !allowlist.is_empty() {
                let allowed = client_ip
                    .map(|ip| allowlist.iter().any(|entry| entry == &ip.to_string()))
                    .unwrap_or(false);
                if !allowed {
                    return Err(ApiError::IpNotAllowed);
                }
            }
        }

        let user = self
            .repo
            .get_user(key.owner_user_id)
            .await
            .map_err(|_| ApiError::UnknownCredential)?;
        if !user.is_active {
            return Err(ApiError::RevokedCredential);
        }

        let org = self.repo.get_organization(key.org_id).await?;

        // Usage accounting must not block the request
        let repo = self.repo.clone();
        let key_id = key.id;
        tokio::spawn(async move {
            if let Err(e) = repo.touch_api_key_usage(key_id, now).await {
                tracing::debug!(key_id = %key_id, "last_used_at update failed: {}", e);
            }
        });

        Ok(Principal {
            user_id: user.id,
            org_id: org.id,
            plan: org.plan,
            scopes: key.scopes.clone(),
            auth_method: AuthMethod::ApiKey,
            key_id: Some(key.id),
            key_limits: Some(KeyLimits {
                per_minute: key.limit_per_minute,
                per_hour: key.limit_per_hour,
                per_day: key.limit_per_day,
            }),
            feature_overrides: org.feature_overrides,
        })
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        // The authenticate middleware stashes the verified principal; reuse
        // it rather than paying the hash verification twice.
        if let Some(principal) = parts.extensions.get::<Principal>() {
            return Ok(principal.clone());
        }

        let token =
            extract_bearer_token(&parts.headers).ok_or(ApiError::MalformedCredential)?;

        let client_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());

        state.verifier.verify(&token, client_ip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_shape_discrimination() {
        assert!(looks_like_api_key(
            "tt_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
        ));
        // Too short a body
        assert!(!looks_like_api_key("tt_shortbody"));
        // JWTs contain dots, which are not url-safe-base64
        assert!(!looks_like_api_key("tt_eyJ.abc.def"));
        assert!(!looks_like_api_key(
            "eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiJ4In0.sig"
        ));
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc123".to_string()));

        let mut basic = HeaderMap::new();
        basic.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&basic), None);
    }

    #[test]
    fn wildcard_scope_in_principal() {
        let principal = Principal {
            user_id: Uuid::from_u128(1),
            org_id: Uuid::from_u128(2),
            plan: Plan::Free,
            scopes: vec!["*".to_string()],
            auth_method: AuthMethod::SessionToken,
            key_id: None,
            key_limits: None,
            feature_overrides: HashMap::new(),
        };
        assert!(principal.require_scope("write:interactions").is_ok());
    }
}
