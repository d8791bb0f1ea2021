/// API-key lifecycle: issue, rotate, revoke, usage accounting
///
/// Revocation needs no cache invalidation: the verifier resolves prefixes
/// against the repository on every request, so a set `revoked_at` takes
/// effect immediately.
use crate::auth::{hashing, API_KEY_PREFIX, STORED_PREFIX_LEN};
use crate::clock::{SharedClock, SharedIdGen};
use crate::db::models::{ApiKey, Environment};
use crate::error::{ApiError, ApiResult};
use crate::repo::{KeyUsageStats, Repository};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Duration;
use rand::RngCore;
use uuid::Uuid;

const SECRET_ENTROPY_BYTES: usize = 32;

/// Parameters for issuing a new key
#[derive(Debug, Clone)]
pub struct IssueKeyParams {
    pub name: String,
    pub scopes: Vec<String>,
    pub environment: Environment,
    pub expires_in_days: Option<i64>,
    pub limit_per_minute: i64,
    pub limit_per_hour: i64,
    pub limit_per_day: i64,
    pub ip_allowlist: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct ApiKeyManager {
    repo: Repository,
    clock: SharedClock,
    ids: SharedIdGen,
    rotation_grace: Duration,
}

impl ApiKeyManager {
    pub fn new(
        repo: Repository,
        clock: SharedClock,
        ids: SharedIdGen,
        rotation_grace_hours: i64,
    ) -> Self {
        Self {
            repo,
            clock,
            ids,
            rotation_grace: Duration::hours(rotation_grace_hours),
        }
    }

    /// Mint a fresh secret. Returns `(full_key, stored_prefix)`.
    fn generate_secret() -> (String, String) {
        let mut entropy = [0u8; SECRET_ENTROPY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        let full_key = format!("{}{}", API_KEY_PREFIX, URL_SAFE_NO_PAD.encode(entropy));
        let prefix: String = full_key.chars().take(STORED_PREFIX_LEN).collect();
        (full_key, prefix)
    }

    /// Issue a new key. The returned secret is shown exactly once; only its
    /// Argon2id hash is stored.
    pub async fn issue(
        &self,
        owner_user_id: Uuid,
        org_id: Uuid,
        params: IssueKeyParams,
    ) -> ApiResult<(ApiKey, String)> {
        if params.name.trim().is_empty() {
            return Err(ApiError::Validation("Key name cannot be empty".to_string()));
        }

        let now = self.clock.now();
        let (full_key, prefix) = Self::generate_secret();
        let key_hash = hashing::hash_secret(&full_key)?;

        let key = ApiKey {
            id: self.ids.mint(),
            owner_user_id,
            org_id,
            name: params.name,
            key_hash,
            key_prefix: prefix,
            scopes: params.scopes,
            environment: params.environment,
            limit_per_minute: params.limit_per_minute,
            limit_per_hour: params.limit_per_hour,
            limit_per_day: params.limit_per_day,
            ip_allowlist: params.ip_allowlist,
            is_active: true,
            total_requests: 0,
            last_used_at: None,
            expires_at: params.expires_in_days.map(|days| now + Duration::days(days)),
            revoked_at: None,
            rotated_from: None,
            created_at: now,
        };

        self.repo.insert_api_key(&key).await?;

        Ok((key, full_key))
    }

    /// Rotate: issue a replacement with identical scopes and limits; the old
    /// key keeps authenticating until the grace window lapses.
    pub async fn rotate(
        &self,
        key_id: Uuid,
        owner_user_id: Uuid,
    ) -> ApiResult<(ApiKey, String, Uuid)> {
        let old = self.repo.get_api_key(key_id, owner_user_id).await?;
        let now = self.clock.now();

        if old.revoked_at.is_some() {
            return Err(ApiError::Conflict("Key is already revoked".to_string()));
        }

        let (full_key, prefix) = Self::generate_secret();
        let key_hash = hashing::hash_secret(&full_key)?;

        let new_key = ApiKey {
            id: self.ids.mint(),
            owner_user_id: old.owner_user_id,
            org_id: old.org_id,
            name: old.name.clone(),
            key_hash,
            key_prefix: prefix,
            scopes: old.scopes.clone(),
            environment: old.environment,
            limit_per_minute: old.limit_per_minute,
            limit_per_hour: old.limit_per_hour,
            limit_per_day: old.limit_per_day,
            ip_allowlist: old.ip_allowlist.clone(),
            is_active: true,
            total_requests: 0,
            last_used_at: None,
            expires_at: old.expires_at,
            revoked_at: None,
            rotated_from: Some(old.id),
            created_at: now,
        };

        self.repo.insert_api_key(&new_key).await?;
        self.repo
            .set_api_key_revoked_at(old.id, owner_user_id, now + self.rotation_grace)
            .await?;

        Ok((new_key, full_key, old.id))
    }

    /// Revoke immediately.
    pub async fn revoke(&self, key_id: Uuid, owner_user_id: Uuid) -> ApiResult<()> {
        let now = self.clock.now();
        self.repo.set_api_key_revoked_at(key_id, owner_user_id, now).await
    }

    pub async fn delete(&self, key_id: Uuid, owner_user_id: Uuid) -> ApiResult<()> {
        self.repo.delete_api_key(key_id, owner_user_id).await
    }

    pub async fn usage(
        &self,
        key_id: Uuid,
        owner_user_id: Uuid,
        days: i64,
    ) -> ApiResult<KeyUsageStats> {
        // Ownership check happens in the lookup
        let _key = self.repo.get_api_key(key_id, owner_user_id).await?;
        let since = self.clock.now() - Duration::days(days.clamp(1, 90));
        self.repo.api_key_usage_stats(key_id, since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::looks_like_api_key;

    #[test]
    fn generated_secrets_have_documented_shape() {
        let (full_key, prefix) = ApiKeyManager::generate_secret();
        // tt_ + 43 chars of url-safe base64 = 46 total
        assert_eq!(full_key.len(), 46);
        assert!(full_key.starts_with("tt_"));
        assert!(looks_like_api_key(&full_key));
        assert_eq!(prefix.len(), STORED_PREFIX_LEN);
        assert!(full_key.starts_with(&prefix));
    }

    #[test]
    fn secrets_are_unique() {
        let (a, _) = ApiKeyManager::generate_secret();
        let (b, _) = ApiKeyManager::generate_secret();
        assert_ne!(a, b);
    }
}
