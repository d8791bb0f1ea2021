/// Signed session tokens (HS256)
use crate::error::{ApiError, ApiResult};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, lifetime_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            lifetime: Duration::minutes(lifetime_minutes),
        }
    }

    pub fn issue(&self, user_id: Uuid, now: DateTime<Utc>) -> ApiResult<(String, DateTime<Utc>)> {
        let expires_at = now + self.lifetime;
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(format!("Token signing failed: {}", e)))?;

        Ok((token, expires_at))
    }

    /// Verify signature and expiry against the injected clock.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> ApiResult<Uuid> {
        // Expiry is checked against the injected clock, not the host clock
        let mut validation = Validation::default();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| ApiError::UnknownCredential)?;

        if data.claims.exp <= now.timestamp() {
            return Err(ApiError::ExpiredCredential);
        }

        Uuid::parse_str(&data.claims.sub).map_err(|_| ApiError::UnknownCredential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("0123456789abcdef0123456789abcdef", 30)
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let (token, expires_at) = signer().issue(user_id, now).unwrap();

        assert_eq!(expires_at, now + Duration::minutes(30));
        assert_eq!(signer().verify(&token, now).unwrap(), user_id);
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = Utc::now();
        let (token, _) = signer().issue(Uuid::new_v4(), now).unwrap();

        let err = signer().verify(&token, now + Duration::minutes(31)).unwrap_err();
        assert_eq!(err.kind(), "EXPIRED_CREDENTIAL");
    }

    #[test]
    fn tampered_token_is_unknown() {
        let now = Utc::now();
        let (token, _) = signer().issue(Uuid::new_v4(), now).unwrap();
        let other = TokenSigner::new("another-secret-another-secret-00", 30);

        let err = other.verify(&token, now).unwrap_err();
        assert_eq!(err.kind(), "UNKNOWN_CREDENTIAL");
    }
}
