/// Memory-hard hashing for passwords and API-key secrets
use crate::error::{ApiError, ApiResult};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Hash a secret with Argon2id and a fresh salt.
pub fn hash_secret(secret: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("Secret hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

/// Verify a candidate secret against a stored hash. Malformed stored hashes
/// verify as false rather than erroring; the caller treats them as unknown.
pub fn verify_secret(secret: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let hash = hash_secret("correct horse battery staple").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_secret("correct horse battery staple", &hash));
        assert!(!verify_secret("wrong", &hash));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let a = hash_secret("same input").unwrap();
        let b = hash_secret("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_stored_hash_verifies_false() {
        assert!(!verify_secret("anything", "not-a-phc-string"));
    }
}
