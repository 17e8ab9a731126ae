use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub const ISSUER: &str = "arcs-server";

const DEFAULT_TTL_HOURS: i64 = 24;

/// Claims carried by a relay bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub device_id: String,
    pub session_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token signing failed: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

/// Issues and validates HS256 bearer tokens, and tracks explicit
/// revocations. Both issuance and validation happen in-process, so a
/// symmetric key is sufficient; the revocation set covers logout without
/// forcing short-lived tokens.
pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    revoked: Mutex<HashSet<String>>,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self::with_ttl(secret, Duration::hours(DEFAULT_TTL_HOURS))
    }

    pub fn with_ttl(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
            revoked: Mutex::new(HashSet::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn generate(
        &self,
        device_id: &str,
        session_id: &str,
        permissions: &[String],
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = TokenClaims {
            iss: ISSUER.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            permissions: permissions.to_vec(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Returns the claims iff the signature verifies, the issuer matches,
    /// the token has not expired, and it has not been revoked.
    pub fn validate(&self, token: &str) -> Option<TokenClaims> {
        if self.is_revoked(token) {
            return None;
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.leeway = 0;

        decode::<TokenClaims>(token, &self.decoding, &validation)
            .ok()
            .map(|data| data.claims)
    }

    /// Checks the exp claim only; signature and issuer are not enforced
    /// here. A token that fails to decode counts as expired.
    pub fn is_expired(&self, token: &str) -> bool {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;

        match decode::<TokenClaims>(token, &self.decoding, &validation) {
            Ok(data) => Utc::now().timestamp() >= data.claims.exp,
            Err(_) => true,
        }
    }

    pub fn revoke(&self, token: &str) {
        self.revoked.lock().insert(token.to_string());
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        self.revoked.lock().contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> JwtManager {
        JwtManager::new("test-signing-secret")
    }

    #[test]
    fn generate_validate_round_trip() {
        let jwt = manager();
        let token = jwt
            .generate("dev1", "sess1", &["control".to_string()])
            .expect("generate");

        let claims = jwt.validate(&token).expect("valid token");
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.device_id, "dev1");
        assert_eq!(claims.session_id, "sess1");
        assert_eq!(claims.permissions, vec!["control".to_string()]);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn revoked_token_fails_validation() {
        let jwt = manager();
        let token = jwt.generate("dev1", "sess1", &[]).expect("generate");
        assert!(jwt.validate(&token).is_some());

        jwt.revoke(&token);
        assert!(jwt.is_revoked(&token));
        assert!(jwt.validate(&token).is_none());
    }

    #[test]
    fn expired_token_fails_validation() {
        let jwt = JwtManager::with_ttl("test-signing-secret", Duration::hours(-1));
        let token = jwt.generate("dev1", "sess1", &[]).expect("generate");
        assert!(jwt.validate(&token).is_none());
        assert!(jwt.is_expired(&token));
    }

    #[test]
    fn fresh_token_is_not_expired() {
        let jwt = manager();
        let token = jwt.generate("dev1", "sess1", &[]).expect("generate");
        assert!(!jwt.is_expired(&token));
    }

    #[test]
    fn garbage_token_counts_as_expired_and_invalid() {
        let jwt = manager();
        assert!(jwt.validate("not-a-jwt").is_none());
        assert!(jwt.is_expired("not-a-jwt"));
    }

    #[test]
    fn token_signed_with_other_key_rejected() {
        let jwt = manager();
        let other = JwtManager::new("different-secret");
        let token = other.generate("dev1", "sess1", &[]).expect("generate");
        assert!(jwt.validate(&token).is_none());
    }

    #[test]
    fn wrong_issuer_rejected() {
        // Hand-build a token with a foreign issuer but our key.
        let claims = TokenClaims {
            iss: "someone-else".to_string(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 3600,
            device_id: "dev1".to_string(),
            session_id: "sess1".to_string(),
            permissions: Vec::new(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-signing-secret"),
        )
        .expect("encode");

        assert!(manager().validate(&token).is_none());
    }
}
