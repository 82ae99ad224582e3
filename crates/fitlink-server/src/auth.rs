//! Identity verification.
//!
//! Tokens are issued elsewhere; this module only checks them. The default
//! [`TokenAuthenticator`] verifies HS256 JWTs carrying `{ sub, role, exp }`.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use fitlink_shared::Role;

use crate::error::{Result, ServerError};

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &str) -> Result<Identity>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    exp: i64,
}

pub struct TokenAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Mint a token. Used by local tooling and tests only.
    pub fn issue(&self, user_id: &str, role: Role, ttl: chrono::Duration) -> Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ServerError::Internal(format!("token encoding failed: {e}")))
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, credential: &str) -> Result<Identity> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(ServerError::Authentication("missing credential".into()));
        }

        let data = decode::<Claims>(credential, &self.decoding, &self.validation)
            .map_err(|e| ServerError::Authentication(e.to_string()))?;

        if data.claims.sub.trim().is_empty() {
            return Err(ServerError::Authentication("token has no subject".into()));
        }

        Ok(Identity {
            user_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}

/// Extract the token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_round_trips() {
        let auth = TokenAuthenticator::new(b"secret");
        let token = auth
            .issue("trainer-7", Role::Trainer, chrono::Duration::hours(1))
            .unwrap();

        let identity = auth.authenticate(&token).unwrap();
        assert_eq!(identity.user_id, "trainer-7");
        assert_eq!(identity.role, Role::Trainer);
    }

    #[test]
    fn rejects_bad_tokens() {
        let auth = TokenAuthenticator::new(b"secret");
        let other = TokenAuthenticator::new(b"other-secret");
        let foreign = other
            .issue("c1", Role::Client, chrono::Duration::hours(1))
            .unwrap();
        let expired = auth
            .issue("c1", Role::Client, chrono::Duration::hours(-2))
            .unwrap();

        assert!(matches!(auth.authenticate(""), Err(ServerError::Authentication(_))));
        assert!(auth.authenticate("not-a-jwt").is_err());
        assert!(auth.authenticate(&foreign).is_err());
        assert!(auth.authenticate(&expired).is_err());
    }

    #[test]
    fn bearer_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
    }
}
