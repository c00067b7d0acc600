//! Request authentication.
//!
//! The service trusts a JWT in the `authentication` header, signed with the
//! shared token key. A missing header means the anonymous user (id 0);
//! whether anonymous is acceptable is decided per endpoint.
use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::errors::{IccError, Result};

const AUTH_HEADER: &str = "authentication";

#[async_trait]
pub trait Authenticater: Send + Sync + 'static {
    /// Resolves the authenticated user id from the request headers.
    /// Returns 0 for the anonymous user and [`IccError::Auth`] for
    /// credentials that are present but invalid.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<i32>;
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(rename = "userId")]
    user_id: i32,
}

/// HS256 verification against the shared token key.
pub struct TokenAuth {
    key: DecodingKey,
    validation: Validation,
}

impl TokenAuth {
    pub fn new(token_key: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // The ticket only carries the user id; expiry is handled by the
        // auth service that minted it.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        Self {
            key: DecodingKey::from_secret(token_key),
            validation,
        }
    }
}

#[async_trait]
impl Authenticater for TokenAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<i32> {
        let Some(raw) = headers.get(AUTH_HEADER) else {
            return Ok(0);
        };
        let raw = raw
            .to_str()
            .map_err(|_| IccError::Auth("authentication header is not valid text".to_string()))?;
        let token = raw.strip_prefix("bearer ").unwrap_or(raw);

        let decoded = jsonwebtoken::decode::<TokenClaims>(token, &self.key, &self.validation)
            .map_err(|err| IccError::Auth(format!("invalid auth token: {err}")))?;
        Ok(decoded.claims.user_id)
    }
}

/// Fixed-identity authenticator for tests and local development.
pub struct StaticAuth {
    uid: i32,
}

impl StaticAuth {
    pub fn new(uid: i32) -> Self {
        Self { uid }
    }
}

#[async_trait]
impl Authenticater for StaticAuth {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<i32> {
        Ok(self.uid)
    }
}
