//! Bearer credential verification.

use crate::config::{AuthConfig, AuthMode};
use anyhow::{Context, Result};
use axum::http::{header, HeaderMap};
use courier_protocol::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer credential")]
    MissingCredential,

    #[error("Invalid credential: {0}")]
    Invalid(String),
}

/// Claims carried by a Courier access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    /// Expiry, seconds since the epoch.
    pub exp: usize,
}

/// Turns a bearer credential into a user id.
pub trait IdentityVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns [`AuthError::Invalid`] if the credential is not acceptable.
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;

    fn name(&self) -> &'static str;
}

/// HS256 JWT verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| UserId(data.claims.sub))
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "jwt"
    }
}

/// Accepts the decimal user id as the token.
pub struct InsecureVerifier;

impl IdentityVerifier for InsecureVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        token
            .trim()
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| AuthError::Invalid("expected a numeric user id".into()))
    }

    fn name(&self) -> &'static str {
        "insecure"
    }
}

/// Build the verifier selected by configuration.
///
/// # Errors
///
/// Returns an error if `jwt` mode has no secret.
pub fn build_verifier(config: &AuthConfig) -> Result<Arc<dyn IdentityVerifier>> {
    match config.mode {
        AuthMode::Jwt => {
            let secret = config
                .jwt_secret
                .as_deref()
                .context("auth.jwt_secret is required in jwt mode")?;
            Ok(Arc::new(JwtVerifier::new(secret)))
        }
        AuthMode::Insecure => {
            warn!("Insecure auth enabled: any client can claim any user id. Do not use in production");
            Ok(Arc::new(InsecureVerifier))
        }
    }
}

/// The bearer credential from `Authorization`, else from `?token=`.
#[must_use]
pub fn bearer_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query_token)
        .filter(|t| !t.is_empty())
}

/// Verify whatever credential the request carries.
///
/// # Errors
///
/// Returns [`AuthError::MissingCredential`] when there is none.
pub fn authenticate(
    verifier: &dyn IdentityVerifier,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<UserId, AuthError> {
    let token = bearer_token(headers, query_token).ok_or(AuthError::MissingCredential)?;
    verifier.verify(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: i64, exp: usize) -> String {
        encode(
            &Header::default(),
            &Claims { sub, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> usize {
        (chrono::Utc::now().timestamp() + 3600) as usize
    }

    #[test]
    fn test_jwt_roundtrip() {
        let verifier = JwtVerifier::new("secret");
        let user = verifier.verify(&token("secret", 42, far_future())).unwrap();
        assert_eq!(user, UserId(42));
    }

    #[test]
    fn test_jwt_wrong_secret() {
        let verifier = JwtVerifier::new("secret");
        assert!(verifier.verify(&token("other", 42, far_future())).is_err());
    }

    #[test]
    fn test_jwt_expired() {
        let verifier = JwtVerifier::new("secret");
        let past = (chrono::Utc::now().timestamp() - 3600) as usize;
        assert!(verifier.verify(&token("secret", 42, past)).is_err());
    }

    #[test]
    fn test_insecure_parses_user_id() {
        assert_eq!(InsecureVerifier.verify("7").unwrap(), UserId(7));
        assert!(InsecureVerifier.verify("seven").is_err());
    }

    #[test]
    fn test_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer 1"));

        assert_eq!(bearer_token(&headers, Some("2")), Some("1"));
        assert_eq!(bearer_token(&HeaderMap::new(), Some("2")), Some("2"));
        assert_eq!(bearer_token(&HeaderMap::new(), Some("")), None);
    }

    #[test]
    fn test_authenticate_without_credential() {
        assert!(matches!(
            authenticate(&InsecureVerifier, &HeaderMap::new(), None),
            Err(AuthError::MissingCredential)
        ));
    }
}
