//! JWT issuing and verification.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::JwtConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

fn algorithm(cfg: &JwtConfig) -> Result<Algorithm, AuthError> {
    match cfg.algorithm.as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(AuthError::UnsupportedAlgorithm(other.to_string())),
    }
}

/// Issue an access token for `user_id` valid for `ttl_minutes`.
pub fn create_token(cfg: &JwtConfig, user_id: i64, ttl_minutes: u64) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + (ttl_minutes as i64) * 60,
    };
    encode(
        &Header::new(algorithm(cfg)?),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
    .map_err(|e| AuthError::Invalid(e.to_string()))
}

/// Verify a token and return the embedded user id.
pub fn verify_token(cfg: &JwtConfig, token: &str) -> Result<i64, AuthError> {
    let validation = Validation::new(algorithm(cfg)?);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Invalid(e.to_string()),
    })?;

    data.claims
        .sub
        .parse()
        .map_err(|_| AuthError::Invalid("non-numeric subject".into()))
}

/// Verify a refresh token and mint a fresh access token for the same user.
pub fn refresh_token(cfg: &JwtConfig, token: &str) -> Result<String, AuthError> {
    let user_id = verify_token(cfg, token)?;
    create_token(cfg, user_id, cfg.access_ttl_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret".into(),
            algorithm: "HS256".into(),
            access_ttl_minutes: 30,
            refresh_ttl_minutes: 60,
        }
    }

    #[test]
    fn roundtrip() {
        let cfg = test_config();
        let token = create_token(&cfg, 42, 30).unwrap();
        assert_eq!(verify_token(&cfg, &token).unwrap(), 42);
    }

    #[test]
    fn expired_token_rejected() {
        let cfg = test_config();
        // Well past the validator's default leeway.
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "42".into(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(cfg.secret.as_bytes()),
        )
        .unwrap();
        assert!(matches!(verify_token(&cfg, &token), Err(AuthError::Expired)));
    }

    #[test]
    fn wrong_secret_rejected() {
        let cfg = test_config();
        let token = create_token(&cfg, 7, 30).unwrap();
        let other = JwtConfig {
            secret: "different".into(),
            ..test_config()
        };
        assert!(matches!(
            verify_token(&other, &token),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn refresh_keeps_subject() {
        let cfg = test_config();
        let token = create_token(&cfg, 9, 30).unwrap();
        let refreshed = refresh_token(&cfg, &token).unwrap();
        assert_eq!(verify_token(&cfg, &refreshed).unwrap(), 9);
    }
}
