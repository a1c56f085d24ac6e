//! Access and refresh tokens.
//!
//! Both token kinds are HS256 JWTs signed with the server secret. The
//! `type` claim keeps a refresh token from being used as an access token and
//! the other way round; `jti` makes every issued token unique so refresh
//! tokens can be stored and revoked individually.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
    #[error("expected a {expected} token")]
    WrongType { expected: TokenType },
    #[error("jwt error: {0}")]
    Jwt(jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => JwtError::Expired,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::MissingAlgorithm
            | ErrorKind::ImmatureSignature
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_)
            | ErrorKind::MissingRequiredClaim(_) => JwtError::Invalid,
            _ => JwtError::Jwt(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Access => f.write_str("access"),
            TokenType::Refresh => f.write_str("refresh"),
        }
    }
}

/// Claims carried by both token kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
}

impl Claims {
    pub fn expires_at(&self) -> Option<NaiveDateTime> {
        DateTime::from_timestamp(self.exp, 0).map(|dt| dt.naive_utc())
    }
}

/// A freshly signed token and when it stops being valid
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies tokens
#[derive(Clone)]
pub struct JwtService {
    secret: Arc<SecretString>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtService {
    /// Allowed clock skew when checking `exp`
    const LEEWAY_SECONDS: u64 = 5;

    pub fn new(secret: SecretString, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret: Arc::new(secret),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn issue_access_token(&self, user_id: &str) -> Result<IssuedToken, JwtError> {
        self.issue(user_id, TokenType::Access, self.access_ttl)
    }

    pub fn issue_refresh_token(&self, user_id: &str) -> Result<IssuedToken, JwtError> {
        self.issue(user_id, TokenType::Refresh, self.refresh_ttl)
    }

    fn issue(&self, user_id: &str, token_type: TokenType, ttl: Duration) -> Result<IssuedToken, JwtError> {
        let now = Utc::now();
        let expires_at = now + ttl;

        let claims = Claims {
            sub: user_id.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type,
        };

        let key = EncodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let token = encode(&Header::new(Algorithm::HS256), &claims, &key)?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verifies signature, expiry and token type
    pub fn decode(&self, token: &str, expected: TokenType) -> Result<Claims, JwtError> {
        if token.trim().is_empty() {
            return Err(JwtError::Invalid);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = Self::LEEWAY_SECONDS;
        validation.required_spec_claims =
            HashSet::from(["sub".to_string(), "exp".to_string()]);

        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let claims = decode::<Claims>(token, &key, &validation)?.claims;

        if claims.token_type != expected {
            return Err(JwtError::WrongType { expected });
        }
        Ok(claims)
    }
}
