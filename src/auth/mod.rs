//! Registration, login and token rotation.

mod jwt;
mod middleware;
mod password;

pub use jwt::{Claims, IssuedToken, JwtError, JwtService, TokenType};
pub use middleware::{CurrentUser, require_auth};
pub use password::{hash_password, verify_password};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::db::DbPool;
use crate::errors::ApiError;
use crate::models::{RefreshToken, User};
use crate::repo;

/// Access/refresh pair returned by login and refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

/// Normalises and checks registration input
fn validate_registration(email: &str, password: &str, display_name: &str) -> Result<String, ApiError> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') || email.len() < 3 {
        return Err(ApiError::Validation("email must be a valid address".into()));
    }
    if password.chars().count() < 8 {
        return Err(ApiError::Validation("password must be at least 8 characters".into()));
    }
    let name_len = display_name.trim().chars().count();
    if !(1..=100).contains(&name_len) {
        return Err(ApiError::Validation("display_name must be 1-100 characters".into()));
    }
    Ok(email)
}

/// Creates an account
///
/// ### Errors
///
/// `Validation` for malformed input, `Conflict` when the email is taken.
#[instrument(skip(pool, password))]
pub fn register(pool: &DbPool, email: &str, password: &str, display_name: &str) -> Result<User, ApiError> {
    let email = validate_registration(email, password, display_name)?;

    if repo::get_user_by_email(pool, &email)?.is_some() {
        return Err(ApiError::Conflict(format!("email {email} is already registered")));
    }

    let hashed = hash_password(password)?;
    let user = repo::create_user(pool, User::new(email, hashed, display_name.trim().to_string()))?;

    info!("Registered user {}", user.get_id());
    Ok(user)
}

fn issue_pair(pool: &DbPool, jwt: &JwtService, user_id: &str) -> Result<TokenPair, ApiError> {
    let access = jwt.issue_access_token(user_id)?;
    let refresh = jwt.issue_refresh_token(user_id)?;

    repo::store_refresh_token(
        pool,
        &RefreshToken::new(user_id.to_string(), refresh.token.clone(), refresh.expires_at.naive_utc()),
    )?;

    Ok(TokenPair {
        access_token: access.token,
        refresh_token: refresh.token,
        token_type: "bearer".to_string(),
        expires_in: jwt.access_ttl().num_seconds(),
    })
}

/// Exchanges credentials for a token pair
#[instrument(skip(pool, jwt, password))]
pub fn login(pool: &DbPool, jwt: &JwtService, email: &str, password: &str) -> Result<TokenPair, ApiError> {
    let email = email.trim().to_lowercase();

    let Some(user) = repo::get_user_by_email(pool, &email)? else {
        warn!("login for unknown email");
        return Err(ApiError::InvalidCredentials);
    };
    if !verify_password(password, user.get_hashed_password()) {
        warn!("wrong password for user {}", user.get_id());
        return Err(ApiError::InvalidCredentials);
    }
    if !user.is_active() {
        return Err(ApiError::AccountInactive);
    }

    issue_pair(pool, jwt, &user.get_id())
}

/// Rotates a refresh token: the presented one is revoked and a new pair issued
#[instrument(skip_all)]
pub fn refresh(pool: &DbPool, jwt: &JwtService, refresh_token: &str) -> Result<TokenPair, ApiError> {
    let claims = jwt.decode(refresh_token, TokenType::Refresh)?;

    let stored = repo::find_refresh_token(pool, refresh_token)?.ok_or(ApiError::TokenInvalid)?;
    if stored.revoked_at.is_some() {
        warn!("revoked refresh token presented for user {}", stored.user_id);
        return Err(ApiError::TokenRevoked);
    }
    if !stored.is_usable(Utc::now().naive_utc()) {
        return Err(ApiError::TokenExpired);
    }

    let user = repo::get_user(pool, &claims.sub)?.ok_or(ApiError::TokenInvalid)?;
    if !user.is_active() {
        return Err(ApiError::AccountInactive);
    }

    if !repo::revoke_refresh_token(pool, refresh_token)? {
        return Err(ApiError::TokenRevoked);
    }
    issue_pair(pool, jwt, &user.get_id())
}

/// Revokes one refresh token; unknown tokens are ignored
pub fn logout(pool: &DbPool, refresh_token: &str) -> Result<(), ApiError> {
    repo::revoke_refresh_token(pool, refresh_token)?;
    Ok(())
}

/// Revokes every refresh token of a user
pub fn logout_all(pool: &DbPool, user_id: &str) -> Result<usize, ApiError> {
    let revoked = repo::revoke_all_for_user(pool, user_id)?;
    info!("Revoked {} refresh tokens for user {}", revoked, user_id);
    Ok(revoked)
}
