use tracing::{info, instrument};

use super::{Page, check_page};
use crate::db::DbPool;
use crate::errors::ApiError;
use crate::models::{User, UserPreferences};
use crate::repo;

/// Partial preference update; `None` keeps the stored value
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PreferencesUpdate {
    pub preferred_language: Option<String>,
    pub default_model_id: Option<String>,
    pub default_embedder_id: Option<String>,
}

fn live_user(pool: &DbPool, user_id: &str) -> Result<User, ApiError> {
    repo::get_user(pool, user_id)?
        .filter(|user| !user.is_deleted())
        .ok_or(ApiError::NotFound("User"))
}

/// Changes the display name and/or email of the current user
#[instrument(skip(pool))]
pub fn update_me(
    pool: &DbPool,
    user_id: &str,
    display_name: Option<String>,
    email: Option<String>,
) -> Result<User, ApiError> {
    let display_name = display_name.map(|name| name.trim().to_string());
    if let Some(name) = &display_name {
        if !(1..=100).contains(&name.chars().count()) {
            return Err(ApiError::Validation("display_name must be 1-100 characters".into()));
        }
    }

    let email = email.map(|email| email.trim().to_lowercase());
    if let Some(email) = &email {
        if !email.contains('@') {
            return Err(ApiError::Validation("email must be a valid address".into()));
        }
        if let Some(existing) = repo::get_user_by_email(pool, email)? {
            if existing.get_id() != user_id {
                return Err(ApiError::Conflict(format!("email {email} is already registered")));
            }
        }
    }

    repo::update_user_profile(pool, user_id, display_name, email)?.ok_or(ApiError::NotFound("User"))
}

/// Merges `update` into the stored preferences
pub fn update_preferences(pool: &DbPool, user_id: &str, update: PreferencesUpdate) -> Result<User, ApiError> {
    let user = live_user(pool, user_id)?;
    let mut preferences: UserPreferences = user.get_preferences();

    if let Some(language) = update.preferred_language {
        if !(2..=5).contains(&language.chars().count()) {
            return Err(ApiError::Validation("preferred_language must be 2-5 characters".into()));
        }
        preferences.preferred_language = language;
    }
    if let Some(model_id) = update.default_model_id {
        if repo::get_llm_model(pool, &model_id)?.is_none() {
            return Err(ApiError::Validation(format!("unknown model {model_id}")));
        }
        preferences.default_model_id = Some(model_id);
    }
    if let Some(embedder_id) = update.default_embedder_id {
        if repo::get_embedding_model(pool, &embedder_id)?.is_none() {
            return Err(ApiError::Validation(format!("unknown embedding model {embedder_id}")));
        }
        preferences.default_embedder_id = Some(embedder_id);
    }

    repo::update_user_preferences(pool, user_id, &preferences)?.ok_or(ApiError::NotFound("User"))
}

pub fn get_user(pool: &DbPool, user_id: &str) -> Result<User, ApiError> {
    live_user(pool, user_id)
}

pub fn list_users(pool: &DbPool, offset: i64, limit: i64) -> Result<Page<User>, ApiError> {
    check_page(offset, limit)?;
    let (items, total) = repo::list_users(pool, offset, limit)?;
    Ok(Page { items, total, offset, limit })
}

/// Activates or deactivates an account
///
/// Deactivation also revokes the user's refresh tokens.
#[instrument(skip(pool))]
pub fn set_active(pool: &DbPool, user_id: &str, active: bool) -> Result<User, ApiError> {
    let user = repo::set_user_active(pool, user_id, active)?.ok_or(ApiError::NotFound("User"))?;
    if !active {
        repo::revoke_all_for_user(pool, user_id)?;
    }
    info!("user {} active={}", user_id, active);
    Ok(user)
}

#[instrument(skip(pool))]
pub fn delete_user(pool: &DbPool, user_id: &str) -> Result<(), ApiError> {
    if !repo::soft_delete_user(pool, user_id)? {
        return Err(ApiError::NotFound("User"));
    }
    repo::revoke_all_for_user(pool, user_id)?;
    info!("deleted user {}", user_id);
    Ok(())
}
