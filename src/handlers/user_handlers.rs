use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use tracing::{debug, info, instrument};

use crate::auth::CurrentUser;
use crate::dto::{PageQuery, UpdateMeRequest};
use crate::errors::ApiError;
use crate::models::User;
use crate::services::users::{self, PreferencesUpdate};
use crate::services::Page;
use crate::AppState;

/// Handler for reading the current user
///
/// This function handles GET requests to `/api/users/me`.
pub async fn get_me_handler(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<User> {
    Json(user)
}

/// Handler for changing the current user's display name or email
///
/// This function handles PATCH requests to `/api/users/me`.
///
/// ### Arguments
///
/// * `state` - The application state
/// * `user` - The authenticated user
/// * `payload` - The fields to change; missing fields stay as they are
///
/// ### Returns
///
/// The updated user as JSON
#[instrument(skip(state, user, payload), fields(user_id = %user.get_id()))]
pub async fn update_me_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<UpdateMeRequest>,
) -> Result<Json<User>, ApiError> {
    let updated = users::update_me(&state.pool, &user.get_id(), payload.display_name, payload.email)?;
    info!("Updated profile");
    Ok(Json(updated))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.get_id()))]
pub async fn update_preferences_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<PreferencesUpdate>,
) -> Result<Json<User>, ApiError> {
    let updated = users::update_preferences(&state.pool, &user.get_id(), payload)?;
    Ok(Json(updated))
}

#[instrument(skip(state))]
pub async fn get_user_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(users::get_user(&state.pool, &id)?))
}

/// Handler for listing users
///
/// This function handles GET requests to `/api/users`.
#[instrument(skip(state))]
pub async fn list_users_handler(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<User>>, ApiError> {
    let users = users::list_users(&state.pool, page.offset, page.limit)?;
    debug!("Retrieved {} of {} users", users.items.len(), users.total);
    Ok(Json(users))
}

#[instrument(skip(state))]
pub async fn deactivate_user_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let user = users::set_active(&state.pool, &id, false)?;
    info!("Deactivated user");
    Ok(Json(user))
}

#[instrument(skip(state))]
pub async fn activate_user_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let user = users::set_active(&state.pool, &id, true)?;
    info!("Activated user");
    Ok(Json(user))
}

/// Handler for soft-deleting a user
///
/// This function handles DELETE requests to `/api/users/{id}`.
#[instrument(skip(state))]
pub async fn delete_user_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    users::delete_user(&state.pool, &id)?;
    info!("Deleted user");
    Ok(StatusCode::NO_CONTENT)
}
