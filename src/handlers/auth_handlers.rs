use axum::{extract::State, http::StatusCode, Extension, Json};
use serde_json::json;
use tracing::{info, instrument};

use crate::auth::{self, CurrentUser, TokenPair};
use crate::dto::{LoginRequest, RefreshRequest, RegisterRequest};
use crate::errors::ApiError;
use crate::models::User;
use crate::AppState;

/// Handler for creating an account
///
/// This function handles POST requests to `/api/auth/register`.
///
/// ### Returns
///
/// The new user with status 201
#[instrument(skip(state, payload), fields(email = %payload.email))]
pub async fn register_handler(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = auth::register(&state.pool, &payload.email, &payload.password, &payload.display_name)?;

    info!("Registered user with id: {}", user.get_id());
    Ok((StatusCode::CREATED, Json(user)))
}

/// Handler for exchanging credentials for a token pair
///
/// This function handles POST requests to `/api/auth/login`.
#[instrument(skip(state, payload))]
pub async fn login_handler(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let tokens = auth::login(&state.pool, &state.jwt, &payload.email, &payload.password)?;
    Ok(Json(tokens))
}

/// Handler for rotating a refresh token
///
/// This function handles POST requests to `/api/auth/refresh`. The presented
/// token is revoked before the new pair is returned.
#[instrument(skip_all)]
pub async fn refresh_handler(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let tokens = auth::refresh(&state.pool, &state.jwt, &payload.refresh_token)?;
    Ok(Json(tokens))
}

#[instrument(skip_all)]
pub async fn logout_handler(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<StatusCode, ApiError> {
    auth::logout(&state.pool, &payload.refresh_token)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for revoking every refresh token of the current user
///
/// This function handles POST requests to `/api/auth/logout-all`.
#[instrument(skip(state, user), fields(user_id = %user.get_id()))]
pub async fn logout_all_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let revoked = auth::logout_all(&state.pool, &user.get_id())?;
    Ok(Json(json!({ "revoked": revoked })))
}

pub async fn auth_me_handler(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<User> {
    Json(user)
}
