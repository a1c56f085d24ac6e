use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use tracing::warn;

use super::jwt::TokenType;
use crate::errors::ApiError;
use crate::models::User;
use crate::{AppState, repo};

/// The authenticated user, inserted as a request extension by `require_auth`
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

/// Rejects requests without a valid access token for an active user
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let bearer = match req.headers().typed_get::<Authorization<Bearer>>() {
        Some(Authorization(token)) => token.token().to_owned(),
        None => return ApiError::TokenInvalid.into_response(),
    };

    let claims = match state.jwt.decode(&bearer, TokenType::Access) {
        Ok(claims) => claims,
        Err(error) => {
            warn!(?error, "failed to decode access token");
            return ApiError::from(error).into_response();
        }
    };

    let user = match repo::get_user(&state.pool, &claims.sub) {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!("user `{}` missing", claims.sub);
            return ApiError::TokenInvalid.into_response();
        }
        Err(error) => return ApiError::Database(error).into_response(),
    };

    if !user.is_active() {
        warn!("user `{}` rejected (inactive)", claims.sub);
        return ApiError::AccountInactive.into_response();
    }

    req.extensions_mut().insert(CurrentUser(user));
    next.run(req).await
}
