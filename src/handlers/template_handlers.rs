use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use tracing::{info, instrument};

use crate::auth::CurrentUser;
use crate::dto::TemplateListQuery;
use crate::errors::ApiError;
use crate::models::CardTemplate;
use crate::services::templates::{self, NewTemplate, TemplateUpdate};
use crate::AppState;

/// Handler for creating a card template owned by the current user
///
/// This function handles POST requests to `/api/templates`.
#[instrument(skip(state, user, payload), fields(name = %payload.name))]
pub async fn create_template_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<NewTemplate>,
) -> Result<(StatusCode, Json<CardTemplate>), ApiError> {
    let template = templates::create(&state.pool, &user.get_id(), payload)?;
    info!("Created template with id: {}", template.id);
    Ok((StatusCode::CREATED, Json(template)))
}

/// Handler for listing templates
///
/// This function handles GET requests to `/api/templates`. System templates
/// are included unless `include_system=false`.
pub async fn list_templates_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<TemplateListQuery>,
) -> Result<Json<Vec<CardTemplate>>, ApiError> {
    Ok(Json(templates::list(&state.pool, &user.get_id(), query.include_system)?))
}

pub async fn get_template_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(template_id): Path<String>,
) -> Result<Json<CardTemplate>, ApiError> {
    Ok(Json(templates::get(&state.pool, &user.get_id(), &template_id)?))
}

#[instrument(skip(state, user, payload))]
pub async fn update_template_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(template_id): Path<String>,
    Json(payload): Json<TemplateUpdate>,
) -> Result<Json<CardTemplate>, ApiError> {
    let template = templates::update(&state.pool, &user.get_id(), &template_id, payload)?;
    Ok(Json(template))
}

#[instrument(skip(state, user))]
pub async fn delete_template_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(template_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    templates::delete(&state.pool, &user.get_id(), &template_id)?;
    info!("Deleted template");
    Ok(StatusCode::NO_CONTENT)
}
