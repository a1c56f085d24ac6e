use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use tracing::{debug, info, instrument};

use crate::auth::CurrentUser;
use crate::dto::{PromptListQuery, RenderRequest};
use crate::errors::ApiError;
use crate::models::Prompt;
use crate::services::prompts::{self, NewPrompt, PromptUpdate, RenderedPrompt};
use crate::AppState;

/// Handler for creating a prompt
///
/// This function handles POST requests to `/api/prompts`. The new prompt
/// starts at version 1 and is active.
#[instrument(skip(state, payload), fields(name = %payload.name, category = %payload.category))]
pub async fn create_prompt_handler(
    State(state): State<AppState>,
    Json(payload): Json<NewPrompt>,
) -> Result<(StatusCode, Json<Prompt>), ApiError> {
    let prompt = prompts::create(&state.pool, payload)?;
    info!("Created prompt with id: {}", prompt.id);
    Ok((StatusCode::CREATED, Json(prompt)))
}

#[instrument(skip(state))]
pub async fn list_prompts_handler(
    State(state): State<AppState>,
    Query(query): Query<PromptListQuery>,
) -> Result<Json<Vec<Prompt>>, ApiError> {
    let prompts = prompts::list(&state.pool, query.category, query.active_only)?;
    debug!("Retrieved {} prompts", prompts.len());
    Ok(Json(prompts))
}

pub async fn get_prompt_handler(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
) -> Result<Json<Prompt>, ApiError> {
    Ok(Json(prompts::get(&state.pool, &prompt_id)?))
}

/// Handler for changing a prompt
///
/// This function handles PATCH requests to `/api/prompts/{id}`. The change is
/// stored as a new active version and the previous version is deactivated.
///
/// ### Returns
///
/// The new version
#[instrument(skip(state, payload))]
pub async fn update_prompt_handler(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
    Json(payload): Json<PromptUpdate>,
) -> Result<Json<Prompt>, ApiError> {
    let prompt = prompts::update(&state.pool, &prompt_id, payload)?;
    info!("Prompt is now at version {}", prompt.version);
    Ok(Json(prompt))
}

#[instrument(skip(state))]
pub async fn delete_prompt_handler(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    prompts::delete(&state.pool, &prompt_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn prompt_versions_handler(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
) -> Result<Json<Vec<Prompt>>, ApiError> {
    Ok(Json(prompts::versions(&state.pool, &prompt_id)?))
}

/// Handler for filling a prompt's placeholders
///
/// This function handles POST requests to `/api/prompts/{id}/render`. Each
/// render is recorded as an execution of the prompt.
#[instrument(skip(state, user, payload))]
pub async fn render_prompt_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(prompt_id): Path<String>,
    Json(payload): Json<RenderRequest>,
) -> Result<Json<RenderedPrompt>, ApiError> {
    let rendered = prompts::render(&state.pool, &user.get_id(), &prompt_id, payload.variables)?;
    Ok(Json(rendered))
}
