use axum::{
    extract::{Query, State},
    Json,
};
use tracing::debug;

use crate::dto::ModelListQuery;
use crate::errors::ApiError;
use crate::models::{EmbeddingModel, LlmModel};
use crate::repo;
use crate::AppState;

/// Handler for listing registered chat and generation models
///
/// This function handles GET requests to `/api/models/llm`.
pub async fn list_llm_models_handler(
    State(state): State<AppState>,
    Query(query): Query<ModelListQuery>,
) -> Result<Json<Vec<LlmModel>>, ApiError> {
    let models = repo::list_llm_models(&state.pool, query.active_only)?;
    debug!("Retrieved {} LLM models", models.len());
    Ok(Json(models))
}

pub async fn list_embedding_models_handler(
    State(state): State<AppState>,
    Query(query): Query<ModelListQuery>,
) -> Result<Json<Vec<EmbeddingModel>>, ApiError> {
    Ok(Json(repo::list_embedding_models(&state.pool, query.active_only)?))
}

/// Handler for listing the models the LLM service reports right now
///
/// This function handles GET requests to `/api/models/available`. An
/// unreachable service yields an empty list.
pub async fn available_models_handler(State(state): State<AppState>) -> Json<Vec<serde_json::Value>> {
    Json(state.llm.list_models().await)
}
