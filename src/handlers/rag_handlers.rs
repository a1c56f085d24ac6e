use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::json;
use tracing::{info, instrument};

use crate::auth::CurrentUser;
use crate::dto::{DuplicateCheckRequest, IndexRequest, ReindexRequest, SearchRequest, check_threshold};
use crate::errors::ApiError;
use crate::rag::{DuplicateResult, IndexOutcome, IndexStats, ReindexOutcome, SearchHit};
use crate::AppState;

/// Most candidates accepted by one duplicate check
const MAX_DUPLICATE_CANDIDATES: usize = 50;

/// Most card ids accepted by one index request
const MAX_INDEX_IDS: usize = 100;

/// Handler for searching the user's cards
///
/// This function handles POST requests to `/api/rag/search`.
///
/// ### Arguments
///
/// * `state` - The application state
/// * `user` - The authenticated user; only their cards are searched
/// * `payload` - Query text, result count, threshold, search type and filters
///
/// ### Returns
///
/// Hits ordered by descending similarity
#[instrument(skip(state, user, payload), fields(search_type = ?payload.search_type, k = payload.k))]
pub async fn search_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = payload.into_query()?;
    let hits: Vec<SearchHit> = state.rag.search(&user.get_id(), &query).await?;

    info!("Search returned {} hits", hits.len());
    Ok(Json(json!({
        "query": query.query,
        "results": hits,
        "total": hits.len(),
        "search_type": query.search_type,
    })))
}

/// Handler for embedding specific cards
///
/// This function handles POST requests to `/api/rag/index`. Cards whose
/// stored embedding is current are skipped unless `force` is set.
#[instrument(skip(state, user, payload), fields(count = payload.card_ids.len(), force = payload.force))]
pub async fn index_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<IndexRequest>,
) -> Result<Json<IndexOutcome>, ApiError> {
    if payload.card_ids.is_empty() || payload.card_ids.len() > MAX_INDEX_IDS {
        return Err(ApiError::Validation(format!("between 1 and {MAX_INDEX_IDS} card ids are accepted")));
    }
    let outcome = state.rag.index_cards(&user.get_id(), &payload.card_ids, payload.force).await?;
    Ok(Json(outcome))
}

#[instrument(skip(state, user, payload))]
pub async fn reindex_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<ReindexRequest>,
) -> Result<Json<ReindexOutcome>, ApiError> {
    let outcome = state.rag.reindex(&user.get_id(), payload.deck_id.as_deref()).await?;
    info!("Reindexed {} cards", outcome.indexed_count);
    Ok(Json(outcome))
}

#[instrument(skip(state, user))]
pub async fn remove_from_index_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.rag.remove(&user.get_id(), &[card_id])?;
    Ok(Json(json!({ "removed": removed })))
}

/// Handler for checking new card texts against existing cards
///
/// This function handles POST requests to `/api/rag/duplicates`.
#[instrument(skip(state, user, payload), fields(count = payload.cards.len()))]
pub async fn check_duplicates_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<DuplicateCheckRequest>,
) -> Result<Json<Vec<DuplicateResult>>, ApiError> {
    if payload.cards.is_empty() || payload.cards.len() > MAX_DUPLICATE_CANDIDATES {
        return Err(ApiError::Validation(format!(
            "between 1 and {MAX_DUPLICATE_CANDIDATES} cards are accepted"
        )));
    }
    check_threshold(payload.threshold)?;

    let results = state
        .rag
        .check_duplicates(&user.get_id(), &payload.cards, payload.threshold)
        .await?;
    Ok(Json(results))
}

pub async fn index_stats_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<IndexStats>, ApiError> {
    Ok(Json(state.rag.stats(&user.get_id())?))
}
