use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use axum_extra::extract::Query;
use tracing::{debug, info, instrument};

use crate::auth::CurrentUser;
use crate::dto::{
    BulkCreateRequest, BulkIdsRequest, BulkRejectRequest, CardListQuery, CardPatch, DeleteQuery,
    MarkSyncedRequest, RejectRequest, SimilarQuery, SyncFailedRequest, check_threshold,
};
use crate::errors::ApiError;
use crate::models::Card;
use crate::rag::SearchHit;
use crate::services::cards::{self, BulkCreateOutcome, NewCard};
use crate::services::{BulkOutcome, Page};
use crate::AppState;

/// Handler for creating a card
///
/// This function handles POST requests to `/api/cards`.
///
/// ### Arguments
///
/// * `state` - The application state
/// * `user` - The authenticated user, who must own the target deck
/// * `payload` - Deck, template, field values and tags of the new card
///
/// ### Returns
///
/// The created draft card with status 201
#[instrument(skip(state, user, payload), fields(deck_id = %payload.deck_id, template_id = %payload.template_id))]
pub async fn create_card_handler(
    // Extract the application state
    State(state): State<AppState>,
    // The user resolved by the auth middleware
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    // Extract and deserialize the JSON request body
    Json(payload): Json<NewCard>,
) -> Result<(StatusCode, Json<Card>), ApiError> {
    info!("Creating new card");
    let user_id = user.get_id();

    let card = cards::create(&state.pool, &user_id, payload)?;
    cards::refresh_index(&state.rag, &user_id, &[card.get_id()]).await;

    info!("Successfully created card with id: {}", card.get_id());
    Ok((StatusCode::CREATED, Json(card)))
}

/// Handler for creating up to 100 cards at once
///
/// This function handles POST requests to `/api/cards/bulk`. Each card
/// succeeds or fails on its own; failures are reported by their index.
#[instrument(skip(state, user, payload), fields(count = payload.cards.len()))]
pub async fn bulk_create_cards_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<BulkCreateRequest>,
) -> Result<(StatusCode, Json<BulkCreateOutcome>), ApiError> {
    let user_id = user.get_id();
    let outcome = cards::create_bulk(&state.pool, &user_id, payload.cards)?;

    let ids: Vec<String> = outcome.created.iter().map(Card::get_id).collect();
    if !ids.is_empty() {
        cards::refresh_index(&state.rag, &user_id, &ids).await;
    }
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Handler for listing cards
///
/// This function handles GET requests to `/api/cards`.
///
/// ### Arguments
///
/// * `state` - The application state
/// * `user` - The authenticated user
/// * `query` - Deck, status and tag filters plus pagination
///
/// ### Returns
///
/// A page of the user's live cards, newest first
#[instrument(skip(state, user, query))]
pub async fn list_cards_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<CardListQuery>,
) -> Result<Json<Page<Card>>, ApiError> {
    debug!("Listing cards with {:?}", query);
    let page = cards::list(&state.pool, &user.get_id(), query.filters(), query.offset, query.limit)?;
    info!("Retrieved {} of {} cards", page.items.len(), page.total);
    Ok(Json(page))
}

#[instrument(skip(state, user), fields(card_id = %card_id))]
pub async fn get_card_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
) -> Result<Json<Card>, ApiError> {
    debug!("Getting card");
    Ok(Json(cards::get(&state.pool, &user.get_id(), &card_id)?))
}

/// Handler for changing a card
///
/// This function handles PATCH requests to `/api/cards/{id}`. Clients send
/// field, tag, deck or status edits; the sync agent sends its per-card
/// outcome (`status` of `synced` or `error` with Anki ids) to the same route.
#[instrument(skip(state, user, body), fields(card_id = %card_id))]
pub async fn update_card_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Card>, ApiError> {
    let user_id = user.get_id();

    let card = match CardPatch::from_value(body)? {
        CardPatch::SyncReport(report) => {
            debug!("Applying sync report {:?}", report.status);
            cards::apply_agent_report(&state.pool, &user_id, &card_id, report)?
        }
        CardPatch::Edit(update) => {
            let reindex = update.fields.is_some() || update.tags.is_some();
            let card = cards::update(&state.pool, &user_id, &card_id, update)?;
            if reindex {
                cards::refresh_index(&state.rag, &user_id, &[card.get_id()]).await;
            }
            card
        }
    };

    info!("Updated card, status is now {}", card.get_status());
    Ok(Json(card))
}

/// Handler for deleting a card
///
/// This function handles DELETE requests to `/api/cards/{id}`. Pass
/// `?hard=true` to remove the row instead of flagging it.
#[instrument(skip(state, user), fields(card_id = %card_id))]
pub async fn delete_card_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, ApiError> {
    let user_id = user.get_id();
    cards::delete(&state.pool, &user_id, &card_id, query.hard)?;
    cards::drop_from_index(&state.rag, &user_id, &[card_id]);

    info!("Deleted card (hard: {})", query.hard);
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, user), fields(card_id = %card_id))]
pub async fn restore_card_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
) -> Result<Json<Card>, ApiError> {
    let user_id = user.get_id();
    let card = cards::restore(&state.pool, &user_id, &card_id)?;
    cards::refresh_index(&state.rag, &user_id, &[card.get_id()]).await;
    Ok(Json(card))
}

#[instrument(skip(state, user), fields(card_id = %card_id))]
pub async fn approve_card_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
) -> Result<Json<Card>, ApiError> {
    let card = cards::approve(&state.pool, &user.get_id(), &card_id)?;
    info!("Approved card");
    Ok(Json(card))
}

#[instrument(skip(state, user, payload), fields(card_id = %card_id))]
pub async fn reject_card_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
    Json(payload): Json<RejectRequest>,
) -> Result<Json<Card>, ApiError> {
    let card = cards::reject(&state.pool, &user.get_id(), &card_id, &payload.reason)?;
    info!("Rejected card");
    Ok(Json(card))
}

/// Handler for recording a successful sync
///
/// This function handles POST requests to `/api/cards/{id}/synced`.
#[instrument(skip(state, user, payload), fields(card_id = %card_id, anki_note_id = payload.anki_note_id))]
pub async fn mark_synced_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
    Json(payload): Json<MarkSyncedRequest>,
) -> Result<Json<Card>, ApiError> {
    let card = cards::mark_synced(
        &state.pool,
        &user.get_id(),
        &card_id,
        payload.anki_card_id,
        payload.anki_note_id,
    )?;
    Ok(Json(card))
}

#[instrument(skip(state, user, payload), fields(card_id = %card_id))]
pub async fn mark_sync_failed_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
    Json(payload): Json<SyncFailedRequest>,
) -> Result<Json<Card>, ApiError> {
    let card = cards::mark_sync_failed(&state.pool, &user.get_id(), &card_id, &payload.error)?;
    Ok(Json(card))
}

/// Handler for approving several cards
///
/// This function handles POST requests to `/api/cards/bulk/approve`.
#[instrument(skip(state, user, payload), fields(count = payload.card_ids.len()))]
pub async fn bulk_approve_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<BulkIdsRequest>,
) -> Result<Json<BulkOutcome>, ApiError> {
    let outcome = cards::bulk_approve(&state.pool, &user.get_id(), &payload.card_ids)?;
    info!("Approved {}, failed {}", outcome.succeeded.len(), outcome.failed.len());
    Ok(Json(outcome))
}

#[instrument(skip(state, user, payload), fields(count = payload.card_ids.len()))]
pub async fn bulk_reject_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<BulkRejectRequest>,
) -> Result<Json<BulkOutcome>, ApiError> {
    let outcome = cards::bulk_reject(&state.pool, &user.get_id(), &payload.card_ids, &payload.reason)?;
    Ok(Json(outcome))
}

/// Handler for finding cards close to an existing card
///
/// This function handles GET requests to `/api/cards/{id}/similar` and
/// `/api/rag/similar/{id}`.
#[instrument(skip(state, user), fields(card_id = %card_id))]
pub async fn similar_cards_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(card_id): Path<String>,
    Query(query): Query<SimilarQuery>,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    if !(1..=crate::dto::MAX_SEARCH_RESULTS).contains(&query.k) {
        return Err(ApiError::Validation(format!("k must be between 1 and {}", crate::dto::MAX_SEARCH_RESULTS)));
    }
    check_threshold(query.threshold)?;

    let similar = state.rag.find_similar(&user.get_id(), &card_id, query.k, query.threshold)?;
    debug!("Found {} similar cards", similar.len());
    Ok(Json(similar))
}
