use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use axum_extra::extract::Query;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::auth::CurrentUser;
use crate::dto::{CardListQuery, CreateDeckRequest, DeckListQuery};
use crate::errors::ApiError;
use crate::models::{Card, Deck, DeckNode};
use crate::services::decks::{self, DeckUpdate, DeckWithCards};
use crate::services::{cards, Page};
use crate::AppState;

/// Handler for creating a deck
///
/// This function handles POST requests to `/api/decks`.
///
/// ### Arguments
///
/// * `state` - The application state
/// * `user` - The authenticated user who will own the deck
/// * `payload` - The name, optional description and optional parent
///
/// ### Returns
///
/// The created deck with status 201
#[instrument(skip(state, user, payload), fields(name = %payload.name))]
pub async fn create_deck_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<CreateDeckRequest>,
) -> Result<(StatusCode, Json<Deck>), ApiError> {
    let deck = decks::create(
        &state.pool,
        &user.get_id(),
        &payload.name,
        payload.description,
        payload.parent_id,
    )?;

    info!("Created deck with id: {}", deck.get_id());
    Ok((StatusCode::CREATED, Json(deck)))
}

/// Handler for listing decks
///
/// This function handles GET requests to `/api/decks`. `parent_id` narrows
/// the listing to the children of one deck.
#[instrument(skip(state, user))]
pub async fn list_decks_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<DeckListQuery>,
) -> Result<Json<Page<Deck>>, ApiError> {
    let page = decks::list(
        &state.pool,
        &user.get_id(),
        query.parent_id.as_deref(),
        query.offset,
        query.limit,
    )?;
    debug!("Retrieved {} decks", page.items.len());
    Ok(Json(page))
}

pub async fn deck_tree_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<Vec<DeckNode>>, ApiError> {
    Ok(Json(decks::tree(&state.pool, &user.get_id())?))
}

/// Handler for reading a deck with its newest cards
///
/// This function handles GET requests to `/api/decks/{id}`.
#[instrument(skip(state, user))]
pub async fn get_deck_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(deck_id): Path<String>,
) -> Result<Json<DeckWithCards>, ApiError> {
    Ok(Json(decks::get_with_cards(&state.pool, &user.get_id(), &deck_id)?))
}

#[instrument(skip(state, user, payload))]
pub async fn update_deck_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(deck_id): Path<String>,
    Json(payload): Json<DeckUpdate>,
) -> Result<Json<Deck>, ApiError> {
    let deck = decks::update(&state.pool, &user.get_id(), &deck_id, payload)?;
    info!("Updated deck");
    Ok(Json(deck))
}

/// Handler for deleting a deck
///
/// This function handles DELETE requests to `/api/decks/{id}`. The deck's
/// descendants and all their cards are soft-deleted with it.
///
/// ### Returns
///
/// How many decks and cards were deleted
#[instrument(skip(state, user))]
pub async fn delete_deck_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(deck_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (deleted_decks, deleted_cards) = decks::delete(&state.pool, &user.get_id(), &deck_id)?;
    Ok(Json(json!({
        "deleted_decks": deleted_decks,
        "deleted_cards": deleted_cards,
    })))
}

#[instrument(skip(state, user))]
pub async fn restore_deck_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(deck_id): Path<String>,
) -> Result<Json<Deck>, ApiError> {
    let deck = decks::restore(&state.pool, &user.get_id(), &deck_id)?;
    info!("Restored deck");
    Ok(Json(deck))
}

pub async fn deck_ancestors_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(deck_id): Path<String>,
) -> Result<Json<Vec<Deck>>, ApiError> {
    Ok(Json(decks::ancestors(&state.pool, &user.get_id(), &deck_id)?))
}

pub async fn deck_descendants_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(deck_id): Path<String>,
) -> Result<Json<Vec<Deck>>, ApiError> {
    Ok(Json(decks::descendants(&state.pool, &user.get_id(), &deck_id)?))
}

/// Handler for listing the cards of one deck
///
/// This function handles GET requests to `/api/decks/{id}/cards` and accepts
/// the same filters as `/api/cards`; the path wins over a `deck_id` filter.
#[instrument(skip(state, user, query))]
pub async fn list_deck_cards_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(deck_id): Path<String>,
    Query(query): Query<CardListQuery>,
) -> Result<Json<Page<Card>>, ApiError> {
    let user_id = user.get_id();
    decks::owned_deck(&state.pool, &user_id, &deck_id)?;

    let mut filters = query.filters();
    filters.deck_id = Some(deck_id);
    let page = cards::list(&state.pool, &user_id, filters, query.offset, query.limit)?;
    Ok(Json(page))
}
