use crate::db::DbPool;
use crate::models::{Card, CardGenerationInfo, CardStatus, Deck, JsonValue, StringList};
use crate::schema::{card_generation_info, cards, decks};
use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Filters for listing a user's cards
#[derive(Debug, Clone, Default)]
pub struct CardFilter {
    /// Only cards in decks owned by this user
    pub owner_id: String,
    pub deck_id: Option<String>,
    pub deck_ids: Option<Vec<String>>,
    pub status: Option<CardStatus>,
    /// Matches cards sharing at least one tag
    pub tags: Vec<String>,
    pub include_deleted: bool,
}

/// Columns of a card that can change after creation
///
/// `Some(None)` clears a nullable column.
#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = cards)]
pub struct CardChanges {
    pub deck_id: Option<String>,
    pub fields: Option<JsonValue>,
    pub tags: Option<StringList>,
    pub status: Option<CardStatus>,
    pub anki_card_id: Option<Option<i64>>,
    pub anki_note_id: Option<Option<i64>>,
    pub rejection_reason: Option<Option<String>>,
    pub sync_error: Option<Option<String>>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Inserts a new card
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `card` - The card to insert
///
/// ### Returns
///
/// The inserted card
#[instrument(skip(pool, card), fields(card_id = %card.get_id(), deck_id = %card.get_deck_id()))]
pub fn insert_card(pool: &DbPool, card: Card) -> Result<Card> {
    let conn = &mut pool.get()?;

    diesel::insert_into(cards::table)
        .values(&card)
        .execute(conn)?;

    debug!("Inserted card");
    Ok(card)
}

/// Retrieves a card by id, including soft-deleted cards
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `card_id` - The ID of the card to retrieve
///
/// ### Returns
///
/// A Result containing the card if it exists, or None if it does not
#[instrument(skip(pool))]
pub fn get_card(pool: &DbPool, card_id: &str) -> Result<Option<Card>> {
    let conn = &mut pool.get()?;

    let card = cards::table.find(card_id).first::<Card>(conn).optional()?;

    Ok(card)
}

/// Retrieves a card together with the deck that holds it
///
/// Ownership checks go through the deck, so callers that need both load
/// them in one query.
///
/// ### Returns
///
/// The card and its deck, or None if the card does not exist
pub fn get_card_with_deck(pool: &DbPool, card_id: &str) -> Result<Option<(Card, Deck)>> {
    let conn = &mut pool.get()?;

    let row = cards::table
        .inner_join(decks::table)
        .filter(cards::id.eq(card_id))
        .select((Card::as_select(), Deck::as_select()))
        .first::<(Card, Deck)>(conn)
        .optional()?;

    Ok(row)
}

/// Loads the given cards, skipping ids that do not exist
pub fn get_cards_by_ids(pool: &DbPool, card_ids: &[String]) -> Result<Vec<Card>> {
    let conn = &mut pool.get()?;

    let found = cards::table
        .filter(cards::id.eq_any(card_ids))
        .load::<Card>(conn)?;

    Ok(found)
}

fn filtered_cards(filter: &CardFilter) -> cards::BoxedQuery<'_, diesel::sqlite::Sqlite> {
    let owned_decks = decks::table
        .filter(decks::owner_id.eq(&filter.owner_id))
        .filter(decks::deleted_at.is_null())
        .select(decks::id);

    let mut query = cards::table
        .filter(cards::deck_id.eq_any(owned_decks))
        .into_boxed();

    if !filter.include_deleted {
        query = query.filter(cards::deleted_at.is_null());
    }
    if let Some(deck_id) = &filter.deck_id {
        query = query.filter(cards::deck_id.eq(deck_id));
    }
    if let Some(deck_ids) = &filter.deck_ids {
        query = query.filter(cards::deck_id.eq_any(deck_ids));
    }
    if let Some(status) = filter.status {
        query = query.filter(cards::status.eq(status));
    }
    query
}

/// Lists the cards matching `filter`, newest first
///
/// Tags are stored as JSON text, so a tag filter is applied after loading
/// and pagination then happens in memory.
///
/// ### Returns
///
/// The requested page and the total number of matching cards
#[instrument(skip(pool, filter), fields(owner_id = %filter.owner_id))]
pub fn list_cards(
    pool: &DbPool,
    filter: &CardFilter,
    offset: i64,
    limit: i64,
) -> Result<(Vec<Card>, i64)> {
    let conn = &mut pool.get()?;

    if filter.tags.is_empty() {
        let total = filtered_cards(filter).count().get_result::<i64>(conn)?;
        let page = filtered_cards(filter)
            .order((cards::created_at.desc(), cards::id.asc()))
            .offset(offset)
            .limit(limit)
            .load::<Card>(conn)?;
        return Ok((page, total));
    }

    let matching: Vec<Card> = filtered_cards(filter)
        .order((cards::created_at.desc(), cards::id.asc()))
        .load::<Card>(conn)?
        .into_iter()
        .filter(|card| card.get_tag_list().overlaps(&filter.tags))
        .collect();

    let total = matching.len() as i64;
    let page = matching
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect();

    Ok((page, total))
}

/// Every live card matching `filter`, without pagination
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `filter` - Owner, deck, status and tag constraints
///
/// ### Returns
///
/// The matching cards, oldest first
pub fn list_all_cards(pool: &DbPool, filter: &CardFilter) -> Result<Vec<Card>> {
    let conn = &mut pool.get()?;

    let all = filtered_cards(filter)
        .order(cards::created_at.asc())
        .load::<Card>(conn)?
        .into_iter()
        .filter(|card| filter.tags.is_empty() || card.get_tag_list().overlaps(&filter.tags))
        .collect();

    Ok(all)
}

/// Applies `changes` to a card
///
/// `updated_at` is always set to now.
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `card_id` - The ID of the card to change
/// * `changes` - The columns to write; `None` fields are left alone
///
/// ### Returns
///
/// The updated card, or None if no card has that id
///
/// ### Errors
///
/// Returns an error if:
/// - Unable to get a connection from the pool
/// - The update violates a constraint, e.g. a `deck_id` that does not exist
#[instrument(skip(pool, changes))]
pub fn update_card(pool: &DbPool, card_id: &str, mut changes: CardChanges) -> Result<Option<Card>> {
    let conn = &mut pool.get()?;
    changes.updated_at = Some(Utc::now().naive_utc());

    let card = diesel::update(cards::table.find(card_id))
        .set(&changes)
        .get_result::<Card>(conn)
        .optional()?;

    Ok(card)
}

/// Marks a card as failed to sync and bumps its attempt counter
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `card_id` - The ID of the card
/// * `error` - Message stored in `sync_error`
///
/// ### Returns
///
/// The updated card, or None if no card has that id
pub fn record_sync_failure(pool: &DbPool, card_id: &str, error: &str) -> Result<Option<Card>> {
    let conn = &mut pool.get()?;

    let card = diesel::update(cards::table.find(card_id))
        .set((
            cards::status.eq(CardStatus::SyncFailed),
            cards::sync_error.eq(Some(error)),
            cards::sync_attempts.eq(cards::sync_attempts + 1),
            cards::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result::<Card>(conn)
        .optional()?;

    Ok(card)
}

/// Sets or clears the soft-delete marker of a card
///
/// ### Returns
///
/// The updated card, or None if no card has that id
pub fn set_card_deleted(pool: &DbPool, card_id: &str, deleted: bool) -> Result<Option<Card>> {
    let conn = &mut pool.get()?;
    let now = Utc::now().naive_utc();
    let marker = if deleted { Some(now) } else { None };

    let card = diesel::update(cards::table.find(card_id))
        .set((cards::deleted_at.eq(marker), cards::updated_at.eq(now)))
        .get_result::<Card>(conn)
        .optional()?;

    Ok(card)
}

/// Permanently removes a card and the rows hanging off it
///
/// Generation info and embeddings are removed by their foreign keys.
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `card_id` - The ID of the card to delete
///
/// ### Returns
///
/// `true` if a card was deleted, `false` if none had that id
pub fn hard_delete_card(pool: &DbPool, card_id: &str) -> Result<bool> {
    let conn = &mut pool.get()?;

    let deleted = diesel::delete(cards::table.find(card_id)).execute(conn)?;

    info!("Hard deleted card {}", card_id);
    Ok(deleted > 0)
}

/// Anki note ids among `note_ids` that already belong to live cards of a deck
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `deck_id` - The deck to look in
/// * `note_ids` - Candidate Anki note ids
///
/// ### Returns
///
/// The subset of `note_ids` already imported into the deck, in no particular order
pub fn existing_anki_note_ids(pool: &DbPool, deck_id: &str, note_ids: &[i64]) -> Result<Vec<i64>> {
    let conn = &mut pool.get()?;

    let existing = cards::table
        .filter(cards::deck_id.eq(deck_id))
        .filter(cards::deleted_at.is_null())
        .filter(cards::anki_note_id.eq_any(note_ids))
        .select(cards::anki_note_id.assume_not_null())
        .load::<i64>(conn)?;

    Ok(existing)
}

/// Counts a user's live cards per status
///
/// ### Returns
///
/// A map from status to count; statuses without cards are absent
pub fn count_cards_by_status(pool: &DbPool, owner_id: &str) -> Result<HashMap<CardStatus, i64>> {
    let conn = &mut pool.get()?;

    let owned_decks = decks::table
        .filter(decks::owner_id.eq(owner_id))
        .filter(decks::deleted_at.is_null())
        .select(decks::id);

    let rows = cards::table
        .filter(cards::deck_id.eq_any(owned_decks))
        .filter(cards::deleted_at.is_null())
        .group_by(cards::status)
        .select((cards::status, diesel::dsl::count_star()))
        .load::<(CardStatus, i64)>(conn)?;

    Ok(rows.into_iter().collect())
}

/// Counts cards of any state built from a template
///
/// Soft-deleted cards count too, since they still reference the template.
pub fn count_cards_with_template(pool: &DbPool, template_id: &str) -> Result<i64> {
    let conn = &mut pool.get()?;

    let count = cards::table
        .filter(cards::template_id.eq(template_id))
        .count()
        .get_result::<i64>(conn)?;

    Ok(count)
}

/// Stores the provenance of a generated card
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `info` - Job, model, sources and confidence of the card
///
/// ### Errors
///
/// Returns an error if the card does not exist or already has generation info
pub fn insert_generation_info(pool: &DbPool, info: &CardGenerationInfo) -> Result<()> {
    let conn = &mut pool.get()?;

    diesel::insert_into(card_generation_info::table)
        .values(info)
        .execute(conn)?;

    Ok(())
}

/// Retrieves the generation provenance of a card, if it was generated
pub fn get_generation_info(pool: &DbPool, card_id: &str) -> Result<Option<CardGenerationInfo>> {
    let conn = &mut pool.get()?;

    let info = card_generation_info::table
        .find(card_id)
        .first::<CardGenerationInfo>(conn)
        .optional()?;

    Ok(info)
}
