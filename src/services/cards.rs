use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::decks::owned_deck;
use super::{BulkFailure, BulkOutcome, Page, check_page};
use crate::db::DbPool;
use crate::errors::ApiError;
use crate::models::{Card, CardStatus, CardTemplate, Deck, JsonValue, StringList};
use crate::rag::RagService;
use crate::repo::{self, CardChanges, CardFilter};

/// Most cards accepted by one bulk request
pub const MAX_BULK_CARDS: usize = 100;

/// Input for a new card
#[derive(Debug, Clone, Deserialize)]
pub struct NewCard {
    pub deck_id: String,
    pub template_id: String,
    pub fields: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Changes requested for a card; `None` leaves the value alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CardUpdate {
    pub fields: Option<serde_json::Value>,
    pub tags: Option<Vec<String>>,
    pub status: Option<CardStatus>,
    pub deck_id: Option<String>,
}

/// Listing filters
#[derive(Debug, Clone, Default)]
pub struct CardQuery {
    pub deck_id: Option<String>,
    pub status: Option<CardStatus>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkCreateOutcome {
    pub created: Vec<Card>,
    pub errors: Vec<BulkCreateError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkCreateError {
    pub index: usize,
    pub error: String,
}

/// Outcome the sync agent reports for one card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCardStatus {
    Synced,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentCardReport {
    pub status: AgentCardStatus,
    #[serde(default)]
    pub anki_note_id: Option<i64>,
    #[serde(default)]
    pub anki_card_id: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Loads a card whose deck belongs to `user_id`
fn owned_card(pool: &DbPool, user_id: &str, card_id: &str, include_deleted: bool) -> Result<(Card, Deck), ApiError> {
    let (card, deck) = repo::get_card_with_deck(pool, card_id)?.ok_or(ApiError::NotFound("Card"))?;
    if card.is_deleted() && !include_deleted {
        return Err(ApiError::NotFound("Card"));
    }
    if !deck.is_owned_by(user_id) {
        return Err(ApiError::PermissionDenied("You do not own this card".into()));
    }
    Ok((card, deck))
}

fn visible_template(pool: &DbPool, user_id: &str, template_id: &str) -> Result<CardTemplate, ApiError> {
    repo::get_template(pool, template_id)?
        .filter(|template| template.is_visible_to(user_id))
        .ok_or(ApiError::NotFound("Template"))
}

fn check_fields(template: &CardTemplate, fields: &serde_json::Value) -> Result<(), ApiError> {
    if !fields.is_object() {
        return Err(ApiError::Validation("fields must be an object".into()));
    }
    let missing = template.missing_required_fields(fields);
    if !missing.is_empty() {
        return Err(ApiError::Validation(format!("missing required fields: {}", missing.join(", "))));
    }
    Ok(())
}

fn check_transition(from: CardStatus, to: CardStatus) -> Result<(), ApiError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ApiError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

fn apply(pool: &DbPool, card_id: &str, changes: CardChanges) -> Result<Card, ApiError> {
    repo::update_card(pool, card_id, changes)?.ok_or(ApiError::NotFound("Card"))
}

#[instrument(skip(pool, new_card), fields(deck_id = %new_card.deck_id))]
pub fn create(pool: &DbPool, user_id: &str, new_card: NewCard) -> Result<Card, ApiError> {
    let deck = owned_deck(pool, user_id, &new_card.deck_id)?;
    let template = visible_template(pool, user_id, &new_card.template_id)?;
    check_fields(&template, &new_card.fields)?;

    let card = Card::new(
        deck.get_id(),
        template.id,
        new_card.fields,
        new_card.tags,
        Some(user_id.to_string()),
    );
    Ok(repo::insert_card(pool, card)?)
}

/// Creates each card independently, collecting per-index errors
pub fn create_bulk(pool: &DbPool, user_id: &str, cards: Vec<NewCard>) -> Result<BulkCreateOutcome, ApiError> {
    if cards.is_empty() || cards.len() > MAX_BULK_CARDS {
        return Err(ApiError::Validation(format!("between 1 and {MAX_BULK_CARDS} cards are accepted")));
    }

    let mut outcome = BulkCreateOutcome { created: Vec::new(), errors: Vec::new() };
    for (index, card) in cards.into_iter().enumerate() {
        match create(pool, user_id, card) {
            Ok(card) => outcome.created.push(card),
            Err(ApiError::Database(err)) => return Err(ApiError::Database(err)),
            Err(err) => outcome.errors.push(BulkCreateError { index, error: err.to_string() }),
        }
    }
    info!("Bulk created {} cards, {} failed", outcome.created.len(), outcome.errors.len());
    Ok(outcome)
}

pub fn get(pool: &DbPool, user_id: &str, card_id: &str) -> Result<Card, ApiError> {
    owned_card(pool, user_id, card_id, false).map(|(card, _)| card)
}

/// The user's live cards, newest first
pub fn list(pool: &DbPool, user_id: &str, query: CardQuery, offset: i64, limit: i64) -> Result<Page<Card>, ApiError> {
    check_page(offset, limit)?;
    let filter = CardFilter {
        owner_id: user_id.to_string(),
        deck_id: query.deck_id,
        status: query.status,
        tags: query.tags,
        ..Default::default()
    };
    let (items, total) = repo::list_cards(pool, &filter, offset, limit)?;
    Ok(Page { items, total, offset, limit })
}

#[instrument(skip(pool, update))]
pub fn update(pool: &DbPool, user_id: &str, card_id: &str, update: CardUpdate) -> Result<Card, ApiError> {
    let (card, _) = owned_card(pool, user_id, card_id, false)?;
    let mut changes = CardChanges::default();

    if let Some(fields) = update.fields {
        let template = visible_template(pool, user_id, &card.get_template_id())?;
        check_fields(&template, &fields)?;
        changes.fields = Some(JsonValue(fields));
    }
    if let Some(tags) = update.tags {
        changes.tags = Some(StringList(tags));
    }
    if let Some(deck_id) = update.deck_id {
        owned_deck(pool, user_id, &deck_id)?;
        changes.deck_id = Some(deck_id);
    }
    if let Some(status) = update.status {
        check_transition(card.get_status(), status)?;
        if status == CardStatus::Draft {
            changes.rejection_reason = Some(None);
        }
        changes.status = Some(status);
    }

    apply(pool, card_id, changes)
}

/// Soft deletes a card, or removes it for good with `hard`
#[instrument(skip(pool))]
pub fn delete(pool: &DbPool, user_id: &str, card_id: &str, hard: bool) -> Result<(), ApiError> {
    owned_card(pool, user_id, card_id, hard)?;
    if hard {
        repo::hard_delete_card(pool, card_id)?;
    } else {
        repo::set_card_deleted(pool, card_id, true)?;
    }
    Ok(())
}

/// Brings back a soft-deleted card whose deck is still live
pub fn restore(pool: &DbPool, user_id: &str, card_id: &str) -> Result<Card, ApiError> {
    let (card, deck) = owned_card(pool, user_id, card_id, true)?;
    if !card.is_deleted() {
        return Ok(card);
    }
    if deck.is_deleted() {
        return Err(ApiError::Validation("the card's deck is deleted; restore the deck first".into()));
    }
    repo::set_card_deleted(pool, card_id, false)?.ok_or(ApiError::NotFound("Card"))
}

pub fn approve(pool: &DbPool, user_id: &str, card_id: &str) -> Result<Card, ApiError> {
    let (card, _) = owned_card(pool, user_id, card_id, false)?;
    check_transition(card.get_status(), CardStatus::Approved)?;
    apply(
        pool,
        card_id,
        CardChanges {
            status: Some(CardStatus::Approved),
            rejection_reason: Some(None),
            ..Default::default()
        },
    )
}

pub fn reject(pool: &DbPool, user_id: &str, card_id: &str, reason: &str) -> Result<Card, ApiError> {
    let (card, _) = owned_card(pool, user_id, card_id, false)?;
    check_transition(card.get_status(), CardStatus::Rejected)?;
    apply(
        pool,
        card_id,
        CardChanges {
            status: Some(CardStatus::Rejected),
            rejection_reason: Some(Some(reason.to_string())),
            ..Default::default()
        },
    )
}

/// Records that a card now lives in the Anki collection
pub fn mark_synced(
    pool: &DbPool,
    user_id: &str,
    card_id: &str,
    anki_card_id: Option<i64>,
    anki_note_id: i64,
) -> Result<Card, ApiError> {
    let (card, _) = owned_card(pool, user_id, card_id, false)?;
    check_transition(card.get_status(), CardStatus::Synced)?;
    apply(
        pool,
        card_id,
        CardChanges {
            status: Some(CardStatus::Synced),
            anki_card_id: anki_card_id.map(Some),
            anki_note_id: Some(Some(anki_note_id)),
            sync_error: Some(None),
            ..Default::default()
        },
    )
}

pub fn mark_sync_failed(pool: &DbPool, user_id: &str, card_id: &str, error: &str) -> Result<Card, ApiError> {
    let (card, _) = owned_card(pool, user_id, card_id, false)?;
    check_transition(card.get_status(), CardStatus::SyncFailed)?;
    warn!("Card {} failed to sync: {}", card_id, error);
    repo::record_sync_failure(pool, card_id, error)?.ok_or(ApiError::NotFound("Card"))
}

/// Applies a sync report from the agent
pub fn apply_agent_report(pool: &DbPool, user_id: &str, card_id: &str, report: AgentCardReport) -> Result<Card, ApiError> {
    match report.status {
        AgentCardStatus::Synced => {
            let note_id = report
                .anki_note_id
                .ok_or_else(|| ApiError::Validation("anki_note_id is required for synced cards".into()))?;
            mark_synced(pool, user_id, card_id, report.anki_card_id, note_id)
        }
        AgentCardStatus::Error => {
            let message = report.error_message.unwrap_or_else(|| "unknown sync error".to_string());
            mark_sync_failed(pool, user_id, card_id, &message)
        }
    }
}

fn bulk<F>(ids: &[String], mut op: F) -> Result<BulkOutcome, ApiError>
where
    F: FnMut(&str) -> Result<Card, ApiError>,
{
    if ids.is_empty() || ids.len() > MAX_BULK_CARDS {
        return Err(ApiError::Validation(format!("between 1 and {MAX_BULK_CARDS} ids are accepted")));
    }
    let mut outcome = BulkOutcome::default();
    for id in ids {
        match op(id) {
            Ok(_) => outcome.succeeded.push(id.clone()),
            Err(ApiError::Database(err)) => return Err(ApiError::Database(err)),
            Err(err) => outcome.failed.push(BulkFailure { id: id.clone(), error: err.to_string() }),
        }
    }
    Ok(outcome)
}

pub fn bulk_approve(pool: &DbPool, user_id: &str, ids: &[String]) -> Result<BulkOutcome, ApiError> {
    bulk(ids, |id| approve(pool, user_id, id))
}

pub fn bulk_reject(pool: &DbPool, user_id: &str, ids: &[String], reason: &str) -> Result<BulkOutcome, ApiError> {
    bulk(ids, |id| reject(pool, user_id, id, reason))
}

/// Re-embeds cards after their text changed; failures only log
pub async fn refresh_index(rag: &RagService, user_id: &str, card_ids: &[String]) {
    if let Err(err) = rag.index_cards(user_id, card_ids, false).await {
        warn!("Indexing {} cards failed: {}", card_ids.len(), err);
    }
}

/// Drops embeddings of removed cards; failures only log
pub fn drop_from_index(rag: &RagService, user_id: &str, card_ids: &[String]) {
    if let Err(err) = rag.remove(user_id, card_ids) {
        warn!("Removing {} embeddings failed: {}", card_ids.len(), err);
    }
}
