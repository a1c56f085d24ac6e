//! Pushes approved cards from the backend into the local Anki collection.

use std::collections::HashMap;

use ankirag::anki::{AnkiClient, AnkiError, NewNote, NoteInfo};
use ankirag::models::{Card, CLOZE_TEMPLATE_ID};
use ankirag::services::cards::AgentCardStatus;
use ankirag::services::sync::AgentReport;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{ApiClient, CardSyncUpdate};
use crate::settings::AgentSettings;

/// Tag added to every note the agent creates
pub const ANKIRAG_TAG: &str = "AnkiRAG";

/// Most approved cards handled in one run
pub const MAX_CARDS_PER_RUN: usize = 500;

/// Most error messages sent back with the run report
const MAX_REPORTED_ERRORS: usize = 10;

/// Length of the front prefix used to look for duplicates
const DUPLICATE_QUERY_CHARS: usize = 50;

/// Totals of one sync run
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub cards_synced: i32,
    pub cards_failed: i32,
    pub cards_skipped: i32,
    pub errors: Vec<String>,
}

/// What happened to a single card in Anki
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoteOutcome {
    Created(i64),
    Updated(i64),
    /// Existing note with identical content
    Unchanged(i64),
    /// A note with the same front was already in the deck
    Duplicate(i64),
}

impl NoteOutcome {
    fn note_id(self) -> i64 {
        match self {
            NoteOutcome::Created(id)
            | NoteOutcome::Updated(id)
            | NoteOutcome::Unchanged(id)
            | NoteOutcome::Duplicate(id) => id,
        }
    }
}

pub struct SyncEngine<'a> {
    api: &'a ApiClient,
    anki: &'a AnkiClient,
    settings: &'a AgentSettings,
}

impl<'a> SyncEngine<'a> {
    pub fn new(api: &'a ApiClient, anki: &'a AnkiClient, settings: &'a AgentSettings) -> Self {
        Self { api, anki, settings }
    }

    /// Runs a full sync and reports the outcome to the backend
    ///
    /// Fails without touching anything when Anki or the backend cannot be
    /// reached. Per-card failures are counted, not returned.
    pub async fn run(&self) -> anyhow::Result<SyncSummary> {
        self.anki
            .version()
            .await
            .map_err(|e| anyhow::anyhow!("Anki is not reachable at {}: {e}", self.anki.url()))?;
        let user = self.api.me().await?;
        debug!("Authenticated as {}", user.get_email());

        self.ensure_deck(&self.settings.default_deck).await?;

        let cards = self.fetch_approved().await?;
        info!("Syncing {} approved cards", cards.len());

        let mut summary = SyncSummary::default();
        for card in &cards {
            let update = match self.sync_card(card).await {
                Ok(outcome) => {
                    if matches!(outcome, NoteOutcome::Unchanged(_)) {
                        summary.cards_skipped += 1;
                    } else {
                        summary.cards_synced += 1;
                    }
                    CardSyncUpdate {
                        status: AgentCardStatus::Synced,
                        anki_note_id: Some(outcome.note_id()),
                        anki_card_id: None,
                        synced_at: Utc::now().naive_utc(),
                        error_message: None,
                    }
                }
                Err(err) => {
                    warn!("Card {} failed: {}", card.get_id(), err);
                    summary.cards_failed += 1;
                    summary.errors.push(format!("Anki error for card {}: {err}", card.get_id()));
                    CardSyncUpdate {
                        status: AgentCardStatus::Error,
                        anki_note_id: None,
                        anki_card_id: None,
                        synced_at: Utc::now().naive_utc(),
                        error_message: Some(err.to_string()),
                    }
                }
            };

            if let Err(err) = self.api.report_card(&card.get_id(), &update).await {
                warn!("Could not report status of card {}: {}", card.get_id(), err);
            }
        }

        let report = AgentReport {
            cards_synced: summary.cards_synced,
            cards_failed: summary.cards_failed,
            cards_skipped: summary.cards_skipped,
            errors: summary.errors.iter().take(MAX_REPORTED_ERRORS).cloned().collect(),
            completed_at: Some(Utc::now().naive_utc()),
        };
        if let Err(err) = self.api.complete_sync(&report).await {
            warn!("Could not record the sync run: {}", err);
        }

        Ok(summary)
    }

    async fn ensure_deck(&self, name: &str) -> Result<(), AnkiError> {
        if !self.anki.deck_names().await?.iter().any(|deck| deck == name) {
            info!("Creating Anki deck {}", name);
            self.anki.create_deck(name).await?;
        }
        Ok(())
    }

    /// Collects approved cards page by page before any of them change state
    async fn fetch_approved(&self) -> anyhow::Result<Vec<Card>> {
        let page_size = self.settings.api_batch_size.clamp(1, 100);
        let mut cards = Vec::new();
        loop {
            let page = self.api.approved_cards(cards.len(), page_size).await?;
            let received = page.items.len();
            cards.extend(page.items);
            if received < page_size || cards.len() as i64 >= page.total || cards.len() >= MAX_CARDS_PER_RUN {
                break;
            }
        }
        cards.truncate(MAX_CARDS_PER_RUN);
        Ok(cards)
    }

    async fn sync_card(&self, card: &Card) -> Result<NoteOutcome, AnkiError> {
        if let Some(note_id) = card.get_anki_note_id() {
            // Missing notes were deleted in Anki; fall through and recreate
            if let Some(existing) = self.anki.notes_info(&[note_id]).await?.into_iter().next() {
                return self.update_existing(card, &existing).await;
            }
        }

        if let Some(note_id) = self.find_duplicate(card).await {
            info!("Card {} duplicates note {}", card.get_id(), note_id);
            return Ok(NoteOutcome::Duplicate(note_id));
        }

        let note = NewNote {
            deck_name: self.settings.default_deck.clone(),
            model_name: self.model_for(card),
            fields: self.fields_for(card),
            tags: note_tags(card),
        };
        let note_id = self.anki.add_note(&note).await?;
        info!("Created note {} for card {}", note_id, card.get_id());
        Ok(NoteOutcome::Created(note_id))
    }

    async fn update_existing(&self, card: &Card, existing: &NoteInfo) -> Result<NoteOutcome, AnkiError> {
        let wanted = self.fields_for(card);
        let current = existing.field_values();
        if wanted.iter().all(|(name, value)| current.get(name) == Some(value)) {
            debug!("Note {} unchanged", existing.note_id);
            return Ok(NoteOutcome::Unchanged(existing.note_id));
        }

        self.anki.update_note_fields(existing.note_id, &wanted).await?;
        info!("Updated note {} for card {}", existing.note_id, card.get_id());
        Ok(NoteOutcome::Updated(existing.note_id))
    }

    /// Lookup errors count as "no duplicate"
    async fn find_duplicate(&self, card: &Card) -> Option<i64> {
        let query = duplicate_query(&self.settings.default_deck, &card.front());
        match self.anki.find_notes(&query).await {
            Ok(ids) => ids.into_iter().next(),
            Err(err) => {
                debug!("Duplicate lookup failed: {}", err);
                None
            }
        }
    }

    fn model_for(&self, card: &Card) -> String {
        if card.get_template_id() == CLOZE_TEMPLATE_ID {
            "Cloze".to_string()
        } else {
            self.settings.default_model.clone()
        }
    }

    fn fields_for(&self, card: &Card) -> HashMap<String, String> {
        let (question, answer) = if card.get_template_id() == CLOZE_TEMPLATE_ID {
            ("Text", "Extra")
        } else {
            ("Front", "Back")
        };
        HashMap::from([
            (question.to_string(), card.front()),
            (answer.to_string(), card.back()),
        ])
    }
}

fn note_tags(card: &Card) -> Vec<String> {
    let mut tags = card.get_tags().to_vec();
    if !tags.iter().any(|tag| tag == ANKIRAG_TAG) {
        tags.push(ANKIRAG_TAG.to_string());
    }
    tags
}

/// Anki search matching notes of `deck` whose front starts like `front`
fn duplicate_query(deck: &str, front: &str) -> String {
    let prefix: String = front.chars().take(DUPLICATE_QUERY_CHARS).collect();
    format!("deck:\"{}\" \"front:{}\"", deck, prefix.replace('"', "\\\""))
}
