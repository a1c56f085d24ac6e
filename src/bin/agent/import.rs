//! Copies notes of an Anki deck into the backend.

use ankirag::anki::{AnkiClient, NoteInfo};
use ankirag::services::sync::{ImportCard, ImportRequest};
use serde::Serialize;
use tracing::{info, warn};

use crate::client::ApiClient;

/// Totals over all import batches
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ImportSummary {
    pub deck_id: Option<String>,
    pub deck_name: String,
    pub notes_found: usize,
    pub imported_cards: usize,
    pub skipped_cards: usize,
    pub failed_cards: usize,
    pub errors: Vec<String>,
}

/// Turns an Anki note into an import card; notes without a question are dropped
pub fn note_to_card(note: &NoteInfo) -> Option<ImportCard> {
    let fields = note.field_values();
    let pick = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| fields.get(*key))
            .find(|value| !value.trim().is_empty())
            .cloned()
    };

    let front = pick(&["Front", "Text"])?;
    let cloze = pick(&["Front"]).is_none();
    Some(ImportCard {
        front,
        back: pick(&["Back", "Extra"]).unwrap_or_default(),
        tags: note.tags.clone(),
        anki_note_id: Some(note.note_id),
        note_type: cloze.then(|| "Cloze".to_string()),
    })
}

/// Imports every note of `anki_deck` into the backend deck `target_deck`
pub async fn import_deck(
    api: &ApiClient,
    anki: &AnkiClient,
    anki_deck: &str,
    target_deck: &str,
    batch_size: usize,
    mark_as_synced: bool,
) -> anyhow::Result<ImportSummary> {
    let note_ids = anki.find_notes(&format!("deck:\"{anki_deck}\"")).await?;
    info!("Found {} notes in Anki deck {}", note_ids.len(), anki_deck);

    let mut summary = ImportSummary {
        deck_name: target_deck.to_string(),
        notes_found: note_ids.len(),
        ..ImportSummary::default()
    };

    for chunk in note_ids.chunks(batch_size.max(1)) {
        let notes = anki.notes_info(chunk).await?;
        let cards: Vec<ImportCard> = notes.iter().filter_map(note_to_card).collect();
        summary.skipped_cards += chunk.len() - cards.len();
        if cards.is_empty() {
            continue;
        }

        let request = ImportRequest {
            deck_id: summary.deck_id.clone(),
            deck_name: Some(target_deck.to_string()),
            cards,
            mark_as_synced,
        };
        match api.import_cards(&request).await {
            Ok(result) => {
                summary.deck_id = Some(result.deck_id);
                summary.deck_name = result.deck_name;
                summary.imported_cards += result.imported_cards;
                summary.skipped_cards += result.skipped_cards;
                summary.failed_cards += result.failed_cards;
                summary.errors.extend(result.errors);
            }
            Err(err) => {
                warn!("Import batch failed: {}", err);
                summary.failed_cards += request.cards.len();
                summary.errors.push(err.to_string());
            }
        }
    }

    Ok(summary)
}
