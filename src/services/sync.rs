//! Sync runs between the server and the Anki collection.
//!
//! A run is created by `push` and executed against AnkiConnect by `execute`.
//! Every card is pushed on its own: a failing card is recorded as failed and
//! the run moves on, nothing already added to Anki is rolled back. The local
//! agent drives its own sync and only reports the outcome through `complete`.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{cards, decks};
use crate::anki::{AnkiClient, NewNote};
use crate::apkg::Package;
use crate::db::DbPool;
use crate::errors::ApiError;
use crate::models::{
    BASIC_TEMPLATE_ID, CLOZE_TEMPLATE_ID, Card, CardStatus, CardSyncState, CardSyncStatus, Deck, JsonValue,
    StringList, SyncRun, SyncSource, SyncState,
};
use crate::repo;

/// Most cards a single push or import accepts
pub const MAX_SYNC_CARDS: usize = 1000;
/// Errors kept on an agent report
pub const MAX_REPORTED_ERRORS: usize = 10;
/// Deck used for imports that name no deck
pub const DEFAULT_IMPORT_DECK: &str = "Imported from Anki";

/// Most notes a single package upload accepts
pub const MAX_PACKAGE_NOTES: usize = 20_000;
/// Notes imported between two progress updates
pub const IMPORT_PROGRESS_STEP: usize = 100;

const STATUS_SCAN_LIMIT: i64 = 1000;

fn basic_note_type() -> String {
    "Basic".to_string()
}

/// A card queued for Anki, as sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardToPush {
    pub card_id: String,
    pub front: String,
    pub back: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub deck_name: String,
    #[serde(default = "basic_note_type")]
    pub note_type: String,
    /// Extra note fields, merged over the front/back mapping
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl CardToPush {
    /// Note fields for the card's note type
    pub fn note_fields(&self) -> HashMap<String, String> {
        let (question, answer) = if self.note_type.eq_ignore_ascii_case("cloze") {
            ("Text", "Extra")
        } else {
            ("Front", "Back")
        };
        let mut fields = HashMap::from([
            (question.to_string(), self.front.clone()),
            (answer.to_string(), self.back.clone()),
        ]);
        fields.extend(self.fields.clone());
        fields
    }

    fn to_note(&self) -> NewNote {
        NewNote {
            deck_name: self.deck_name.clone(),
            model_name: self.note_type.clone(),
            fields: self.note_fields(),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PushReceipt {
    pub sync_id: String,
    pub queued_count: usize,
    /// Rough number of seconds until the run is done
    pub estimated_time: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub sync_id: String,
    pub state: SyncState,
    pub total_cards: i32,
    pub synced_cards: i32,
    pub failed_cards: i32,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub sync_id: Option<String>,
    #[serde(default)]
    pub card_ids: Option<Vec<String>>,
    #[serde(default)]
    pub include_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullResponse {
    pub sync_id: Option<String>,
    pub cards: Vec<CardSyncStatus>,
    pub total: usize,
    pub synced: usize,
    pub pending: usize,
    pub failed: usize,
}

/// Aggregate over all runs of a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOverview {
    pub state: SyncState,
    pub total_cards: i32,
    pub synced_cards: i32,
    pub pending_cards: i32,
    pub failed_cards: i32,
    pub last_sync: Option<NaiveDateTime>,
    pub anki_connected: bool,
}

/// Outcome of a sync the agent ran on its own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub cards_synced: i32,
    pub cards_failed: i32,
    #[serde(default)]
    pub cards_skipped: i32,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportCard {
    pub front: String,
    pub back: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub anki_note_id: Option<i64>,
    /// Anki note type; cloze notes keep their text and extra fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_type: Option<String>,
}

impl ImportCard {
    pub fn is_cloze(&self) -> bool {
        self.note_type.as_deref().is_some_and(|t| t.eq_ignore_ascii_case("cloze"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    #[serde(default)]
    pub deck_id: Option<String>,
    #[serde(default)]
    pub deck_name: Option<String>,
    pub cards: Vec<ImportCard>,
    #[serde(default)]
    pub mark_as_synced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub deck_id: String,
    pub deck_name: String,
    pub total_cards: usize,
    pub imported_cards: usize,
    pub skipped_cards: usize,
    pub failed_cards: usize,
    pub card_ids: Vec<String>,
    /// Note types found in an imported package
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub note_types: Vec<String>,
    pub errors: Vec<String>,
}

fn owned_run(pool: &DbPool, user_id: &str, sync_id: &str) -> Result<SyncRun, ApiError> {
    // Runs of other users look missing
    repo::get_sync_run(pool, sync_id)?
        .filter(|run| run.user_id == user_id)
        .ok_or(ApiError::NotFound("Sync run"))
}

fn set_card_state(run: &mut SyncRun, status: CardSyncStatus) {
    if !run.card_states.0.is_object() {
        run.card_states = JsonValue::empty_object();
    }
    if let (Some(map), Ok(value)) = (run.card_states.0.as_object_mut(), serde_json::to_value(&status)) {
        map.insert(status.card_id.clone(), value);
    }
}

fn pending_status(card_id: &str) -> CardSyncStatus {
    CardSyncStatus {
        card_id: card_id.to_string(),
        state: CardSyncState::Pending,
        anki_note_id: None,
        error_message: None,
        synced_at: None,
    }
}

/// Queues cards for a server-side sync
#[instrument(skip(pool, cards), fields(count = cards.len()))]
pub fn push(pool: &DbPool, user_id: &str, cards: Vec<CardToPush>) -> Result<PushReceipt, ApiError> {
    if cards.is_empty() || cards.len() > MAX_SYNC_CARDS {
        return Err(ApiError::Validation(format!("between 1 and {MAX_SYNC_CARDS} cards can be pushed")));
    }

    let total = cards.len();
    let payload = serde_json::to_value(&cards).map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut run = SyncRun::new(user_id.to_string(), SyncSource::Server, payload, total as i32);
    for card in &cards {
        set_card_state(&mut run, pending_status(&card.card_id));
    }
    let run = repo::insert_sync_run(pool, run)?;

    info!("Queued sync run {} with {} cards", run.id, total);
    Ok(PushReceipt {
        sync_id: run.id,
        queued_count: total,
        estimated_time: (total as u64).div_ceil(2) + 5,
    })
}

/// Pushes every card of a pending run to Anki
///
/// Cards that exist on the server and belong to the user follow the outcome:
/// they become `synced` with the new note id or `sync_failed` with the error.
#[instrument(skip(pool, anki))]
pub async fn execute(pool: &DbPool, anki: &AnkiClient, user_id: &str, sync_id: &str) -> Result<SyncResult, ApiError> {
    let mut run = owned_run(pool, user_id, sync_id)?;
    if run.state != SyncState::Pending {
        return Err(ApiError::Conflict(format!("sync run is already {}", run.state)));
    }
    anki.version().await?;

    let queued: Vec<CardToPush> =
        serde_json::from_value(run.cards.0.clone()).map_err(|e| ApiError::Internal(format!("stored sync cards: {e}")))?;

    let started = Instant::now();
    let started_at = Utc::now().naive_utc();
    if !repo::claim_sync_run(pool, &run.id, started_at)? {
        return Err(ApiError::Conflict("sync run is already in progress".to_string()));
    }
    run.state = SyncState::InProgress;
    run.started_at = Some(started_at);

    let mut errors = Vec::new();
    for card in &queued {
        match anki.add_note(&card.to_note()).await {
            Ok(note_id) => {
                run.synced_cards += 1;
                set_card_state(
                    &mut run,
                    CardSyncStatus {
                        card_id: card.card_id.clone(),
                        state: CardSyncState::Synced,
                        anki_note_id: Some(note_id),
                        error_message: None,
                        synced_at: Some(Utc::now().naive_utc()),
                    },
                );
                if let Err(err) = cards::mark_synced(pool, user_id, &card.card_id, None, note_id) {
                    warn!("Card {} synced but not updated: {}", card.card_id, err);
                }
            }
            Err(err) => {
                let message = err.to_string();
                run.failed_cards += 1;
                set_card_state(
                    &mut run,
                    CardSyncStatus {
                        error_message: Some(message.clone()),
                        state: CardSyncState::Failed,
                        ..pending_status(&card.card_id)
                    },
                );
                if let Err(err) = cards::mark_sync_failed(pool, user_id, &card.card_id, &message) {
                    warn!("Card {} failure not recorded: {}", card.card_id, err);
                }
                errors.push(format!("Card {}: {}", card.card_id, message));
            }
        }
    }

    run.state = if run.failed_cards == 0 { SyncState::Completed } else { SyncState::Failed };
    run.completed_at = Some(Utc::now().naive_utc());
    run.errors = StringList(errors.clone());
    repo::save_sync_run(pool, &run)?;

    info!(
        "Sync run {} finished: {} synced, {} failed",
        run.id, run.synced_cards, run.failed_cards
    );
    Ok(SyncResult {
        sync_id: run.id,
        state: run.state,
        total_cards: run.total_cards,
        synced_cards: run.synced_cards,
        failed_cards: run.failed_cards,
        errors,
        duration_seconds: started.elapsed().as_secs_f64(),
    })
}

/// Per-card states of one run, or the latest state of the given cards
pub fn pull(pool: &DbPool, user_id: &str, request: PullRequest) -> Result<PullResponse, ApiError> {
    let statuses = match (&request.sync_id, &request.card_ids) {
        (Some(sync_id), _) => owned_run(pool, user_id, sync_id)?.card_statuses(),
        (None, Some(card_ids)) => {
            let wanted: HashSet<&str> = card_ids.iter().map(String::as_str).collect();
            let mut latest: HashMap<String, CardSyncStatus> = HashMap::new();
            // Newest run first, so the first state seen for a card wins
            for run in repo::list_sync_runs(pool, user_id, STATUS_SCAN_LIMIT)? {
                for status in run.card_statuses() {
                    if wanted.contains(status.card_id.as_str()) {
                        latest.entry(status.card_id.clone()).or_insert(status);
                    }
                }
            }
            card_ids.iter().filter_map(|id| latest.remove(id)).collect()
        }
        (None, None) => Vec::new(),
    };

    let cards: Vec<CardSyncStatus> = statuses
        .into_iter()
        .filter(|status| request.include_failed || status.state != CardSyncState::Failed)
        .collect();
    let count = |state: CardSyncState| cards.iter().filter(|s| s.state == state).count();

    Ok(PullResponse {
        sync_id: request.sync_id,
        total: cards.len(),
        synced: count(CardSyncState::Synced),
        pending: count(CardSyncState::Pending),
        failed: count(CardSyncState::Failed),
        cards,
    })
}

/// Totals over the user's runs and whether Anki answers
pub async fn status(pool: &DbPool, anki: &AnkiClient, user_id: &str) -> Result<SyncOverview, ApiError> {
    let runs = repo::list_sync_runs(pool, user_id, STATUS_SCAN_LIMIT)?;

    let mut overview = SyncOverview {
        state: SyncState::Completed,
        total_cards: 0,
        synced_cards: 0,
        pending_cards: 0,
        failed_cards: 0,
        last_sync: None,
        anki_connected: false,
    };
    for run in &runs {
        overview.total_cards += run.total_cards;
        overview.synced_cards += run.synced_cards;
        overview.failed_cards += run.failed_cards;
        if matches!(run.state, SyncState::Pending | SyncState::InProgress) {
            overview.pending_cards += run.pending_cards();
        }

        match run.state {
            SyncState::InProgress => overview.state = SyncState::InProgress,
            SyncState::Pending if overview.state != SyncState::InProgress => overview.state = SyncState::Pending,
            _ => {}
        }
        if run.completed_at.is_some_and(|at| overview.last_sync.is_none_or(|last| at > last)) {
            overview.last_sync = run.completed_at;
        }
    }
    overview.anki_connected = anki.is_available().await;

    Ok(overview)
}

/// Records a sync the agent performed as a finished run
#[instrument(skip(pool, report))]
pub fn complete(pool: &DbPool, user_id: &str, report: AgentReport) -> Result<SyncRun, ApiError> {
    if report.cards_synced < 0 || report.cards_failed < 0 || report.cards_skipped < 0 {
        return Err(ApiError::Validation("card counts must not be negative".into()));
    }

    let total = report.cards_synced + report.cards_failed + report.cards_skipped;
    let finished = report.completed_at.unwrap_or_else(|| Utc::now().naive_utc());

    let mut run = SyncRun::new(user_id.to_string(), SyncSource::Agent, serde_json::json!([]), total);
    run.state = if report.cards_failed == 0 { SyncState::Completed } else { SyncState::Failed };
    run.synced_cards = report.cards_synced;
    run.failed_cards = report.cards_failed;
    run.skipped_cards = report.cards_skipped;
    run.errors = StringList(report.errors.into_iter().take(MAX_REPORTED_ERRORS).collect());
    run.started_at = Some(finished);
    run.completed_at = Some(finished);

    let run = repo::insert_sync_run(pool, run)?;
    info!(
        "Agent sync reported: {} synced, {} failed, {} skipped",
        run.synced_cards, run.failed_cards, run.skipped_cards
    );
    Ok(run)
}

/// The user's runs, newest first
pub fn history(pool: &DbPool, user_id: &str, limit: i64) -> Result<Vec<SyncRun>, ApiError> {
    if !(1..=super::MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::Validation(format!("limit must be between 1 and {}", super::MAX_PAGE_SIZE)));
    }
    Ok(repo::list_sync_runs(pool, user_id, limit)?)
}

fn import_deck(pool: &DbPool, user_id: &str, deck_id: Option<&str>, deck_name: Option<&str>) -> Result<Deck, ApiError> {
    if let Some(deck_id) = deck_id {
        return decks::owned_deck(pool, user_id, deck_id);
    }
    let name = deck_name.unwrap_or(DEFAULT_IMPORT_DECK).trim();
    match repo::find_deck_by_name(pool, user_id, name)? {
        Some(deck) => Ok(deck),
        None => {
            info!("Creating deck {} for import", name);
            decks::create(pool, user_id, name, Some(format!("Imported from Anki: {name}")), None)
        }
    }
}

/// Writes imported notes into one deck, tallying the outcome on `result`
struct Importer<'a> {
    pool: &'a DbPool,
    user_id: &'a str,
    deck_id: String,
    status: CardStatus,
    seen: HashSet<i64>,
}

impl<'a> Importer<'a> {
    fn new(pool: &'a DbPool, user_id: &'a str, deck: &Deck, note_ids: &[i64], mark_as_synced: bool) -> Result<Self, ApiError> {
        let deck_id = deck.get_id();
        let seen = repo::existing_anki_note_ids(pool, &deck_id, note_ids)?.into_iter().collect();
        Ok(Self {
            pool,
            user_id,
            deck_id,
            status: if mark_as_synced { CardStatus::Synced } else { CardStatus::Approved },
            seen,
        })
    }

    fn import(&mut self, index: usize, imported: ImportCard, result: &mut ImportResult) -> Result<(), ApiError> {
        if let Some(note_id) = imported.anki_note_id {
            if !self.seen.insert(note_id) {
                result.skipped_cards += 1;
                return Ok(());
            }
        }
        if imported.front.trim().is_empty() {
            result.failed_cards += 1;
            result.errors.push(format!("Card {index}: front is empty"));
            return Ok(());
        }

        let (template_id, fields) = if imported.is_cloze() {
            (CLOZE_TEMPLATE_ID, serde_json::json!({ "Text": imported.front, "Extra": imported.back }))
        } else {
            (BASIC_TEMPLATE_ID, serde_json::json!({ "Front": imported.front, "Back": imported.back }))
        };
        let card = Card::new(
            self.deck_id.clone(),
            template_id.to_string(),
            fields,
            imported.tags,
            Some(self.user_id.to_string()),
        )
        .with_status(self.status)
        .with_anki_note_id(imported.anki_note_id);

        let card = repo::insert_card(self.pool, card)?;
        result.imported_cards += 1;
        result.card_ids.push(card.get_id());
        Ok(())
    }
}

fn empty_result(deck: &Deck, total_cards: usize) -> ImportResult {
    ImportResult {
        deck_id: deck.get_id(),
        deck_name: deck.get_name(),
        total_cards,
        imported_cards: 0,
        skipped_cards: 0,
        failed_cards: 0,
        card_ids: Vec::new(),
        note_types: Vec::new(),
        errors: Vec::new(),
    }
}

/// Stores notes read from Anki as cards of a server deck
///
/// The deck is looked up by id, or by name and created when missing. Notes
/// already imported into that deck (same Anki note id) are skipped.
#[instrument(skip(pool, request), fields(count = request.cards.len()))]
pub fn import_cards(pool: &DbPool, user_id: &str, request: ImportRequest) -> Result<ImportResult, ApiError> {
    if request.cards.len() > MAX_SYNC_CARDS {
        return Err(ApiError::Validation(format!("at most {MAX_SYNC_CARDS} cards can be imported")));
    }

    let deck = import_deck(pool, user_id, request.deck_id.as_deref(), request.deck_name.as_deref())?;
    let note_ids: Vec<i64> = request.cards.iter().filter_map(|c| c.anki_note_id).collect();
    let mut importer = Importer::new(pool, user_id, &deck, &note_ids, request.mark_as_synced)?;
    let mut result = empty_result(&deck, request.cards.len());

    for (index, imported) in request.cards.into_iter().enumerate() {
        importer.import(index, imported, &mut result)?;
    }

    info!(
        "Imported {} cards into {} ({} skipped, {} failed)",
        result.imported_cards, result.deck_name, result.skipped_cards, result.failed_cards
    );
    Ok(result)
}

/// Where a package import is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStage {
    Parsing,
    Importing,
    Complete,
}

/// Progress of a package import, streamed to the client
#[derive(Debug, Clone, Serialize)]
pub struct ImportProgress {
    pub stage: ImportStage,
    /// Share of notes handled, between 0 and 1
    pub progress: f32,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

impl ImportProgress {
    pub fn new(stage: ImportStage, current: usize, total: usize, message: impl Into<String>) -> Self {
        let progress = match stage {
            ImportStage::Parsing => 0.0,
            ImportStage::Complete => 1.0,
            ImportStage::Importing if total == 0 => 1.0,
            ImportStage::Importing => current as f32 / total as f32,
        };
        Self { stage, progress, current, total, message: message.into() }
    }
}

/// Options of a package upload
#[derive(Debug, Clone, Default)]
pub struct PackageImportOptions {
    /// Existing deck to fill; the package's own deck name is used otherwise
    pub deck_id: Option<String>,
    /// Tags added to every imported card
    pub tags: Vec<String>,
    pub mark_as_synced: bool,
}

impl PackageImportOptions {
    /// Splits a comma-separated tag list, dropping blanks
    pub fn parse_tags(raw: &str) -> Vec<String> {
        raw.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).collect()
    }
}

/// Imports the notes of a parsed `.apkg` package
///
/// Notes go through the same path as agent imports: duplicates by Anki note
/// id are skipped and empty questions fail. `on_progress` is called after
/// every `IMPORT_PROGRESS_STEP` notes and once at the end.
///
/// ### Arguments
///
/// * `pool` - The database connection pool
/// * `user_id` - Owner of the target deck
/// * `package` - The parsed package
/// * `options` - Target deck, extra tags and whether cards count as synced
/// * `on_progress` - Receives progress updates
///
/// ### Returns
///
/// The import tally, including notes the reader had to drop
///
/// ### Errors
///
/// Returns `ApiError::Validation` for empty or oversized packages and
/// `ApiError::NotFound` when `deck_id` names a deck the user cannot see
#[instrument(skip(pool, package, options, on_progress), fields(notes = package.notes.len()))]
pub fn import_package(
    pool: &DbPool,
    user_id: &str,
    package: Package,
    options: PackageImportOptions,
    mut on_progress: impl FnMut(ImportProgress),
) -> Result<ImportResult, ApiError> {
    let total = package.notes.len();
    if total == 0 {
        return Err(ApiError::Validation("package contains no notes".to_string()));
    }
    if total > MAX_PACKAGE_NOTES {
        return Err(ApiError::Validation(format!("at most {MAX_PACKAGE_NOTES} notes can be imported")));
    }

    let deck = import_deck(pool, user_id, options.deck_id.as_deref(), Some(package.deck_name.as_str()))?;
    let note_ids: Vec<i64> = package.notes.iter().map(|n| n.note_id).collect();
    let mut importer = Importer::new(pool, user_id, &deck, &note_ids, options.mark_as_synced)?;
    let mut result = empty_result(&deck, total + package.skipped_notes);
    result.skipped_cards = package.skipped_notes;
    result.note_types = package.note_types;

    on_progress(ImportProgress::new(ImportStage::Importing, 0, total, format!("Importing {total} notes")));
    for (index, note) in package.notes.into_iter().enumerate() {
        let mut tags = note.tags;
        for tag in &options.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        let card = ImportCard {
            front: note.front,
            back: note.back,
            tags,
            anki_note_id: Some(note.note_id),
            note_type: Some(if note.cloze { "Cloze".to_string() } else { note.note_type }),
        };
        importer.import(index, card, &mut result)?;

        let current = index + 1;
        if current % IMPORT_PROGRESS_STEP == 0 && current < total {
            on_progress(ImportProgress::new(
                ImportStage::Importing,
                current,
                total,
                format!("Imported {current} of {total} notes"),
            ));
        }
    }

    on_progress(ImportProgress::new(
        ImportStage::Complete,
        total,
        total,
        format!("Imported {} cards into {}", result.imported_cards, result.deck_name),
    ));
    info!(
        "Imported package into {}: {} imported, {} skipped, {} failed",
        result.deck_name, result.imported_cards, result.skipped_cards, result.failed_cards
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_card, seed_deck, seed_user, setup_test_db};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn answer(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
        let reply = match body["action"].as_str().unwrap_or_default() {
            "version" => json!({ "result": 6, "error": null }),
            "addNote" => {
                let fields = &body["params"]["note"]["fields"];
                if fields["Front"] == "dup" {
                    json!({ "result": null, "error": "cannot create note because it is a duplicate" })
                } else if fields["Text"].is_string() {
                    json!({ "result": 2002, "error": null })
                } else {
                    json!({ "result": 1001, "error": null })
                }
            }
            _ => json!({ "result": null, "error": "unsupported action" }),
        };
        Json(reply)
    }

    async fn spawn_anki() -> AnkiClient {
        let app = Router::new().route("/", post(answer));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        AnkiClient::new(&format!("http://{addr}/")).unwrap()
    }

    fn to_push(card_id: &str, front: &str) -> CardToPush {
        CardToPush {
            card_id: card_id.to_string(),
            front: front.to_string(),
            back: "answer".to_string(),
            tags: vec!["AnkiRAG".into()],
            deck_name: "AnkiRAG".into(),
            note_type: basic_note_type(),
            fields: HashMap::new(),
        }
    }

    #[test]
    fn test_cloze_note_fields() {
        let mut card = to_push("c1", "The {{c1::borrow checker}} runs at compile time");
        card.note_type = "Cloze".into();
        let fields = card.note_fields();
        assert_eq!(fields["Text"], card.front);
        assert_eq!(fields["Extra"], "answer");
        assert!(!fields.contains_key("Front"));
    }

    #[test]
    fn test_push_validates_and_queues() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "push@example.com").get_id();

        assert!(matches!(push(&pool, &uid, vec![]), Err(ApiError::Validation(_))));

        let receipt = push(&pool, &uid, vec![to_push("a", "Q1"), to_push("b", "Q2")]).unwrap();
        assert_eq!(receipt.queued_count, 2);

        let pulled = pull(&pool, &uid, PullRequest { sync_id: Some(receipt.sync_id.clone()), ..Default::default() }).unwrap();
        assert_eq!(pulled.total, 2);
        assert_eq!(pulled.pending, 2);

        let other = seed_user(&pool, "other@example.com").get_id();
        let hidden = pull(&pool, &other, PullRequest { sync_id: Some(receipt.sync_id), ..Default::default() });
        assert!(matches!(hidden, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_execute_records_partial_failure() {
        let pool = setup_test_db();
        let anki = spawn_anki().await;
        let user = seed_user(&pool, "exec@example.com");
        let uid = user.get_id();
        let deck = seed_deck(&pool, &user, "Rust");
        let good = seed_card(&pool, &deck, "What is a lifetime?", "A scope");
        let bad = seed_card(&pool, &deck, "dup", "A duplicate");
        cards::approve(&pool, &uid, &good.get_id()).unwrap();
        cards::approve(&pool, &uid, &bad.get_id()).unwrap();

        let receipt = push(
            &pool,
            &uid,
            vec![to_push(&good.get_id(), "What is a lifetime?"), to_push(&bad.get_id(), "dup")],
        )
        .unwrap();
        let result = execute(&pool, &anki, &uid, &receipt.sync_id).await.unwrap();

        assert_eq!(result.state, SyncState::Failed);
        assert_eq!(result.synced_cards, 1);
        assert_eq!(result.failed_cards, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("duplicate"));

        let synced = cards::get(&pool, &uid, &good.get_id()).unwrap();
        assert_eq!(synced.get_status(), CardStatus::Synced);
        assert_eq!(synced.get_anki_note_id(), Some(1001));
        let failed = cards::get(&pool, &uid, &bad.get_id()).unwrap();
        assert_eq!(failed.get_status(), CardStatus::SyncFailed);
        assert_eq!(failed.get_sync_attempts(), 1);

        let again = execute(&pool, &anki, &uid, &receipt.sync_id).await;
        assert!(matches!(again, Err(ApiError::Conflict(_))));

        let without_failed = pull(&pool, &uid, PullRequest { sync_id: Some(receipt.sync_id.clone()), ..Default::default() }).unwrap();
        assert_eq!(without_failed.total, 1);
        let by_card = pull(
            &pool,
            &uid,
            PullRequest { card_ids: Some(vec![bad.get_id()]), include_failed: true, ..Default::default() },
        )
        .unwrap();
        assert_eq!(by_card.failed, 1);
        assert!(by_card.cards[0].error_message.as_deref().unwrap().contains("duplicate"));
    }

    #[tokio::test]
    async fn test_concurrent_execute_runs_once() {
        let pool = setup_test_db();
        let anki = spawn_anki().await;
        let uid = seed_user(&pool, "twice@example.com").get_id();
        let receipt = push(&pool, &uid, vec![to_push("a", "Q1"), to_push("b", "Q2")]).unwrap();

        let (first, second) = tokio::join!(
            execute(&pool, &anki, &uid, &receipt.sync_id),
            execute(&pool, &anki, &uid, &receipt.sync_id),
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(r, Err(ApiError::Conflict(_)))));

        let run = repo::get_sync_run(&pool, &receipt.sync_id).unwrap().unwrap();
        assert_eq!(run.synced_cards, 2);
    }

    #[tokio::test]
    async fn test_execute_needs_anki() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "offline@example.com").get_id();
        let receipt = push(&pool, &uid, vec![to_push("a", "Q")]).unwrap();

        let offline = AnkiClient::new("http://127.0.0.1:1").unwrap();
        let err = execute(&pool, &offline, &uid, &receipt.sync_id).await.unwrap_err();
        assert_eq!(err.code(), "SYNC_002");

        let run = repo::get_sync_run(&pool, &receipt.sync_id).unwrap().unwrap();
        assert_eq!(run.state, SyncState::Pending);

        let overview = status(&pool, &offline, &uid).await.unwrap();
        assert_eq!(overview.state, SyncState::Pending);
        assert_eq!(overview.pending_cards, 1);
        assert!(!overview.anki_connected);
    }

    #[tokio::test]
    async fn test_complete_and_history() {
        let pool = setup_test_db();
        let anki = spawn_anki().await;
        let uid = seed_user(&pool, "agent@example.com").get_id();

        let report: AgentReport = serde_json::from_value(json!({
            "cards_synced": 4,
            "cards_failed": 0,
            "cards_skipped": 1,
            "errors": []
        }))
        .unwrap();
        let run = complete(&pool, &uid, report).unwrap();
        assert_eq!(run.source, SyncSource::Agent);
        assert_eq!(run.state, SyncState::Completed);
        assert_eq!(run.total_cards, 5);

        let errors: Vec<String> = (0..15).map(|i| format!("error {i}")).collect();
        let failing = AgentReport { cards_synced: 0, cards_failed: 15, cards_skipped: 0, errors, completed_at: None };
        let run = complete(&pool, &uid, failing).unwrap();
        assert_eq!(run.state, SyncState::Failed);
        assert_eq!(run.errors.0.len(), MAX_REPORTED_ERRORS);

        assert_eq!(history(&pool, &uid, 10).unwrap().len(), 2);
        assert!(matches!(history(&pool, &uid, 0), Err(ApiError::Validation(_))));

        let overview = status(&pool, &anki, &uid).await.unwrap();
        assert_eq!(overview.state, SyncState::Completed);
        assert_eq!(overview.synced_cards, 4);
        assert_eq!(overview.failed_cards, 15);
        assert!(overview.last_sync.is_some());
        assert!(overview.anki_connected);
    }

    #[test]
    fn test_import_creates_deck_and_skips_known_notes() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "import@example.com").get_id();

        let request = |mark_as_synced| ImportRequest {
            deck_id: None,
            deck_name: Some("Spanish".into()),
            cards: vec![
                ImportCard { front: "hola".into(), back: "hello".into(), tags: vec![], anki_note_id: Some(11), note_type: None },
                ImportCard { front: "adiós".into(), back: "bye".into(), tags: vec![], anki_note_id: Some(12), note_type: None },
                ImportCard { front: " ".into(), back: "blank".into(), tags: vec![], anki_note_id: None, note_type: None },
            ],
            mark_as_synced,
        };

        let first = import_cards(&pool, &uid, request(true)).unwrap();
        assert_eq!(first.deck_name, "Spanish");
        assert_eq!(first.imported_cards, 2);
        assert_eq!(first.failed_cards, 1);
        let card = cards::get(&pool, &uid, &first.card_ids[0]).unwrap();
        assert_eq!(card.get_status(), CardStatus::Synced);
        assert_eq!(card.get_anki_note_id(), Some(11));

        let second = import_cards(&pool, &uid, request(false)).unwrap();
        assert_eq!(second.deck_id, first.deck_id);
        assert_eq!(second.imported_cards, 0);
        assert_eq!(second.skipped_cards, 2);
    }

    #[test]
    fn test_import_into_foreign_deck_is_denied() {
        let pool = setup_test_db();
        let owner = seed_user(&pool, "deckowner@example.com");
        let intruder = seed_user(&pool, "intruder@example.com").get_id();
        let deck = seed_deck(&pool, &owner, "Private");

        let request = ImportRequest {
            deck_id: Some(deck.get_id()),
            deck_name: None,
            cards: vec![],
            mark_as_synced: false,
        };
        let err = import_cards(&pool, &intruder, request).unwrap_err();
        assert_eq!(err.code(), "PERM_001");
    }

    fn package_note(note_id: i64, front: &str, cloze: bool) -> crate::apkg::PackageNote {
        crate::apkg::PackageNote {
            note_id,
            note_type: if cloze { "Cloze+".into() } else { "Basic".into() },
            cloze,
            front: front.to_string(),
            back: "extra".to_string(),
            tags: vec!["geo".into()],
        }
    }

    #[test]
    fn test_import_package_reports_progress() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "apkg@example.com").get_id();

        let mut notes: Vec<_> = (0..IMPORT_PROGRESS_STEP as i64 + 20).map(|i| package_note(i, &format!("Q{i}"), false)).collect();
        notes.push(package_note(9000, "{{c1::Paris}} is in France", true));
        notes.push(package_note(9001, "", false));
        let package = Package {
            deck_name: "Geography".into(),
            notes,
            note_types: vec!["Basic".into(), "Cloze+".into()],
            skipped_notes: 1,
            media_files: 0,
        };
        let options = PackageImportOptions {
            tags: PackageImportOptions::parse_tags("imported, geo, ,"),
            ..PackageImportOptions::default()
        };

        let mut updates = Vec::new();
        let result = import_package(&pool, &uid, package, options, |p| updates.push(p)).unwrap();

        assert_eq!(result.deck_name, "Geography");
        assert_eq!(result.total_cards, IMPORT_PROGRESS_STEP + 23);
        assert_eq!(result.imported_cards, IMPORT_PROGRESS_STEP + 21);
        assert_eq!(result.skipped_cards, 1);
        assert_eq!(result.failed_cards, 1);
        assert_eq!(result.note_types, vec!["Basic".to_string(), "Cloze+".to_string()]);

        let stages: Vec<ImportStage> = updates.iter().map(|p| p.stage).collect();
        assert_eq!(stages, vec![ImportStage::Importing, ImportStage::Importing, ImportStage::Complete]);
        assert_eq!(updates[1].current, IMPORT_PROGRESS_STEP);
        assert_eq!(updates[2].progress, 1.0);

        let first = cards::get(&pool, &uid, &result.card_ids[0]).unwrap();
        assert_eq!(first.get_tags(), ["geo".to_string(), "imported".to_string()]);
        assert_eq!(first.get_status(), CardStatus::Approved);
        let cloze = cards::get(&pool, &uid, result.card_ids.last().unwrap()).unwrap();
        assert_eq!(cloze.get_template_id(), CLOZE_TEMPLATE_ID);
        assert_eq!(cloze.get_fields()["Text"], "{{c1::Paris}} is in France");
    }

    #[test]
    fn test_empty_package_is_rejected() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "emptyapkg@example.com").get_id();

        let err = import_package(&pool, &uid, Package::default(), PackageImportOptions::default(), |_| {}).unwrap_err();
        assert_eq!(err.code(), "VAL_001");
    }
}
