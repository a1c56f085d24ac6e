use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JsonValue, StringList};

sql_text_enum! {
    /// Review and sync state of a card
    pub enum CardStatus {
        /// New, waiting for review
        Draft => "draft",
        /// Reviewed and ready to sync
        Approved => "approved",
        /// Reviewed and discarded
        Rejected => "rejected",
        /// Present in the Anki collection
        Synced => "synced",
        /// Last push to Anki failed
        SyncFailed => "sync_failed",
    }
}

impl CardStatus {
    /// States reachable from `self` in one step
    pub fn allowed_transitions(&self) -> &'static [CardStatus] {
        use CardStatus::*;
        match self {
            Draft => &[Approved, Rejected],
            Approved => &[Synced, SyncFailed, Draft],
            Rejected => &[Draft],
            SyncFailed => &[Approved, Synced, Draft],
            Synced => &[],
        }
    }

    /// Whether moving from `self` to `to` is legal
    ///
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(&self, to: CardStatus) -> bool {
        *self == to || self.allowed_transitions().contains(&to)
    }
}

/// Represents a flashcard
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::cards)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Card {
    /// Unique identifier for the card (UUID v4 as string)
    id: String,

    /// The deck this card belongs to
    deck_id: String,

    /// The template describing the card's fields
    template_id: String,

    /// Field values keyed by template field name
    fields: JsonValue,

    status: CardStatus,

    tags: StringList,

    anki_card_id: Option<i64>,
    anki_note_id: Option<i64>,

    /// Reason given when the card was rejected
    rejection_reason: Option<String>,

    /// Last sync error reported for the card
    sync_error: Option<String>,

    /// Number of failed sync attempts
    sync_attempts: i32,

    /// User that created the card
    created_by: Option<String>,

    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,

    /// Soft-delete marker
    deleted_at: Option<NaiveDateTime>,
}

impl Card {
    /// Creates a new draft card
    ///
    /// ### Arguments
    ///
    /// * `deck_id` - The deck the card goes into
    /// * `template_id` - The card template
    /// * `fields` - Field values as a JSON object
    /// * `tags` - Tags to attach
    /// * `created_by` - The creating user, if known
    pub fn new(
        deck_id: String,
        template_id: String,
        fields: serde_json::Value,
        tags: Vec<String>,
        created_by: Option<String>,
    ) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            deck_id,
            template_id,
            fields: JsonValue(fields),
            status: CardStatus::Draft,
            tags: StringList(tags),
            anki_card_id: None,
            anki_note_id: None,
            rejection_reason: None,
            sync_error: None,
            sync_attempts: 0,
            created_by,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Overrides the initial status, used by imports of already synced cards
    pub fn with_status(mut self, status: CardStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the Anki note id, used by imports
    pub fn with_anki_note_id(mut self, anki_note_id: Option<i64>) -> Self {
        self.anki_note_id = anki_note_id;
        self
    }

    pub fn get_id(&self) -> String {
        self.id.clone()
    }

    pub fn get_deck_id(&self) -> String {
        self.deck_id.clone()
    }

    pub fn get_template_id(&self) -> String {
        self.template_id.clone()
    }

    pub fn get_fields(&self) -> &serde_json::Value {
        &self.fields.0
    }

    pub fn get_status(&self) -> CardStatus {
        self.status
    }

    pub fn get_tags(&self) -> &[String] {
        &self.tags.0
    }

    pub fn get_tag_list(&self) -> &StringList {
        &self.tags
    }

    pub fn get_anki_card_id(&self) -> Option<i64> {
        self.anki_card_id
    }

    pub fn get_anki_note_id(&self) -> Option<i64> {
        self.anki_note_id
    }

    pub fn get_rejection_reason(&self) -> Option<String> {
        self.rejection_reason.clone()
    }

    pub fn get_sync_error(&self) -> Option<String> {
        self.sync_error.clone()
    }

    pub fn get_sync_attempts(&self) -> i32 {
        self.sync_attempts
    }

    pub fn get_created_by(&self) -> Option<String> {
        self.created_by.clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn get_created_at(&self) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(self.created_at, Utc)
    }

    pub fn get_updated_at(&self) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(self.updated_at, Utc)
    }

    /// Question side: `Front`/`front`, or the cloze `Text` field
    pub fn front(&self) -> String {
        field_text(&self.fields.0, &["Front", "front", "Text", "text"])
    }

    /// Answer side: `Back`/`back`, or the cloze `Extra` field
    pub fn back(&self) -> String {
        field_text(&self.fields.0, &["Back", "back", "Extra", "extra"])
    }
}

/// Returns the first non-empty string among `keys` in a JSON object
pub fn field_text(fields: &serde_json::Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| fields.get(*key).and_then(|v| v.as_str()))
        .find(|value| !value.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Provenance of a generated card
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::card_generation_info)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CardGenerationInfo {
    pub card_id: String,
    pub job_id: Option<String>,
    pub model_name: Option<String>,
    /// The topic the user asked for
    pub user_request: String,
    pub fact_check_result: Option<JsonValue>,
    pub fact_check_confidence: Option<f64>,
    pub created_at: NaiveDateTime,
}
