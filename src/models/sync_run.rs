use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JsonValue, StringList};

sql_text_enum! {
    /// State of a whole sync run
    pub enum SyncState {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
}

sql_text_enum! {
    /// State of a single card inside a sync run
    pub enum CardSyncState {
        Pending => "pending",
        Synced => "synced",
        Failed => "failed",
        Conflict => "conflict",
    }
}

sql_text_enum! {
    /// Who drove the sync run
    pub enum SyncSource {
        /// Pushed by the server to AnkiConnect
        Server => "server",
        /// Reported by the local agent
        Agent => "agent",
    }
}

/// Per-card outcome stored in `SyncRun::card_states`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardSyncStatus {
    pub card_id: String,
    pub state: CardSyncState,
    pub anki_note_id: Option<i64>,
    pub error_message: Option<String>,
    pub synced_at: Option<NaiveDateTime>,
}

/// A batch of cards pushed to Anki and the outcome per card
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::sync_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncRun {
    pub id: String,
    pub user_id: String,
    pub source: SyncSource,
    pub state: SyncState,
    pub total_cards: i32,
    pub synced_cards: i32,
    pub failed_cards: i32,
    pub skipped_cards: i32,
    /// Cards queued by a push, as sent by the client
    pub cards: JsonValue,
    /// Map of card id to `CardSyncStatus`
    pub card_states: JsonValue,
    pub errors: StringList,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
}

impl SyncRun {
    pub fn new(user_id: String, source: SyncSource, cards: serde_json::Value, total_cards: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            source,
            state: SyncState::Pending,
            total_cards,
            synced_cards: 0,
            failed_cards: 0,
            skipped_cards: 0,
            cards: JsonValue(cards),
            card_states: JsonValue::empty_object(),
            errors: StringList::default(),
            created_at: Utc::now().naive_utc(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Cards still waiting to be processed
    pub fn pending_cards(&self) -> i32 {
        (self.total_cards - self.synced_cards - self.failed_cards - self.skipped_cards).max(0)
    }

    /// Parses the stored per-card states, skipping malformed entries
    pub fn card_statuses(&self) -> Vec<CardSyncStatus> {
        self.card_states
            .0
            .as_object()
            .map(|map| {
                map.values()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_cards() {
        let mut run = SyncRun::new("u1".into(), SyncSource::Server, serde_json::json!([]), 5);
        assert_eq!(run.pending_cards(), 5);
        run.synced_cards = 2;
        run.failed_cards = 1;
        assert_eq!(run.pending_cards(), 2);
    }

    #[test]
    fn test_card_statuses_parse() {
        let mut run = SyncRun::new("u1".into(), SyncSource::Agent, serde_json::json!([]), 1);
        run.card_states = JsonValue(serde_json::json!({
            "c1": {"card_id": "c1", "state": "synced", "anki_note_id": 7, "error_message": null, "synced_at": null},
            "broken": {"nope": true}
        }));
        let statuses = run.card_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, CardSyncState::Synced);
        assert_eq!(statuses[0].anki_note_id, Some(7));
    }
}
