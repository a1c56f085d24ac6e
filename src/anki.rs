//! AnkiConnect client.
//!
//! AnkiConnect exposes the Anki desktop collection as a single POST endpoint
//! taking `{action, version, params}` and answering `{result, error}`.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument};

const API_VERSION: u8 = 6;

#[derive(Debug, Error)]
pub enum AnkiError {
    #[error("cannot reach AnkiConnect: {0}")]
    Unavailable(String),
    #[error("AnkiConnect action failed: {0}")]
    Action(String),
    #[error("unexpected AnkiConnect response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    result: Option<serde_json::Value>,
    error: Option<String>,
}

/// A field value as reported by `notesInfo`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteField {
    pub value: String,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteInfo {
    pub note_id: i64,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fields: HashMap<String, NoteField>,
    #[serde(default)]
    pub cards: Vec<i64>,
}

impl NoteInfo {
    /// Field values by name, without ordering metadata
    pub fn field_values(&self) -> HashMap<String, String> {
        self.fields
            .iter()
            .map(|(name, field)| (name.clone(), field.value.clone()))
            .collect()
    }
}

/// A note to add
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewNote {
    pub deck_name: String,
    pub model_name: String,
    pub fields: HashMap<String, String>,
    pub tags: Vec<String>,
}

/// Client for one AnkiConnect endpoint
#[derive(Clone, Debug)]
pub struct AnkiClient {
    http: reqwest::Client,
    url: String,
}

impl AnkiClient {
    pub fn new(url: &str) -> Result<Self, AnkiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AnkiError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends one action and decodes its result
    async fn invoke<T: DeserializeOwned>(
        &self,
        action: &str,
        params: Option<serde_json::Value>,
    ) -> Result<T, AnkiError> {
        let mut payload = json!({ "action": action, "version": API_VERSION });
        if let Some(params) = params {
            payload["params"] = params;
        }

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnkiError::Unavailable("request timed out".to_string())
                } else {
                    AnkiError::Unavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(AnkiError::InvalidResponse(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| AnkiError::InvalidResponse(e.to_string()))?;
        if let Some(error) = envelope.error {
            return Err(AnkiError::Action(error));
        }

        debug!("AnkiConnect {} ok", action);
        serde_json::from_value(envelope.result.unwrap_or(serde_json::Value::Null))
            .map_err(|e| AnkiError::InvalidResponse(format!("{action}: {e}")))
    }

    pub async fn version(&self) -> Result<u32, AnkiError> {
        self.invoke("version", None).await
    }

    /// Whether AnkiConnect answers at all
    pub async fn is_available(&self) -> bool {
        self.version().await.is_ok()
    }

    pub async fn deck_names(&self) -> Result<Vec<String>, AnkiError> {
        self.invoke("deckNames", None).await
    }

    /// Creates a deck, returning its id; existing decks are left as they are
    pub async fn create_deck(&self, name: &str) -> Result<i64, AnkiError> {
        self.invoke("createDeck", Some(json!({ "deck": name }))).await
    }

    pub async fn notes_info(&self, note_ids: &[i64]) -> Result<Vec<NoteInfo>, AnkiError> {
        // notesInfo answers `{}` for ids that no longer exist
        let raw: Vec<serde_json::Value> = self
            .invoke("notesInfo", Some(json!({ "notes": note_ids })))
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|note| serde_json::from_value(note).ok())
            .collect())
    }

    /// Adds a note, refusing duplicates
    #[instrument(skip(self, note), fields(deck = %note.deck_name))]
    pub async fn add_note(&self, note: &NewNote) -> Result<i64, AnkiError> {
        let params = json!({
            "note": {
                "deckName": note.deck_name,
                "modelName": note.model_name,
                "fields": note.fields,
                "tags": note.tags,
                "options": { "allowDuplicate": false },
            }
        });
        self.invoke("addNote", Some(params)).await
    }

    pub async fn update_note_fields(
        &self,
        note_id: i64,
        fields: &HashMap<String, String>,
    ) -> Result<(), AnkiError> {
        let params = json!({ "note": { "id": note_id, "fields": fields } });
        let _: serde_json::Value = self.invoke("updateNoteFields", Some(params)).await?;
        Ok(())
    }

    pub async fn find_notes(&self, query: &str) -> Result<Vec<i64>, AnkiError> {
        self.invoke("findNotes", Some(json!({ "query": query }))).await
    }

    pub async fn find_cards(&self, query: &str) -> Result<Vec<i64>, AnkiError> {
        self.invoke("findCards", Some(json!({ "query": query }))).await
    }

    /// Asks Anki to sync the collection with AnkiWeb
    pub async fn sync(&self) -> Result<(), AnkiError> {
        let _: serde_json::Value = self.invoke("sync", None).await?;
        Ok(())
    }
}
