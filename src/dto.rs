use serde::{Deserialize, Serialize};

use crate::errors::ApiError;
use crate::models::{CardStatus, PromptCategory};
use crate::rag::{DEFAULT_THRESHOLD, DUPLICATE_THRESHOLD, DuplicateCandidate, SearchQuery, SearchType};
use crate::services::cards::{AgentCardReport, CardQuery, CardUpdate, NewCard};
use crate::services::sync::CardToPush;

/// Most results a search may ask for
pub const MAX_SEARCH_RESULTS: usize = 50;

fn default_limit() -> i64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_k() -> usize {
    5
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_duplicate_threshold() -> f64 {
    DUPLICATE_THRESHOLD
}

fn default_history_limit() -> i64 {
    50
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Deserialize, Debug)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Body of `/auth/refresh` and `/auth/logout`
#[derive(Deserialize, Debug)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct UpdateMeRequest {
    pub display_name: Option<String>,
    pub email: Option<String>,
}

/// Offset pagination shared by list endpoints
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self { offset: 0, limit: default_limit() }
    }
}

#[derive(Deserialize, Debug)]
pub struct CreateDeckRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct DeckListQuery {
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

/// Filters of `GET /cards`
///
/// `tags` may repeat in the query string: `?tags=rust&tags=memory`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct CardListQuery {
    #[serde(default)]
    pub deck_id: Option<String>,
    #[serde(default)]
    pub status: Option<CardStatus>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl CardListQuery {
    pub fn filters(&self) -> CardQuery {
        CardQuery {
            deck_id: self.deck_id.clone(),
            status: self.status,
            tags: self.tags.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct DeleteQuery {
    #[serde(default)]
    pub hard: bool,
}

#[derive(Deserialize, Debug)]
pub struct BulkCreateRequest {
    pub cards: Vec<NewCard>,
}

#[derive(Deserialize, Debug)]
pub struct BulkIdsRequest {
    pub card_ids: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub struct BulkRejectRequest {
    pub card_ids: Vec<String>,
    pub reason: String,
}

#[derive(Deserialize, Debug)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Deserialize, Debug)]
pub struct MarkSyncedRequest {
    #[serde(default)]
    pub anki_card_id: Option<i64>,
    pub anki_note_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct SyncFailedRequest {
    pub error: String,
}

/// Body of `PATCH /cards/{id}`
///
/// The agent reports sync outcomes through the same route a client uses to
/// edit a card. A body carrying `anki_note_id`, or the status `error`, is a
/// sync report; anything else is an edit.
#[derive(Debug)]
pub enum CardPatch {
    SyncReport(AgentCardReport),
    Edit(CardUpdate),
}

impl CardPatch {
    pub fn from_value(body: serde_json::Value) -> Result<Self, ApiError> {
        let is_report = body.get("anki_note_id").is_some_and(|v| !v.is_null())
            || body.get("status").and_then(|v| v.as_str()) == Some("error");

        let parsed = if is_report {
            serde_json::from_value(body).map(CardPatch::SyncReport)
        } else {
            serde_json::from_value(body).map(CardPatch::Edit)
        };
        parsed.map_err(|e| ApiError::Validation(e.to_string()))
    }
}

#[derive(Deserialize, Debug)]
pub struct TemplateListQuery {
    #[serde(default = "default_true")]
    pub include_system: bool,
}

#[derive(Deserialize, Debug)]
pub struct PromptListQuery {
    #[serde(default)]
    pub category: Option<PromptCategory>,
    #[serde(default = "default_true")]
    pub active_only: bool,
}

#[derive(Deserialize, Debug)]
pub struct RenderRequest {
    #[serde(default = "empty_object")]
    pub variables: serde_json::Value,
}

#[derive(Deserialize, Debug)]
pub struct ModelListQuery {
    #[serde(default = "default_true")]
    pub active_only: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub search_type: SearchType,
    #[serde(default)]
    pub deck_ids: Option<Vec<String>>,
    #[serde(default)]
    pub statuses: Option<Vec<CardStatus>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl SearchRequest {
    /// Validates the request and turns it into a search
    pub fn into_query(self) -> Result<SearchQuery, ApiError> {
        let query = self.query.trim().to_string();
        if query.is_empty() || query.chars().count() > 1000 {
            return Err(ApiError::Validation("query must be 1-1000 characters".into()));
        }
        if !(1..=MAX_SEARCH_RESULTS).contains(&self.k) {
            return Err(ApiError::Validation(format!("k must be between 1 and {MAX_SEARCH_RESULTS}")));
        }
        check_threshold(self.threshold)?;

        Ok(SearchQuery {
            query,
            k: self.k,
            threshold: self.threshold,
            search_type: self.search_type,
            deck_ids: self.deck_ids,
            statuses: self.statuses,
            tags: self.tags,
        })
    }
}

pub fn check_threshold(threshold: f64) -> Result<(), ApiError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ApiError::Validation("threshold must be between 0 and 1".into()));
    }
    Ok(())
}

#[derive(Deserialize, Debug)]
pub struct IndexRequest {
    pub card_ids: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Deserialize, Debug, Default)]
pub struct ReindexRequest {
    #[serde(default)]
    pub deck_id: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct DuplicateCheckRequest {
    pub cards: Vec<DuplicateCandidate>,
    #[serde(default = "default_duplicate_threshold")]
    pub threshold: f64,
}

#[derive(Deserialize, Debug)]
pub struct SimilarQuery {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

#[derive(Deserialize, Debug)]
pub struct JobListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

/// Where a reconnecting SSE client picks up
#[derive(Deserialize, Debug, Default)]
pub struct StreamQuery {
    /// Index of the last card the client received
    #[serde(default)]
    pub resume_from: Option<usize>,
    /// A `resume_token` taken from an earlier event
    #[serde(default)]
    pub resume_token: Option<String>,
}

impl StreamQuery {
    /// The last received card index, from `resume_from` or a token for `job_id`
    pub fn last_index(&self, job_id: &str) -> Option<usize> {
        self.resume_from
            .or_else(|| self.resume_token.as_deref().and_then(|token| parse_resume_token(token, job_id)))
    }
}

/// Extracts the card index from `"{job_id}:{index}"`
///
/// Tokens of another job and the `-1` start token yield `None`.
pub fn parse_resume_token(token: &str, job_id: &str) -> Option<usize> {
    let (token_job, index) = token.rsplit_once(':')?;
    if token_job != job_id {
        return None;
    }
    index.parse().ok()
}

#[derive(Deserialize, Debug, Default)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug, Default)]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "crate::services::nullable")]
    pub context: Option<Option<serde_json::Value>>,
}

#[derive(Deserialize, Debug)]
pub struct SyncPushRequest {
    pub cards: Vec<CardToPush>,
}

#[derive(Deserialize, Debug)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}


#[cfg(test)]
mod prop_tests;
