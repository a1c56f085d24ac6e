//! Card generation jobs.
//!
//! A request is validated and stored as a `pending` job, then executed on the
//! task queue by the pipeline in `pipeline.rs`. Progress and produced cards
//! are published through `JobHub` so SSE subscribers can follow a job live.

mod hub;
mod pipeline;
mod prompt;
mod service;

pub use hub::{JobEvent, JobHub};
pub use pipeline::{Pipeline, PipelineError, StepProgress};
pub use prompt::{parse_cards, system_prompt, user_prompt};
pub use service::{GenerationService, GenerationTask, JobStatusView, StartOutcome};

use serde::{Deserialize, Serialize};

use crate::errors::ApiError;

/// Upper bound on cards per request
pub const MAX_CARDS_PER_GENERATION: u32 = 20;

/// Fact-check confidence under which a card is rejected
pub const MIN_CONFIDENCE: f64 = 0.3;

/// Name of the deck that receives cards when the request names none
pub const DEFAULT_DECK_NAME: &str = "AnkiRAG Generated";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    #[default]
    Basic,
    Cloze,
    BasicReversed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

fn default_num_cards() -> u32 {
    5
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

/// What the user asked to generate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(default)]
    pub deck_id: Option<String>,
    #[serde(default)]
    pub card_type: CardType,
    #[serde(default = "default_num_cards")]
    pub num_cards: u32,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub include_sources: bool,
    #[serde(default = "default_true")]
    pub fact_check: bool,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            deck_id: None,
            card_type: CardType::Basic,
            num_cards: default_num_cards(),
            difficulty: Difficulty::Medium,
            language: default_language(),
            include_sources: true,
            fact_check: true,
            context: None,
            model_id: None,
            tags: Vec::new(),
            idempotency_key: None,
        }
    }

    /// Checks field bounds, trimming the topic
    pub fn validate(mut self) -> Result<Self, ApiError> {
        self.topic = self.topic.trim().to_string();
        let topic_len = self.topic.chars().count();
        if !(1..=500).contains(&topic_len) {
            return Err(ApiError::Validation("topic must be 1-500 characters".into()));
        }
        if !(1..=MAX_CARDS_PER_GENERATION).contains(&self.num_cards) {
            return Err(ApiError::Validation(format!(
                "num_cards must be between 1 and {MAX_CARDS_PER_GENERATION}"
            )));
        }
        let language_len = self.language.chars().count();
        if !(2..=5).contains(&language_len) {
            return Err(ApiError::Validation("language must be 2-5 characters".into()));
        }
        if self.context.as_ref().is_some_and(|c| c.chars().count() > 5000) {
            return Err(ApiError::Validation("context must be at most 5000 characters".into()));
        }
        if self.tags.len() > 20 {
            return Err(ApiError::Validation("at most 20 tags are allowed".into()));
        }
        if self.idempotency_key.as_ref().is_some_and(|k| k.trim().is_empty() || k.len() > 255) {
            return Err(ApiError::Validation("idempotency_key must be 1-255 characters".into()));
        }
        Ok(self)
    }
}

/// A card produced by a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCard {
    pub front: String,
    pub back: String,
    pub card_type: CardType,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub confidence: Option<f64>,
    pub is_duplicate: bool,
    pub duplicate_card_id: Option<String>,
    pub similarity_score: Option<f64>,
    /// Set on rejected cards: `duplicate` or `low_confidence`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Id of the stored card once saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
}

impl GeneratedCard {
    pub fn new(front: String, back: String, card_type: CardType, tags: Vec<String>) -> Self {
        Self {
            front,
            back,
            card_type,
            tags,
            source: None,
            confidence: None,
            is_duplicate: false,
            duplicate_card_id: None,
            similarity_score: None,
            rejection_reason: None,
            card_id: None,
        }
    }

    /// Text used for duplicate checks and fact-check claims
    pub fn claim(&self) -> String {
        format!("Question: {}\nAnswer: {}", self.front, self.back)
    }
}

/// Stored in the job's `result` when it completes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub deck_id: String,
    pub cards: Vec<GeneratedCard>,
    pub rejected: Vec<GeneratedCard>,
    pub total_generated: usize,
    pub model: String,
}
