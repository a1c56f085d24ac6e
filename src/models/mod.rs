/// Data models module
///
/// This module defines the core data structures used throughout the application.
/// It includes database models that map to database tables, as well as methods
/// for creating and manipulating these models.

#[macro_use]
mod sql_enum;

mod json_value;
pub use json_value::{JsonValue, StringList, Vector};

mod user;
pub use user::{User, UserPreferences};

mod refresh_token;
pub use refresh_token::RefreshToken;

mod deck;
pub use deck::{Deck, DeckNode};

mod card;
pub use card::{field_text, Card, CardGenerationInfo, CardStatus};

mod card_template;
pub use card_template::{
    CardTemplate, TemplateField, TemplateFields, BASIC_TEMPLATE_ID, CLOZE_TEMPLATE_ID,
};

mod card_embedding;
pub use card_embedding::CardEmbedding;

mod prompt;
pub use prompt::{Prompt, PromptCategory, PromptExecution};

mod chat;
pub use chat::{ChatMessage, ChatRole, ChatSession};

mod llm_model;
pub use llm_model::{EmbeddingModel, LlmModel};

mod generation_job;
pub use generation_job::{GenerationJob, JobStatus};

mod sync_run;
pub use sync_run::{CardSyncState, CardSyncStatus, SyncRun, SyncSource, SyncState};
