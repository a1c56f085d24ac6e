use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::StringList;

/// A chat/completion model offered by the LLM service
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::llm_models)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct LlmModel {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub provider: String,
    /// Identifier sent to the LLM service
    pub model_id: String,
    pub max_tokens: i32,
    pub supports_vision: bool,
    pub supports_functions: bool,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// An embedding model offered by the LLM service
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::embedding_models)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EmbeddingModel {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub provider: String,
    pub model_id: String,
    pub dimension: i32,
    pub supported_languages: StringList,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
