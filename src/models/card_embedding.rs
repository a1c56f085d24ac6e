use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::Vector;

/// The embedding of a card's indexable text
#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::card_embeddings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CardEmbedding {
    pub card_id: String,
    /// Name of the embedding model that produced the vector
    pub embedder: String,
    /// The text that was embedded
    pub content_text: String,
    #[serde(skip_serializing)]
    pub vector: Vector,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl CardEmbedding {
    pub fn new(card_id: String, embedder: String, content_text: String, vector: Vec<f32>) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            card_id,
            embedder,
            content_text,
            vector: Vector(vector),
            created_at: now,
            updated_at: now,
        }
    }
}
