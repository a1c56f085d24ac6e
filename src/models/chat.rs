use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JsonValue, StringList};

sql_text_enum! {
    /// Author of a chat message
    pub enum ChatRole {
        User => "user",
        Assistant => "assistant",
        System => "system",
    }
}

/// A conversation between a user and the assistant
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::chat_sessions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    /// Free-form context such as `{"deck_ids": [...]}`
    pub context: Option<JsonValue>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ChatSession {
    pub fn new(user_id: String, title: String, context: Option<serde_json::Value>) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            title,
            context: context.map(JsonValue),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::chat_messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
    pub tokens: Option<i32>,
    /// Ids of cards used as context for an assistant reply
    pub sources: StringList,
    pub created_at: NaiveDateTime,
}

impl ChatMessage {
    pub fn new(session_id: String, role: ChatRole, content: String, sources: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            role,
            content,
            tokens: None,
            sources: StringList(sources),
            created_at: Utc::now().naive_utc(),
        }
    }
}
