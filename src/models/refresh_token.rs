use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A refresh token issued to a user, kept so it can be revoked
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::refresh_tokens)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RefreshToken {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl RefreshToken {
    pub fn new(user_id: String, token: String, expires_at: NaiveDateTime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            token,
            expires_at,
            revoked_at: None,
            created_at: Utc::now().naive_utc(),
        }
    }

    /// Whether the token can still be exchanged
    pub fn is_usable(&self, now: NaiveDateTime) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}
