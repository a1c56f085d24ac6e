use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JsonValue;

/// Per-user settings stored alongside the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Language used for generated cards when a request does not name one
    #[serde(default = "default_language")]
    pub preferred_language: String,
    /// LLM model used for generation by default
    #[serde(default)]
    pub default_model_id: Option<String>,
    /// Embedding model used for indexing by default
    #[serde(default)]
    pub default_embedder_id: Option<String>,
}

fn default_language() -> String {
    "ru".to_string()
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            preferred_language: default_language(),
            default_model_id: None,
            default_embedder_id: None,
        }
    }
}

/// Represents a registered user
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
    /// Unique identifier for the user (UUID v4 as string)
    id: String,

    /// Login email, stored lowercase
    email: String,

    /// Argon2 PHC hash of the password
    #[serde(skip_serializing, default)]
    hashed_password: String,

    /// Name shown in the UI
    display_name: String,

    /// Inactive users cannot log in
    is_active: bool,

    /// Serialized `UserPreferences`
    preferences: JsonValue,

    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,

    /// Soft-delete marker
    deleted_at: Option<NaiveDateTime>,
}

impl User {
    /// Creates a new active user with default preferences
    ///
    /// ### Arguments
    ///
    /// * `email` - The login email (callers normalise it)
    /// * `hashed_password` - The already hashed password
    /// * `display_name` - The name shown in the UI
    pub fn new(email: String, hashed_password: String, display_name: String) -> Self {
        let now = Utc::now().naive_utc();
        let preferences = serde_json::to_value(UserPreferences::default())
            .unwrap_or_else(|_| serde_json::json!({}));
        Self {
            id: Uuid::new_v4().to_string(),
            email,
            hashed_password,
            display_name,
            is_active: true,
            preferences: JsonValue(preferences),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn get_id(&self) -> String {
        self.id.clone()
    }

    pub fn get_email(&self) -> String {
        self.email.clone()
    }

    pub fn get_hashed_password(&self) -> &str {
        &self.hashed_password
    }

    pub fn get_display_name(&self) -> String {
        self.display_name.clone()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Parses the stored preferences, falling back to defaults for missing keys
    pub fn get_preferences(&self) -> UserPreferences {
        serde_json::from_value(self.preferences.0.clone()).unwrap_or_default()
    }

    pub fn get_created_at(&self) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(self.created_at, Utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_new_defaults() {
        let user = User::new("a@b.test".into(), "hash".into(), "Ann".into());
        assert!(user.is_active());
        assert!(!user.is_deleted());
        assert_eq!(user.get_preferences().preferred_language, "ru");
        assert!(Uuid::parse_str(&user.get_id()).is_ok());
    }

    #[test]
    fn test_password_hash_is_not_serialized() {
        let user = User::new("a@b.test".into(), "secret-hash".into(), "Ann".into());
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("hashed_password").is_none());
        assert_eq!(json["email"], "a@b.test");
    }

    #[test]
    fn test_preferences_fill_missing_keys() {
        let mut user = User::new("a@b.test".into(), "h".into(), "Ann".into());
        user.preferences = JsonValue(serde_json::json!({"default_model_id": "m1"}));
        let prefs = user.get_preferences();
        assert_eq!(prefs.preferred_language, "ru");
        assert_eq!(prefs.default_model_id.as_deref(), Some("m1"));
    }
}
