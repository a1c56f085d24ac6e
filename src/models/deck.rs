use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents a deck of cards owned by a user
///
/// Decks form a forest through `parent_id`; a deck never becomes its own
/// ancestor.
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::decks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Deck {
    /// Unique identifier for the deck (UUID v4 as string)
    id: String,

    /// Name, unique per owner among live decks
    name: String,

    description: Option<String>,

    /// The user who owns this deck
    owner_id: String,

    /// Parent deck, `None` for root decks
    parent_id: Option<String>,

    /// Deck id inside the Anki collection once synced
    anki_deck_id: Option<i64>,

    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,

    /// Soft-delete marker
    deleted_at: Option<NaiveDateTime>,
}

impl Deck {
    /// Creates a new deck
    ///
    /// ### Arguments
    ///
    /// * `owner_id` - The owning user
    /// * `name` - The deck name
    /// * `description` - Optional free text
    /// * `parent_id` - Optional parent deck
    ///
    /// ### Returns
    ///
    /// A new `Deck` with a fresh id and timestamps
    pub fn new(
        owner_id: String,
        name: String,
        description: Option<String>,
        parent_id: Option<String>,
    ) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            owner_id,
            parent_id,
            anki_deck_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn get_id(&self) -> String {
        self.id.clone()
    }

    pub fn get_name(&self) -> String {
        self.name.clone()
    }

    pub fn get_description(&self) -> Option<String> {
        self.description.clone()
    }

    pub fn get_owner_id(&self) -> String {
        self.owner_id.clone()
    }

    pub fn get_parent_id(&self) -> Option<String> {
        self.parent_id.clone()
    }

    pub fn get_anki_deck_id(&self) -> Option<i64> {
        self.anki_deck_id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether `user_id` owns this deck
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn get_created_at(&self) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(self.created_at, Utc)
    }

    pub fn get_deleted_at_raw(&self) -> Option<NaiveDateTime> {
        self.deleted_at
    }
}

/// A deck together with its live children, used by the tree endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckNode {
    #[serde(flatten)]
    pub deck: Deck,
    pub card_count: i64,
    pub children: Vec<DeckNode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deck_new() {
        let deck = Deck::new("u1".into(), "Rust".into(), None, Some("p1".into()));
        assert_eq!(deck.get_name(), "Rust");
        assert_eq!(deck.get_parent_id().as_deref(), Some("p1"));
        assert!(deck.is_owned_by("u1"));
        assert!(!deck.is_owned_by("u2"));
        assert!(!deck.is_deleted());
    }

    #[test]
    fn test_deck_node_flattens_deck() {
        let deck = Deck::new("u1".into(), "Root".into(), None, None);
        let node = DeckNode { deck, card_count: 3, children: vec![] };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["name"], "Root");
        assert_eq!(json["card_count"], 3);
        assert!(json["children"].as_array().unwrap().is_empty());
    }
}
