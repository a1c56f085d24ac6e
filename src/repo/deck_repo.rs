use crate::db::DbPool;
use crate::models::Deck;
use crate::schema::{cards, decks};
use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Fields of a deck that can be changed after creation
///
/// `None` leaves a column untouched; `Some(None)` clears a nullable column.
#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = decks)]
pub struct DeckChanges {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub parent_id: Option<Option<String>>,
    pub anki_deck_id: Option<Option<i64>>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Inserts a new deck
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `deck` - The deck to insert
///
/// ### Returns
///
/// The inserted deck
///
/// ### Errors
///
/// Returns an error if:
/// - Unable to get a connection from the pool
/// - The parent deck does not exist
#[instrument(skip(pool, deck), fields(deck_name = %deck.get_name()))]
pub fn insert_deck(pool: &DbPool, deck: Deck) -> Result<Deck> {
    let conn = &mut pool.get()?;

    diesel::insert_into(decks::table)
        .values(&deck)
        .execute(conn)?;

    info!("Created deck {}", deck.get_id());
    Ok(deck)
}

/// Retrieves a live deck by id
///
/// ### Returns
///
/// A Result containing the deck, or None if it does not exist or is soft-deleted
pub fn get_deck(pool: &DbPool, deck_id: &str) -> Result<Option<Deck>> {
    let conn = &mut pool.get()?;

    let deck = decks::table
        .find(deck_id)
        .filter(decks::deleted_at.is_null())
        .first::<Deck>(conn)
        .optional()?;

    Ok(deck)
}

/// Retrieves a deck by id whether or not it is soft-deleted
pub fn get_deck_including_deleted(pool: &DbPool, deck_id: &str) -> Result<Option<Deck>> {
    let conn = &mut pool.get()?;

    let deck = decks::table.find(deck_id).first::<Deck>(conn).optional()?;

    Ok(deck)
}

/// Finds a live deck of `owner_id` by exact name
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `owner_id` - The owner whose decks are searched
/// * `name` - The exact deck name
///
/// ### Returns
///
/// The deck, or None if the owner has no live deck with that name
pub fn find_deck_by_name(pool: &DbPool, owner_id: &str, name: &str) -> Result<Option<Deck>> {
    let conn = &mut pool.get()?;

    let deck = decks::table
        .filter(decks::owner_id.eq(owner_id))
        .filter(decks::name.eq(name))
        .filter(decks::deleted_at.is_null())
        .first::<Deck>(conn)
        .optional()?;

    Ok(deck)
}

/// Lists live decks of an owner, optionally only the children of `parent_id`
///
/// ### Returns
///
/// The requested page ordered by name, and the total number of matches
pub fn list_decks(
    pool: &DbPool,
    owner_id: &str,
    parent_id: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<(Vec<Deck>, i64)> {
    let conn = &mut pool.get()?;

    let filtered = || {
        let mut query = decks::table
            .filter(decks::owner_id.eq(owner_id.to_string()))
            .filter(decks::deleted_at.is_null())
            .into_boxed();
        if let Some(parent_id) = parent_id {
            query = query.filter(decks::parent_id.eq(parent_id.to_string()));
        }
        query
    };

    let total = filtered().count().get_result::<i64>(conn)?;
    let page = filtered()
        .order(decks::name.asc())
        .offset(offset)
        .limit(limit)
        .load::<Deck>(conn)?;

    Ok((page, total))
}

/// Every live deck of an owner, used to walk the hierarchy in memory
pub fn list_all_decks(pool: &DbPool, owner_id: &str) -> Result<Vec<Deck>> {
    let conn = &mut pool.get()?;

    let all = decks::table
        .filter(decks::owner_id.eq(owner_id))
        .filter(decks::deleted_at.is_null())
        .order(decks::name.asc())
        .load::<Deck>(conn)?;

    Ok(all)
}

/// Applies `changes` to a live deck
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `deck_id` - The ID of the deck to change
/// * `changes` - The columns to write; `None` fields are left alone
///
/// ### Returns
///
/// The updated deck, or None if no live deck has that id
pub fn update_deck(pool: &DbPool, deck_id: &str, mut changes: DeckChanges) -> Result<Option<Deck>> {
    let conn = &mut pool.get()?;
    changes.updated_at = Some(Utc::now().naive_utc());

    let deck = diesel::update(decks::table.find(deck_id).filter(decks::deleted_at.is_null()))
        .set(&changes)
        .get_result::<Deck>(conn)
        .optional()?;

    Ok(deck)
}

/// Soft deletes the given decks and every live card inside them
///
/// Decks and cards share one timestamp so a later restore can bring back
/// exactly the cards removed together with their deck.
///
/// ### Returns
///
/// The number of decks and the number of cards marked deleted
#[instrument(skip(pool, deck_ids), fields(count = deck_ids.len()))]
pub fn soft_delete_decks(pool: &DbPool, deck_ids: &[String]) -> Result<(usize, usize)> {
    let conn = &mut pool.get()?;
    let now = Utc::now().naive_utc();

    let counts = conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let decks_deleted = diesel::update(
            decks::table
                .filter(decks::id.eq_any(deck_ids))
                .filter(decks::deleted_at.is_null()),
        )
        .set((decks::deleted_at.eq(Some(now)), decks::updated_at.eq(now)))
        .execute(conn)?;

        let cards_deleted = diesel::update(
            cards::table
                .filter(cards::deck_id.eq_any(deck_ids))
                .filter(cards::deleted_at.is_null()),
        )
        .set((cards::deleted_at.eq(Some(now)), cards::updated_at.eq(now)))
        .execute(conn)?;

        Ok((decks_deleted, cards_deleted))
    })?;

    debug!("Soft deleted {} decks and {} cards", counts.0, counts.1);
    Ok(counts)
}

/// Clears the deletion marker of a deck and of the cards deleted with it
///
/// Cards are restored only when their `deleted_at` matches the deck's, so
/// cards deleted on their own earlier stay deleted.
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `deck_id` - The ID of the soft-deleted deck
///
/// ### Returns
///
/// The restored deck, or None if no deck has that id
///
/// ### Errors
///
/// Returns an error if unable to get a connection or either update fails;
/// the transaction then leaves both deck and cards untouched
pub fn restore_deck(pool: &DbPool, deck_id: &str) -> Result<Option<Deck>> {
    let conn = &mut pool.get()?;
    let now = Utc::now().naive_utc();

    conn.transaction(|conn| {
        let Some(deck) = decks::table.find(deck_id).first::<Deck>(conn).optional()? else {
            return Ok(None);
        };
        let Some(deleted_at) = deck.get_deleted_at_raw() else {
            return Ok(Some(deck));
        };

        diesel::update(
            cards::table
                .filter(cards::deck_id.eq(deck_id))
                .filter(cards::deleted_at.eq(deleted_at)),
        )
        .set((cards::deleted_at.eq(None::<NaiveDateTime>), cards::updated_at.eq(now)))
        .execute(conn)?;

        diesel::update(decks::table.find(deck_id))
            .set((decks::deleted_at.eq(None::<NaiveDateTime>), decks::updated_at.eq(now)))
            .get_result::<Deck>(conn)
            .optional()
    })
    .map_err(Into::into)
}

/// Counts live cards per deck
///
/// ### Returns
///
/// A map from deck id to card count; decks without live cards are absent
pub fn count_cards_by_deck(pool: &DbPool, deck_ids: &[String]) -> Result<HashMap<String, i64>> {
    let conn = &mut pool.get()?;

    let rows = cards::table
        .filter(cards::deck_id.eq_any(deck_ids))
        .filter(cards::deleted_at.is_null())
        .group_by(cards::deck_id)
        .select((cards::deck_id, diesel::dsl::count_star()))
        .load::<(String, i64)>(conn)?;

    Ok(rows.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Card, User, BASIC_TEMPLATE_ID};
    use crate::repo::tests::setup_test_db;
    use crate::repo::{create_user, get_card, insert_card};

    fn owner(pool: &DbPool) -> String {
        create_user(pool, User::new("d@example.com".into(), "h".into(), "D".into()))
            .unwrap()
            .get_id()
    }

    fn card_in(deck: &Deck) -> Card {
        Card::new(
            deck.get_id(),
            BASIC_TEMPLATE_ID.into(),
            serde_json::json!({"Front": "Q", "Back": "A"}),
            vec![],
            None,
        )
    }

    #[test]
    fn test_name_unique_among_live_decks() {
        let pool = setup_test_db();
        let owner_id = owner(&pool);

        let first = insert_deck(&pool, Deck::new(owner_id.clone(), "Rust".into(), None, None)).unwrap();
        assert!(insert_deck(&pool, Deck::new(owner_id.clone(), "Rust".into(), None, None)).is_err());

        soft_delete_decks(&pool, &[first.get_id()]).unwrap();
        assert!(insert_deck(&pool, Deck::new(owner_id, "Rust".into(), None, None)).is_ok());
    }

    #[test]
    fn test_list_children_only() {
        let pool = setup_test_db();
        let owner_id = owner(&pool);
        let root = insert_deck(&pool, Deck::new(owner_id.clone(), "Root".into(), None, None)).unwrap();
        insert_deck(&pool, Deck::new(owner_id.clone(), "Child".into(), None, Some(root.get_id()))).unwrap();

        let (all, total) = list_decks(&pool, &owner_id, None, 0, 10).unwrap();
        assert_eq!((all.len(), total), (2, 2));

        let (children, total) = list_decks(&pool, &owner_id, Some(&root.get_id()), 0, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(children[0].get_name(), "Child");
    }

    #[test]
    fn test_delete_and_restore_cascade_to_cards() {
        let pool = setup_test_db();
        let owner_id = owner(&pool);
        let deck = insert_deck(&pool, Deck::new(owner_id, "Deck".into(), None, None)).unwrap();
        let card = insert_card(&pool, card_in(&deck)).unwrap();

        assert_eq!(soft_delete_decks(&pool, &[deck.get_id()]).unwrap(), (1, 1));
        assert!(get_deck(&pool, &deck.get_id()).unwrap().is_none());
        assert!(get_card(&pool, &card.get_id()).unwrap().unwrap().is_deleted());

        let restored = restore_deck(&pool, &deck.get_id()).unwrap().unwrap();
        assert!(!restored.is_deleted());
        assert!(!get_card(&pool, &card.get_id()).unwrap().unwrap().is_deleted());
    }

    #[test]
    fn test_update_clears_parent() {
        let pool = setup_test_db();
        let owner_id = owner(&pool);
        let root = insert_deck(&pool, Deck::new(owner_id.clone(), "Root".into(), None, None)).unwrap();
        let child =
            insert_deck(&pool, Deck::new(owner_id, "Child".into(), None, Some(root.get_id()))).unwrap();

        let changes = DeckChanges {
            parent_id: Some(None),
            ..Default::default()
        };
        let updated = update_deck(&pool, &child.get_id(), changes).unwrap().unwrap();
        assert_eq!(updated.get_parent_id(), None);
    }

    #[test]
    fn test_count_cards_by_deck() {
        let pool = setup_test_db();
        let owner_id = owner(&pool);
        let deck = insert_deck(&pool, Deck::new(owner_id, "Deck".into(), None, None)).unwrap();
        insert_card(&pool, card_in(&deck)).unwrap();
        insert_card(&pool, card_in(&deck)).unwrap();

        let counts = count_cards_by_deck(&pool, &[deck.get_id()]).unwrap();
        assert_eq!(counts.get(&deck.get_id()), Some(&2));
    }
}
