use crate::db::DbPool;
use crate::models::{Card, CardEmbedding};
use crate::schema::{card_embeddings, cards, decks};
use anyhow::Result;
use diesel::prelude::*;

/// Inserts or replaces the embeddings of the given cards
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `embeddings` - One row per card; an existing row for the card is replaced
///
/// ### Returns
///
/// The number of rows written
///
/// ### Errors
///
/// Returns an error if a card does not exist; earlier rows of the batch
/// are rolled back
pub fn upsert_embeddings(pool: &DbPool, embeddings: &[CardEmbedding]) -> Result<usize> {
    let conn = &mut pool.get()?;

    let written = conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let mut written = 0;
        for embedding in embeddings {
            written += diesel::insert_into(card_embeddings::table)
                .values(embedding)
                .on_conflict(card_embeddings::card_id)
                .do_update()
                .set((
                    card_embeddings::embedder.eq(&embedding.embedder),
                    card_embeddings::content_text.eq(&embedding.content_text),
                    card_embeddings::vector.eq(&embedding.vector),
                    card_embeddings::updated_at.eq(embedding.updated_at),
                ))
                .execute(conn)?;
        }
        Ok(written)
    })?;

    Ok(written)
}

pub fn get_embedding(pool: &DbPool, card_id: &str) -> Result<Option<CardEmbedding>> {
    let conn = &mut pool.get()?;

    let embedding = card_embeddings::table
        .find(card_id)
        .first::<CardEmbedding>(conn)
        .optional()?;

    Ok(embedding)
}

/// Removes the embeddings of the given cards
///
/// ### Returns
///
/// The number of embeddings deleted
pub fn delete_embeddings(pool: &DbPool, card_ids: &[String]) -> Result<usize> {
    let conn = &mut pool.get()?;

    let deleted = diesel::delete(card_embeddings::table.filter(card_embeddings::card_id.eq_any(card_ids)))
        .execute(conn)?;

    Ok(deleted)
}

/// Live cards of a user that have an embedding, paired with it
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `owner_id` - The user whose decks are searched
///
/// ### Returns
///
/// Every `(card, embedding)` pair in the user's live decks
pub fn load_user_embeddings(pool: &DbPool, owner_id: &str) -> Result<Vec<(Card, CardEmbedding)>> {
    let conn = &mut pool.get()?;

    let rows = card_embeddings::table
        .inner_join(cards::table.inner_join(decks::table))
        .filter(decks::owner_id.eq(owner_id))
        .filter(decks::deleted_at.is_null())
        .filter(cards::deleted_at.is_null())
        .select((Card::as_select(), CardEmbedding::as_select()))
        .load::<(Card, CardEmbedding)>(conn)?;

    Ok(rows)
}

/// Counts the user's live cards that have an embedding
pub fn count_user_embeddings(pool: &DbPool, owner_id: &str) -> Result<i64> {
    let conn = &mut pool.get()?;

    let count = card_embeddings::table
        .inner_join(cards::table.inner_join(decks::table))
        .filter(decks::owner_id.eq(owner_id))
        .filter(decks::deleted_at.is_null())
        .filter(cards::deleted_at.is_null())
        .count()
        .get_result::<i64>(conn)?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Deck, User, BASIC_TEMPLATE_ID};
    use crate::repo::tests::setup_test_db;
    use crate::repo::{create_user, insert_card, insert_deck, set_card_deleted};

    fn setup(pool: &DbPool) -> (String, Card) {
        let user = create_user(pool, User::new("e@example.com".into(), "h".into(), "E".into())).unwrap();
        let deck = insert_deck(pool, Deck::new(user.get_id(), "Deck".into(), None, None)).unwrap();
        let card = insert_card(
            pool,
            Card::new(
                deck.get_id(),
                BASIC_TEMPLATE_ID.into(),
                serde_json::json!({"Front": "Q", "Back": "A"}),
                vec![],
                None,
            ),
        )
        .unwrap();
        (user.get_id(), card)
    }

    #[test]
    fn test_upsert_replaces_vector() {
        let pool = setup_test_db();
        let (owner, card) = setup(&pool);

        upsert_embeddings(&pool, &[CardEmbedding::new(card.get_id(), "e5".into(), "v1".into(), vec![1.0, 0.0])]).unwrap();
        upsert_embeddings(&pool, &[CardEmbedding::new(card.get_id(), "e5".into(), "v2".into(), vec![0.0, 1.0])]).unwrap();

        let stored = get_embedding(&pool, &card.get_id()).unwrap().unwrap();
        assert_eq!(stored.content_text, "v2");
        assert_eq!(stored.vector.0, vec![0.0, 1.0]);
        assert_eq!(count_user_embeddings(&pool, &owner).unwrap(), 1);
    }

    #[test]
    fn test_deleted_cards_are_not_loaded() {
        let pool = setup_test_db();
        let (owner, card) = setup(&pool);
        upsert_embeddings(&pool, &[CardEmbedding::new(card.get_id(), "e5".into(), "t".into(), vec![1.0])]).unwrap();

        assert_eq!(load_user_embeddings(&pool, &owner).unwrap().len(), 1);
        set_card_deleted(&pool, &card.get_id(), true).unwrap();
        assert!(load_user_embeddings(&pool, &owner).unwrap().is_empty());

        assert_eq!(delete_embeddings(&pool, &[card.get_id()]).unwrap(), 1);
    }
}
