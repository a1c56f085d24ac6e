use super::*;
use crate::test_utils::{ScriptedLlm, seed_card, seed_deck, seed_user, setup_test_db};
use std::sync::atomic::Ordering;

fn service(pool: &Arc<DbPool>, llm: &Arc<ScriptedLlm>, batch_size: usize) -> RagService {
    RagService::new(pool.clone(), llm.clone(), "multilingual-e5-large".into(), batch_size)
}

#[tokio::test]
async fn test_index_and_vector_search() {
    let pool = setup_test_db();
    let llm = ScriptedLlm::shared("");
    let rag = service(&pool, &llm, 2);

    let user = seed_user(&pool, "rag@example.com");
    let deck = seed_deck(&pool, &user, "Rust");
    let ownership = seed_card(&pool, &deck, "What is ownership?", "Each value has one owner");
    let borrowing = seed_card(&pool, &deck, "What is borrowing?", "Temporary access via references");
    let traits = seed_card(&pool, &deck, "What is a trait?", "Shared behaviour");

    let ids = vec![ownership.get_id(), borrowing.get_id(), traits.get_id()];
    let outcome = rag.index_cards(&user.get_id(), &ids, false).await.unwrap();
    assert_eq!(outcome.indexed_count, 3);
    // batch size 2 over 3 cards
    assert_eq!(llm.embed_calls.load(Ordering::SeqCst), 2);

    let mut query = SearchQuery::new(card_text(&ownership));
    query.threshold = 0.99;
    let hits = rag.search(&user.get_id(), &query).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].card_id, ownership.get_id());
    assert_eq!(hits[0].deck_name, "Rust");
    assert!(hits[0].similarity > 0.99);
}

#[tokio::test]
async fn test_unchanged_cards_are_skipped() {
    let pool = setup_test_db();
    let llm = ScriptedLlm::shared("");
    let rag = service(&pool, &llm, 10);
    let user = seed_user(&pool, "skip@example.com");
    let deck = seed_deck(&pool, &user, "D");
    let card = seed_card(&pool, &deck, "Q", "A");

    rag.index_cards(&user.get_id(), &[card.get_id()], false).await.unwrap();
    let again = rag.index_cards(&user.get_id(), &[card.get_id()], false).await.unwrap();
    assert_eq!((again.indexed_count, again.skipped_count), (0, 1));

    let forced = rag.index_cards(&user.get_id(), &[card.get_id()], true).await.unwrap();
    assert_eq!(forced.indexed_count, 1);
}

#[tokio::test]
async fn test_failed_batch_is_reported() {
    let pool = setup_test_db();
    let llm = ScriptedLlm::shared("");
    llm.fail_embeddings.store(true, Ordering::SeqCst);
    let rag = service(&pool, &llm, 10);
    let user = seed_user(&pool, "fail@example.com");
    let deck = seed_deck(&pool, &user, "D");
    let card = seed_card(&pool, &deck, "Q", "A");

    let outcome = rag.index_cards(&user.get_id(), &[card.get_id()], false).await.unwrap();
    assert_eq!(outcome.failed_count, 1);
    assert_eq!(outcome.failed_card_ids, vec![card.get_id()]);
    assert_eq!(rag.stats(&user.get_id()).unwrap().indexed_cards, 0);
}

#[tokio::test]
async fn test_search_is_user_scoped_and_skips_deleted() {
    let pool = setup_test_db();
    let llm = ScriptedLlm::shared("");
    let rag = service(&pool, &llm, 10);

    let alice = seed_user(&pool, "alice@example.com");
    let bob = seed_user(&pool, "bob@example.com");
    let alice_deck = seed_deck(&pool, &alice, "A");
    let bob_deck = seed_deck(&pool, &bob, "B");
    let alice_card = seed_card(&pool, &alice_deck, "Lifetimes", "Scopes of references");
    let bob_card = seed_card(&pool, &bob_deck, "Lifetimes", "Scopes of references");

    rag.index_cards(&alice.get_id(), &[alice_card.get_id(), bob_card.get_id()], false)
        .await
        .unwrap();
    rag.index_cards(&bob.get_id(), &[bob_card.get_id()], false).await.unwrap();

    let mut query = SearchQuery::new("lifetimes scopes references");
    query.search_type = SearchType::Keyword;
    let hits = rag.search(&alice.get_id(), &query).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].card_id, alice_card.get_id());
    assert_eq!(hits[0].similarity, 1.0);

    repo::set_card_deleted(&pool, &alice_card.get_id(), true).unwrap();
    assert!(rag.search(&alice.get_id(), &query).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hybrid_search_and_filters() {
    let pool = setup_test_db();
    let llm = ScriptedLlm::shared("");
    let rag = service(&pool, &llm, 10);
    let user = seed_user(&pool, "hybrid@example.com");
    let deck = seed_deck(&pool, &user, "D");
    let other = seed_deck(&pool, &user, "Other");
    let a = seed_card(&pool, &deck, "tokio runtime", "async executor");
    let b = seed_card(&pool, &other, "tokio runtime", "async executor");

    rag.index_cards(&user.get_id(), &[a.get_id(), b.get_id()], false).await.unwrap();

    let mut query = SearchQuery::new("tokio runtime");
    query.search_type = SearchType::Hybrid;
    query.threshold = 0.1;
    let hits = rag.search(&user.get_id(), &query).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].similarity, 1.0);

    query.deck_ids = Some(vec![deck.get_id()]);
    let hits = rag.search(&user.get_id(), &query).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].card_id, a.get_id());

    query.deck_ids = None;
    query.statuses = Some(vec![CardStatus::Approved]);
    assert!(rag.search(&user.get_id(), &query).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_check_duplicates() {
    let pool = setup_test_db();
    let llm = ScriptedLlm::shared("");
    let rag = service(&pool, &llm, 10);
    let user = seed_user(&pool, "dup@example.com");
    let deck = seed_deck(&pool, &user, "D");
    let card = seed_card(&pool, &deck, "What is a closure?", "A function capturing its environment");
    rag.index_cards(&user.get_id(), &[card.get_id()], false).await.unwrap();

    let candidates = vec![
        DuplicateCandidate { temp_id: "same".into(), text: card_text(&card) },
        DuplicateCandidate { temp_id: "new".into(), text: "Question: Define monomorphization".into() },
        DuplicateCandidate { temp_id: "blank".into(), text: "  ".into() },
    ];
    let results = rag
        .check_duplicates(&user.get_id(), &candidates, DUPLICATE_THRESHOLD)
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].is_duplicate);
    assert_eq!(results[0].matches[0].existing_card_id, card.get_id());
    assert!(!results[1].is_duplicate);
    assert!(!results[2].is_duplicate);
    assert_eq!(results[2].temp_id, "blank");
}

#[tokio::test]
async fn test_find_similar_excludes_self() {
    let pool = setup_test_db();
    let llm = ScriptedLlm::shared("");
    let rag = service(&pool, &llm, 10);
    let user = seed_user(&pool, "sim@example.com");
    let deck = seed_deck(&pool, &user, "D");
    let a = seed_card(&pool, &deck, "serde derive", "Serialize and Deserialize");
    let b = seed_card(&pool, &deck, "serde derive", "Serialize and Deserialize macros");
    let lonely = seed_card(&pool, &deck, "unindexed", "card");
    rag.index_cards(&user.get_id(), &[a.get_id(), b.get_id()], false).await.unwrap();

    let similar = rag.find_similar(&user.get_id(), &a.get_id(), 5, 0.5).unwrap();
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].card_id, b.get_id());

    assert!(rag.find_similar(&user.get_id(), &lonely.get_id(), 5, 0.5).unwrap().is_empty());
    let stranger = seed_user(&pool, "stranger@example.com");
    assert!(matches!(
        rag.find_similar(&stranger.get_id(), &a.get_id(), 5, 0.5),
        Err(ApiError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_reindex_and_stats() {
    let pool = setup_test_db();
    let llm = ScriptedLlm::shared("");
    let rag = service(&pool, &llm, 10);
    let user = seed_user(&pool, "stats@example.com");
    let deck = seed_deck(&pool, &user, "D");
    let a = seed_card(&pool, &deck, "one", "1");
    seed_card(&pool, &deck, "two", "2");

    rag.index_cards(&user.get_id(), &[a.get_id()], false).await.unwrap();
    let stats = rag.stats(&user.get_id()).unwrap();
    assert_eq!((stats.total_cards, stats.indexed_cards, stats.unindexed_cards), (2, 1, 1));
    assert_eq!(stats.coverage_percent, 50.0);

    let outcome = rag.reindex(&user.get_id(), Some(&deck.get_id())).await.unwrap();
    assert_eq!((outcome.deleted_count, outcome.indexed_count), (1, 2));

    assert_eq!(rag.remove(&user.get_id(), &[a.get_id()]).unwrap(), 1);
    assert_eq!(rag.stats(&user.get_id()).unwrap().indexed_cards, 1);
}
