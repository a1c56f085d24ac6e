use std::collections::{HashMap, HashSet};

use tracing::{info, instrument};

use super::{Page, check_page};
use crate::db::DbPool;
use crate::errors::ApiError;
use crate::models::{Card, Deck, DeckNode};
use crate::repo::{self, CardFilter, DeckChanges};

/// Most cards returned together with a deck
const DECK_CARDS_LIMIT: i64 = 100;

/// Changes requested for a deck
///
/// `parent_id: Some(None)` moves the deck to the root.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct DeckUpdate {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "super::nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "super::nullable")]
    pub parent_id: Option<Option<String>>,
}

/// A deck with its newest cards
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeckWithCards {
    #[serde(flatten)]
    pub deck: Deck,
    pub card_count: i64,
    pub cards: Vec<Card>,
}

/// Loads a live deck and checks that `user_id` owns it
pub fn owned_deck(pool: &DbPool, user_id: &str, deck_id: &str) -> Result<Deck, ApiError> {
    let deck = repo::get_deck(pool, deck_id)?.ok_or(ApiError::NotFound("Deck"))?;
    if !deck.is_owned_by(user_id) {
        return Err(ApiError::PermissionDenied("You do not own this deck".into()));
    }
    Ok(deck)
}

fn check_name(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    if !(1..=255).contains(&name.chars().count()) {
        return Err(ApiError::Validation("deck name must be 1-255 characters".into()));
    }
    Ok(name.to_string())
}

fn ensure_name_free(pool: &DbPool, user_id: &str, name: &str, except: Option<&str>) -> Result<(), ApiError> {
    match repo::find_deck_by_name(pool, user_id, name)? {
        Some(existing) if Some(existing.get_id().as_str()) != except => {
            Err(ApiError::Conflict(format!("deck {name} already exists")))
        }
        _ => Ok(()),
    }
}

/// Parent id to children ids over every live deck of the owner
fn children_index(decks: &[Deck]) -> HashMap<Option<String>, Vec<String>> {
    let mut index: HashMap<Option<String>, Vec<String>> = HashMap::new();
    for deck in decks {
        index.entry(deck.get_parent_id()).or_default().push(deck.get_id());
    }
    index
}

fn descendant_ids(decks: &[Deck], deck_id: &str) -> Vec<String> {
    let index = children_index(decks);
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let mut stack = vec![deck_id.to_string()];

    while let Some(current) = stack.pop() {
        for child in index.get(&Some(current)).into_iter().flatten() {
            if seen.insert(child.clone()) {
                found.push(child.clone());
                stack.push(child.clone());
            }
        }
    }
    found
}

#[instrument(skip(pool, description))]
pub fn create(
    pool: &DbPool,
    user_id: &str,
    name: &str,
    description: Option<String>,
    parent_id: Option<String>,
) -> Result<Deck, ApiError> {
    let name = check_name(name)?;
    if let Some(parent_id) = &parent_id {
        owned_deck(pool, user_id, parent_id)?;
    }
    ensure_name_free(pool, user_id, &name, None)?;

    let deck = repo::insert_deck(pool, Deck::new(user_id.to_string(), name, description, parent_id))?;
    Ok(deck)
}

pub fn get(pool: &DbPool, user_id: &str, deck_id: &str) -> Result<Deck, ApiError> {
    owned_deck(pool, user_id, deck_id)
}

pub fn list(
    pool: &DbPool,
    user_id: &str,
    parent_id: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Page<Deck>, ApiError> {
    check_page(offset, limit)?;
    let (items, total) = repo::list_decks(pool, user_id, parent_id, offset, limit)?;
    Ok(Page { items, total, offset, limit })
}

/// Every live deck of the user as a forest, roots first and children by name
pub fn tree(pool: &DbPool, user_id: &str) -> Result<Vec<DeckNode>, ApiError> {
    let decks = repo::list_all_decks(pool, user_id)?;
    let ids: Vec<String> = decks.iter().map(Deck::get_id).collect();
    let counts = repo::count_cards_by_deck(pool, &ids)?;

    let live: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut by_parent: HashMap<Option<String>, Vec<Deck>> = HashMap::new();
    for deck in decks {
        // a deck whose parent is gone is shown as a root
        let parent = deck.get_parent_id().filter(|p| live.contains(p.as_str()));
        by_parent.entry(parent).or_default().push(deck);
    }

    fn build(
        parent: Option<String>,
        by_parent: &mut HashMap<Option<String>, Vec<Deck>>,
        counts: &HashMap<String, i64>,
    ) -> Vec<DeckNode> {
        let decks = by_parent.remove(&parent).unwrap_or_default();
        decks
            .into_iter()
            .map(|deck| {
                let id = deck.get_id();
                let children = build(Some(id.clone()), by_parent, counts);
                DeckNode {
                    card_count: counts.get(&id).copied().unwrap_or(0),
                    deck,
                    children,
                }
            })
            .collect()
    }

    Ok(build(None, &mut by_parent, &counts))
}

pub fn get_with_cards(pool: &DbPool, user_id: &str, deck_id: &str) -> Result<DeckWithCards, ApiError> {
    let deck = owned_deck(pool, user_id, deck_id)?;
    let filter = CardFilter {
        owner_id: user_id.to_string(),
        deck_id: Some(deck.get_id()),
        ..Default::default()
    };
    let (cards, card_count) = repo::list_cards(pool, &filter, 0, DECK_CARDS_LIMIT)?;
    Ok(DeckWithCards { deck, card_count, cards })
}

#[instrument(skip(pool, update))]
pub fn update(pool: &DbPool, user_id: &str, deck_id: &str, update: DeckUpdate) -> Result<Deck, ApiError> {
    owned_deck(pool, user_id, deck_id)?;
    let mut changes = DeckChanges::default();

    if let Some(name) = update.name {
        let name = check_name(&name)?;
        ensure_name_free(pool, user_id, &name, Some(deck_id))?;
        changes.name = Some(name);
    }
    changes.description = update.description;

    if let Some(parent_id) = update.parent_id {
        if let Some(parent_id) = &parent_id {
            if parent_id == deck_id {
                return Err(ApiError::DeckCycle("a deck cannot be its own parent".into()));
            }
            owned_deck(pool, user_id, parent_id)?;
            let decks = repo::list_all_decks(pool, user_id)?;
            if descendant_ids(&decks, deck_id).contains(parent_id) {
                return Err(ApiError::DeckCycle("a deck cannot move under its own descendant".into()));
            }
        }
        changes.parent_id = Some(parent_id);
    }

    repo::update_deck(pool, deck_id, changes)?.ok_or(ApiError::NotFound("Deck"))
}

/// Soft deletes a deck, its descendants and all their cards
///
/// ### Returns
///
/// The number of decks and cards deleted
#[instrument(skip(pool))]
pub fn delete(pool: &DbPool, user_id: &str, deck_id: &str) -> Result<(usize, usize), ApiError> {
    owned_deck(pool, user_id, deck_id)?;
    let decks = repo::list_all_decks(pool, user_id)?;

    let mut ids = descendant_ids(&decks, deck_id);
    ids.push(deck_id.to_string());
    let counts = repo::soft_delete_decks(pool, &ids)?;

    info!("Deleted {} decks and {} cards", counts.0, counts.1);
    Ok(counts)
}

/// Restores a soft-deleted deck with the cards deleted along with it
///
/// Fails with a conflict when a live deck has taken the name meanwhile.
pub fn restore(pool: &DbPool, user_id: &str, deck_id: &str) -> Result<Deck, ApiError> {
    let deck = repo::get_deck_including_deleted(pool, deck_id)?.ok_or(ApiError::NotFound("Deck"))?;
    if !deck.is_owned_by(user_id) {
        return Err(ApiError::PermissionDenied("You do not own this deck".into()));
    }
    if !deck.is_deleted() {
        return Ok(deck);
    }
    ensure_name_free(pool, user_id, &deck.get_name(), Some(deck_id))?;

    repo::restore_deck(pool, deck_id)?.ok_or(ApiError::NotFound("Deck"))
}

/// Parents of a deck from the nearest up to the root
pub fn ancestors(pool: &DbPool, user_id: &str, deck_id: &str) -> Result<Vec<Deck>, ApiError> {
    let deck = owned_deck(pool, user_id, deck_id)?;
    let by_id: HashMap<String, Deck> = repo::list_all_decks(pool, user_id)?
        .into_iter()
        .map(|d| (d.get_id(), d))
        .collect();

    let mut chain = Vec::new();
    let mut seen = HashSet::from([deck.get_id()]);
    let mut next = deck.get_parent_id();
    while let Some(parent_id) = next {
        let Some(parent) = by_id.get(&parent_id) else { break };
        if !seen.insert(parent_id) {
            break;
        }
        next = parent.get_parent_id();
        chain.push(parent.clone());
    }
    Ok(chain)
}

/// Every live deck below `deck_id`, in depth-first order
pub fn descendants(pool: &DbPool, user_id: &str, deck_id: &str) -> Result<Vec<Deck>, ApiError> {
    owned_deck(pool, user_id, deck_id)?;
    let decks = repo::list_all_decks(pool, user_id)?;
    let ids = descendant_ids(&decks, deck_id);

    let mut by_id: HashMap<String, Deck> = decks.into_iter().map(|d| (d.get_id(), d)).collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_card, seed_user, setup_test_db};

    #[test]
    fn test_create_validates_name_and_parent() {
        let pool = setup_test_db();
        let user = seed_user(&pool, "decks@example.com");
        let other = seed_user(&pool, "other@example.com");
        let uid = user.get_id();

        let root = create(&pool, &uid, "  Rust ", None, None).unwrap();
        assert_eq!(root.get_name(), "Rust");

        assert!(matches!(create(&pool, &uid, "Rust", None, None), Err(ApiError::Conflict(_))));
        assert!(matches!(create(&pool, &uid, "   ", None, None), Err(ApiError::Validation(_))));
        assert!(matches!(
            create(&pool, &uid, &"x".repeat(256), None, None),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            create(&pool, &uid, "Orphan", None, Some("missing".into())),
            Err(ApiError::NotFound("Deck"))
        ));
        assert!(matches!(
            create(&pool, &other.get_id(), "Sneaky", None, Some(root.get_id())),
            Err(ApiError::PermissionDenied(_))
        ));

        // names are unique per owner only
        assert!(create(&pool, &other.get_id(), "Rust", None, None).is_ok());
    }

    #[test]
    fn test_reparenting_rejects_cycles() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "cycle@example.com").get_id();
        let a = create(&pool, &uid, "A", None, None).unwrap();
        let b = create(&pool, &uid, "B", None, Some(a.get_id())).unwrap();
        let c = create(&pool, &uid, "C", None, Some(b.get_id())).unwrap();

        let onto_self = DeckUpdate { parent_id: Some(Some(a.get_id())), ..Default::default() };
        let err = update(&pool, &uid, &a.get_id(), onto_self).unwrap_err();
        assert_eq!(err.code(), "DECK_001");

        let onto_grandchild = DeckUpdate { parent_id: Some(Some(c.get_id())), ..Default::default() };
        let err = update(&pool, &uid, &a.get_id(), onto_grandchild).unwrap_err();
        assert_eq!(err.code(), "DECK_001");

        let to_root = DeckUpdate { parent_id: Some(None), ..Default::default() };
        let moved = update(&pool, &uid, &c.get_id(), to_root).unwrap();
        assert_eq!(moved.get_parent_id(), None);
    }

    #[test]
    fn test_tree_nests_children_with_counts() {
        let pool = setup_test_db();
        let user = seed_user(&pool, "tree@example.com");
        let uid = user.get_id();
        let lang = create(&pool, &uid, "Languages", None, None).unwrap();
        let rust = create(&pool, &uid, "Rust", None, Some(lang.get_id())).unwrap();
        create(&pool, &uid, "Go", None, Some(lang.get_id())).unwrap();
        create(&pool, &uid, "History", None, None).unwrap();
        seed_card(&pool, &rust, "Q", "A");

        let forest = tree(&pool, &uid).unwrap();
        let roots: Vec<String> = forest.iter().map(|n| n.deck.get_name()).collect();
        assert_eq!(roots, vec!["History", "Languages"]);

        let languages = &forest[1];
        let children: Vec<String> = languages.children.iter().map(|n| n.deck.get_name()).collect();
        assert_eq!(children, vec!["Go", "Rust"]);
        assert_eq!(languages.children[1].card_count, 1);
        assert_eq!(languages.card_count, 0);
    }

    #[test]
    fn test_delete_cascades_and_restore() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "cascade@example.com").get_id();
        let parent = create(&pool, &uid, "Parent", None, None).unwrap();
        let child = create(&pool, &uid, "Child", None, Some(parent.get_id())).unwrap();
        let card = seed_card(&pool, &child, "Q", "A");

        assert_eq!(delete(&pool, &uid, &parent.get_id()).unwrap(), (2, 1));
        assert!(matches!(get(&pool, &uid, &child.get_id()), Err(ApiError::NotFound(_))));
        assert!(repo::get_card(&pool, &card.get_id()).unwrap().unwrap().is_deleted());

        let restored = restore(&pool, &uid, &parent.get_id()).unwrap();
        assert!(!restored.is_deleted());
        assert!(tree(&pool, &uid).unwrap()[0].children.is_empty());
    }

    #[test]
    fn test_restore_conflicts_with_new_deck_of_same_name() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "restore@example.com").get_id();
        let old = create(&pool, &uid, "Reused", None, None).unwrap();
        delete(&pool, &uid, &old.get_id()).unwrap();
        create(&pool, &uid, "Reused", None, None).unwrap();

        assert!(matches!(restore(&pool, &uid, &old.get_id()), Err(ApiError::Conflict(_))));
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let pool = setup_test_db();
        let uid = seed_user(&pool, "family@example.com").get_id();
        let a = create(&pool, &uid, "A", None, None).unwrap();
        let b = create(&pool, &uid, "B", None, Some(a.get_id())).unwrap();
        let c = create(&pool, &uid, "C", None, Some(b.get_id())).unwrap();

        let up: Vec<String> = ancestors(&pool, &uid, &c.get_id()).unwrap().iter().map(Deck::get_name).collect();
        assert_eq!(up, vec!["B", "A"]);

        let down: Vec<String> = descendants(&pool, &uid, &a.get_id()).unwrap().iter().map(Deck::get_name).collect();
        assert_eq!(down.len(), 2);
        assert!(down.contains(&"B".to_string()) && down.contains(&"C".to_string()));

        let with_cards = get_with_cards(&pool, &uid, &a.get_id()).unwrap();
        assert_eq!(with_cards.card_count, 0);
    }
}
