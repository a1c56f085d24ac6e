//! Retrieval over card embeddings.
//!
//! Cards are embedded through the LLM service and stored as JSON vectors.
//! Similarity is computed in process over a user's live cards; keyword
//! search scores the same indexed text by term frequency, and hybrid search
//! fuses both rankings.

mod scoring;
mod text;

pub use scoring::{RRF_K, cosine_similarity, keyword_score, reciprocal_rank_fusion};
pub use text::{card_text, fields_text, tokenize};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::db::DbPool;
use crate::errors::ApiError;
use crate::llm::LlmBackend;
use crate::models::{Card, CardEmbedding, CardStatus};
use crate::repo;

pub const DEFAULT_THRESHOLD: f64 = 0.7;
pub const DUPLICATE_THRESHOLD: f64 = 0.85;
const VECTOR_WEIGHT: f64 = 0.7;
const KEYWORD_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Vector,
    Keyword,
    Hybrid,
}

/// A search over the caller's cards
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    pub k: usize,
    pub threshold: f64,
    pub search_type: SearchType,
    pub deck_ids: Option<Vec<String>>,
    pub statuses: Option<Vec<CardStatus>>,
    pub tags: Option<Vec<String>>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            k: 5,
            threshold: DEFAULT_THRESHOLD,
            search_type: SearchType::Vector,
            deck_ids: None,
            statuses: None,
            tags: None,
        }
    }

    fn admits(&self, card: &Card) -> bool {
        if let Some(deck_ids) = &self.deck_ids {
            if !deck_ids.is_empty() && !deck_ids.contains(&card.get_deck_id()) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.is_empty() && !statuses.contains(&card.get_status()) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.is_empty() && !card.get_tags().iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub card_id: String,
    pub deck_id: String,
    pub deck_name: String,
    pub fields: serde_json::Value,
    pub tags: Vec<String>,
    pub status: CardStatus,
    /// Score in `[0, 1]`
    pub similarity: f64,
    pub content_text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOutcome {
    pub indexed_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub failed_card_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReindexOutcome {
    pub deleted_count: usize,
    pub indexed_count: usize,
    pub failed_count: usize,
}

/// Text to check for duplicates, tagged with a caller-chosen id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub temp_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub existing_card_id: String,
    pub existing_card_fields: serde_json::Value,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateResult {
    pub temp_id: String,
    pub is_duplicate: bool,
    pub matches: Vec<DuplicateMatch>,
    pub highest_similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_cards: i64,
    pub indexed_cards: i64,
    pub unindexed_cards: i64,
    pub coverage_percent: f64,
}

/// Card plus the data needed to build a hit
struct Candidate {
    card: Card,
    embedding: CardEmbedding,
}

#[derive(Clone)]
pub struct RagService {
    pool: Arc<DbPool>,
    llm: Arc<dyn LlmBackend>,
    model: String,
    batch_size: usize,
}

impl RagService {
    pub fn new(pool: Arc<DbPool>, llm: Arc<dyn LlmBackend>, model: String, batch_size: usize) -> Self {
        Self {
            pool,
            llm,
            model,
            batch_size: batch_size.max(1),
        }
    }

    /// Embeds and stores the given cards of `owner_id`
    ///
    /// Cards that are not the owner's, are deleted or have no text are
    /// skipped, as are cards whose stored text is unchanged unless `force`
    /// is set. A failed embedding batch marks its cards as failed and the
    /// remaining batches still run.
    #[instrument(skip(self, card_ids), fields(cards = card_ids.len()))]
    pub async fn index_cards(&self, owner_id: &str, card_ids: &[String], force: bool) -> Result<IndexOutcome, ApiError> {
        let owned_decks: HashSet<String> = repo::list_all_decks(&self.pool, owner_id)?
            .into_iter()
            .map(|d| d.get_id())
            .collect();
        let cards = repo::get_cards_by_ids(&self.pool, card_ids)?;

        let mut outcome = IndexOutcome {
            skipped_count: card_ids.len().saturating_sub(cards.len()),
            ..Default::default()
        };

        let mut pending = Vec::new();
        for card in cards {
            if card.is_deleted() || !owned_decks.contains(&card.get_deck_id()) {
                outcome.skipped_count += 1;
                continue;
            }
            let text = card_text(&card);
            if text.is_empty() {
                outcome.skipped_count += 1;
                continue;
            }
            if !force {
                let current = repo::get_embedding(&self.pool, &card.get_id())?;
                if current.is_some_and(|e| e.content_text == text && e.embedder == self.model) {
                    outcome.skipped_count += 1;
                    continue;
                }
            }
            pending.push((card.get_id(), text));
        }

        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            match self.llm.embed(texts, &self.model).await {
                Ok(vectors) => {
                    let rows: Vec<CardEmbedding> = batch
                        .iter()
                        .zip(vectors)
                        .map(|((id, text), vector)| {
                            CardEmbedding::new(id.clone(), self.model.clone(), text.clone(), vector)
                        })
                        .collect();
                    repo::upsert_embeddings(&self.pool, &rows)?;
                    outcome.indexed_count += rows.len();
                }
                Err(err) => {
                    warn!("embedding batch of {} cards failed: {}", batch.len(), err);
                    outcome.failed_count += batch.len();
                    outcome
                        .failed_card_ids
                        .extend(batch.iter().map(|(id, _)| id.clone()));
                }
            }
        }

        info!(
            indexed = outcome.indexed_count,
            skipped = outcome.skipped_count,
            failed = outcome.failed_count,
            "indexed cards"
        );
        Ok(outcome)
    }

    /// Drops and rebuilds the embeddings of the owner's cards, optionally
    /// limited to one deck
    #[instrument(skip(self))]
    pub async fn reindex(&self, owner_id: &str, deck_id: Option<&str>) -> Result<ReindexOutcome, ApiError> {
        let filter = repo::CardFilter {
            owner_id: owner_id.to_string(),
            deck_id: deck_id.map(str::to_string),
            ..Default::default()
        };
        let ids: Vec<String> = repo::list_all_cards(&self.pool, &filter)?
            .iter()
            .map(Card::get_id)
            .collect();

        let deleted_count = repo::delete_embeddings(&self.pool, &ids)?;
        let indexed = self.index_cards(owner_id, &ids, true).await?;

        Ok(ReindexOutcome {
            deleted_count,
            indexed_count: indexed.indexed_count,
            failed_count: indexed.failed_count,
        })
    }

    /// Removes the embeddings of the owner's cards among `card_ids`
    pub fn remove(&self, owner_id: &str, card_ids: &[String]) -> Result<usize, ApiError> {
        let mut owned = Vec::new();
        for card_id in card_ids {
            if let Some((_, deck)) = repo::get_card_with_deck(&self.pool, card_id)? {
                if deck.is_owned_by(owner_id) {
                    owned.push(card_id.clone());
                }
            }
        }
        Ok(repo::delete_embeddings(&self.pool, &owned)?)
    }

    fn candidates(&self, owner_id: &str, query: &SearchQuery) -> Result<Vec<Candidate>, ApiError> {
        Ok(repo::load_user_embeddings(&self.pool, owner_id)?
            .into_iter()
            .filter(|(card, _)| query.admits(card))
            .map(|(card, embedding)| Candidate { card, embedding })
            .collect())
    }

    fn deck_names(&self, owner_id: &str) -> Result<HashMap<String, String>, ApiError> {
        Ok(repo::list_all_decks(&self.pool, owner_id)?
            .into_iter()
            .map(|d| (d.get_id(), d.get_name()))
            .collect())
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        let mut vectors = self.llm.embed(vec![text.to_string()], &self.model).await?;
        vectors
            .pop()
            .ok_or_else(|| ApiError::Llm("embedding service returned no vector".to_string()))
    }

    /// Candidates at or above `threshold`, best first, at most `k`
    fn rank_by_vector<'a>(
        candidates: &'a [Candidate],
        vector: &[f32],
        threshold: f64,
        k: usize,
    ) -> Vec<(&'a Candidate, f64)> {
        let mut scored: Vec<(&Candidate, f64)> = candidates
            .iter()
            .map(|c| (c, cosine_similarity(vector, &c.embedding.vector.0)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }

    /// Keyword matches, best first, at most `k`, scores divided by the best
    fn rank_by_keywords<'a>(candidates: &'a [Candidate], query: &str, k: usize) -> Vec<(&'a Candidate, f64)> {
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        let mut scored: Vec<(&Candidate, f64)> = candidates
            .iter()
            .map(|c| (c, keyword_score(&terms, &c.embedding.content_text)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        if let Some(best) = scored.first().map(|(_, s)| *s) {
            for (_, score) in scored.iter_mut() {
                *score /= best;
            }
        }
        scored
    }

    fn hit(candidate: &Candidate, similarity: f64, deck_names: &HashMap<String, String>) -> SearchHit {
        let card = &candidate.card;
        SearchHit {
            card_id: card.get_id(),
            deck_id: card.get_deck_id(),
            deck_name: deck_names.get(&card.get_deck_id()).cloned().unwrap_or_default(),
            fields: card.get_fields().clone(),
            tags: card.get_tags().to_vec(),
            status: card.get_status(),
            similarity: similarity.clamp(0.0, 1.0),
            content_text: candidate.embedding.content_text.clone(),
            created_at: card.get_created_at(),
        }
    }

    /// Searches the owner's live cards
    #[instrument(skip(self, query), fields(search_type = ?query.search_type, k = query.k))]
    pub async fn search(&self, owner_id: &str, query: &SearchQuery) -> Result<Vec<SearchHit>, ApiError> {
        if query.query.trim().is_empty() || query.k == 0 {
            return Ok(Vec::new());
        }
        let candidates = self.candidates(owner_id, query)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let deck_names = self.deck_names(owner_id)?;

        let hits = match query.search_type {
            SearchType::Vector => {
                let vector = self.embed_one(&query.query).await?;
                Self::rank_by_vector(&candidates, &vector, query.threshold, query.k)
                    .into_iter()
                    .map(|(c, score)| Self::hit(c, score, &deck_names))
                    .collect()
            }
            SearchType::Keyword => Self::rank_by_keywords(&candidates, &query.query, query.k)
                .into_iter()
                .map(|(c, score)| Self::hit(c, score, &deck_names))
                .collect(),
            SearchType::Hybrid => {
                let vector = self.embed_one(&query.query).await?;
                let by_vector = Self::rank_by_vector(&candidates, &vector, query.threshold, query.k * 2);
                let by_keyword = Self::rank_by_keywords(&candidates, &query.query, query.k * 2);

                let lookup: HashMap<String, &Candidate> = by_vector
                    .iter()
                    .chain(by_keyword.iter())
                    .map(|(c, _)| (c.card.get_id(), *c))
                    .collect();
                let vector_ids: Vec<String> = by_vector.iter().map(|(c, _)| c.card.get_id()).collect();
                let keyword_ids: Vec<String> = by_keyword.iter().map(|(c, _)| c.card.get_id()).collect();

                reciprocal_rank_fusion(&vector_ids, &keyword_ids, VECTOR_WEIGHT, KEYWORD_WEIGHT)
                    .into_iter()
                    .take(query.k)
                    .filter_map(|(id, score)| lookup.get(&id).map(|c| Self::hit(c, score, &deck_names)))
                    .collect()
            }
        };

        Ok(hits)
    }

    /// Compares each candidate text against the owner's indexed cards
    #[instrument(skip(self, candidates), fields(count = candidates.len()))]
    pub async fn check_duplicates(
        &self,
        owner_id: &str,
        candidates: &[DuplicateCandidate],
        threshold: f64,
    ) -> Result<Vec<DuplicateResult>, ApiError> {
        let not_duplicate = |temp_id: &str| DuplicateResult {
            temp_id: temp_id.to_string(),
            is_duplicate: false,
            matches: Vec::new(),
            highest_similarity: 0.0,
        };

        let existing = self.candidates(owner_id, &SearchQuery::new(""))?;
        let texts: Vec<String> = candidates
            .iter()
            .filter(|c| !c.text.trim().is_empty())
            .map(|c| c.text.clone())
            .collect();
        if existing.is_empty() || texts.is_empty() {
            return Ok(candidates.iter().map(|c| not_duplicate(&c.temp_id)).collect());
        }

        let mut vectors = self.llm.embed(texts, &self.model).await?.into_iter();
        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.text.trim().is_empty() {
                results.push(not_duplicate(&candidate.temp_id));
                continue;
            }
            let Some(vector) = vectors.next() else {
                results.push(not_duplicate(&candidate.temp_id));
                continue;
            };

            let matches: Vec<DuplicateMatch> = Self::rank_by_vector(&existing, &vector, threshold, 5)
                .into_iter()
                .map(|(c, similarity)| DuplicateMatch {
                    existing_card_id: c.card.get_id(),
                    existing_card_fields: c.card.get_fields().clone(),
                    similarity,
                })
                .collect();
            let highest_similarity = matches.first().map(|m| m.similarity).unwrap_or(0.0);

            results.push(DuplicateResult {
                temp_id: candidate.temp_id.clone(),
                is_duplicate: !matches.is_empty(),
                matches,
                highest_similarity,
            });
        }

        Ok(results)
    }

    /// Cards most similar to `card_id`, excluding the card itself
    ///
    /// A card without an embedding has no similar cards.
    pub fn find_similar(
        &self,
        owner_id: &str,
        card_id: &str,
        k: usize,
        threshold: f64,
    ) -> Result<Vec<SearchHit>, ApiError> {
        let (_, deck) = repo::get_card_with_deck(&self.pool, card_id)?.ok_or(ApiError::NotFound("Card"))?;
        if !deck.is_owned_by(owner_id) {
            return Err(ApiError::NotFound("Card"));
        }
        let Some(source) = repo::get_embedding(&self.pool, card_id)? else {
            return Ok(Vec::new());
        };

        let candidates: Vec<Candidate> = self
            .candidates(owner_id, &SearchQuery::new(""))?
            .into_iter()
            .filter(|c| c.card.get_id() != card_id)
            .collect();
        let deck_names = self.deck_names(owner_id)?;

        Ok(Self::rank_by_vector(&candidates, &source.vector.0, threshold, k)
            .into_iter()
            .map(|(c, score)| Self::hit(c, score, &deck_names))
            .collect())
    }

    pub fn stats(&self, owner_id: &str) -> Result<IndexStats, ApiError> {
        let total_cards: i64 = repo::count_cards_by_status(&self.pool, owner_id)?.values().sum();
        let indexed_cards = repo::count_user_embeddings(&self.pool, owner_id)?;

        let coverage_percent = if total_cards > 0 {
            indexed_cards as f64 / total_cards as f64 * 100.0
        } else {
            0.0
        };
        Ok(IndexStats {
            total_cards,
            indexed_cards,
            unindexed_cards: (total_cards - indexed_cards).max(0),
            coverage_percent,
        })
    }
}

#[cfg(test)]
mod tests;
