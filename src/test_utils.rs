//! Shared helpers for unit tests: a scripted LLM backend and seed data.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::db::DbPool;
use crate::llm::{LlmBackend, LlmError, LlmRequest, LlmResponse};
use crate::models::{BASIC_TEMPLATE_ID, Card, Deck, User};
use crate::rag::tokenize;
use crate::repo;

pub use crate::repo::tests::setup_test_db;

const EMBEDDING_DIM: usize = 32;

/// Bag-of-words vector: identical texts embed identically and texts that
/// share words point in similar directions
pub fn word_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; EMBEDDING_DIM];
    for token in tokenize(text) {
        let hash = token
            .bytes()
            .fold(2_166_136_261u32, |h, b| (h ^ u32::from(b)).wrapping_mul(16_777_619));
        vector[hash as usize % EMBEDDING_DIM] += 1.0;
    }
    vector
}

/// LLM backend answering from a script
///
/// Completions are popped from a queue; once it is empty every call gets
/// `fallback`. Embeddings come from `word_vector`.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: String,
    pub requests: Mutex<Vec<LlmRequest>>,
    pub embed_calls: AtomicUsize,
    pub fail_embeddings: AtomicBool,
    pub healthy: AtomicBool,
}

impl ScriptedLlm {
    pub fn new(fallback: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: fallback.to_string(),
            requests: Mutex::new(Vec::new()),
            embed_calls: AtomicUsize::new(0),
            fail_embeddings: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn shared(fallback: &str) -> Arc<Self> {
        Arc::new(Self::new(fallback))
    }

    pub fn push_reply(&self, content: &str) {
        self.replies.lock().unwrap().push_back(Ok(content.to_string()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let next = self.replies.lock().unwrap().pop_front();
        let content = match next {
            Some(reply) => reply?,
            None => self.fallback.clone(),
        };
        Ok(LlmResponse {
            output_tokens: content.len() as u32 / 4,
            content,
            model,
            input_tokens: 10,
            finish_reason: "stop".to_string(),
        })
    }

    async fn embed(&self, texts: Vec<String>, _model: &str) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(LlmError::TaskFailed("embedding model offline".to_string()));
        }
        Ok(texts.iter().map(|t| word_vector(t)).collect())
    }

    async fn health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn list_models(&self) -> Vec<serde_json::Value> {
        vec![serde_json::json!({ "name": "scripted" })]
    }
}

pub fn seed_user(pool: &DbPool, email: &str) -> User {
    repo::create_user(pool, User::new(email.to_string(), "hash".to_string(), "Tester".to_string())).unwrap()
}

pub fn seed_deck(pool: &DbPool, owner: &User, name: &str) -> Deck {
    repo::insert_deck(pool, Deck::new(owner.get_id(), name.to_string(), None, None)).unwrap()
}

pub fn seed_card(pool: &DbPool, deck: &Deck, front: &str, back: &str) -> Card {
    repo::insert_card(
        pool,
        Card::new(
            deck.get_id(),
            BASIC_TEMPLATE_ID.to_string(),
            serde_json::json!({ "Front": front, "Back": back }),
            Vec::new(),
            Some(deck.get_owner_id()),
        ),
    )
    .unwrap()
}

#[test]
fn test_word_vector_similarity() {
    use crate::rag::cosine_similarity;

    let a = word_vector("ownership moves values");
    assert!(cosine_similarity(&a, &word_vector("Ownership moves values")) > 0.999);
    assert!(cosine_similarity(&a, &word_vector("ownership moves values in rust")) > 0.5);
}
