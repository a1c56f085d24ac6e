//! Chat sessions with retrieval over the user's cards.

use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{Page, check_page};
use crate::config::Config;
use crate::db::DbPool;
use crate::errors::ApiError;
use crate::llm::{LlmBackend, LlmRequest};
use crate::models::{ChatMessage, ChatRole, ChatSession, JsonValue};
use crate::rag::{RagService, SearchHit, SearchQuery};
use crate::rate_limit::SlidingWindowLimiter;
use crate::repo::{self, ChatSessionChanges};

/// Messages of earlier turns sent along with a new one
pub const HISTORY_LIMIT: i64 = 10;
const CONTEXT_CARDS: usize = 5;
const CONTEXT_THRESHOLD: f64 = 0.6;
const MAX_MESSAGE_CHARS: usize = 10_000;
const CHUNK_WORDS: usize = 8;

const SYSTEM_PROMPT: &str = "You are a helpful assistant for studying with Anki flashcards. \
Help users understand their study material, write effective cards and answer questions \
about the topics they are learning. Reply in the language the user writes in.";

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessage {
    pub content: String,
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
    #[serde(default)]
    pub deck_ids: Option<Vec<String>>,
}

fn default_use_rag() -> bool {
    true
}

/// A card quoted as context for a reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSource {
    pub card_id: String,
    pub front: String,
    pub score: f64,
}

impl From<&SearchHit> for ChatSource {
    fn from(hit: &SearchHit) -> Self {
        let front = crate::models::field_text(&hit.fields, &["Front", "Text"]);
        Self {
            card_id: hit.card_id.clone(),
            front: front.chars().take(100).collect(),
            score: (hit.similarity * 1000.0).round() / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
    pub sources: Vec<ChatSource>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionWithMessages {
    #[serde(flatten)]
    pub session: ChatSession,
    pub messages: Vec<ChatMessage>,
}

/// Server-sent events of a streamed reply
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Chunk { content: String },
    Done { message_id: String, sources: Vec<ChatSource>, tokens: Option<i32> },
    Error { error: String },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Chunk { .. } => "chunk",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        }
    }
}

/// Everything gathered before the model is called
struct Turn {
    session: ChatSession,
    history: Vec<ChatMessage>,
    content: String,
    deck_ids: Option<Vec<String>>,
    use_rag: bool,
}

/// Splits a reply into word groups for streaming, keeping the whitespace
fn chunks(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut words = 0;
    for piece in text.split_inclusive(char::is_whitespace) {
        current.push_str(piece);
        if piece.ends_with(char::is_whitespace) {
            words += 1;
        }
        if words == CHUNK_WORDS {
            out.push(std::mem::take(&mut current));
            words = 0;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Deck ids stored in a session context as `deck_ids` or `deck_id`
fn context_deck_ids(context: Option<&JsonValue>) -> Option<Vec<String>> {
    let context = &context?.0;
    if let Some(ids) = context.get("deck_ids").and_then(Value::as_array) {
        return Some(ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());
    }
    context.get("deck_id").and_then(Value::as_str).map(|id| vec![id.to_string()])
}

fn history_prompt(history: &[ChatMessage], content: &str) -> String {
    let mut prompt = String::new();
    for message in history {
        let speaker = match message.role {
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
            ChatRole::System => "System",
        };
        prompt.push_str(&format!("{speaker}: {}\n\n", message.content));
    }
    prompt.push_str(content);
    prompt
}

#[derive(Clone)]
pub struct ChatService {
    pool: Arc<DbPool>,
    llm: Arc<dyn LlmBackend>,
    rag: RagService,
    limiter: Arc<SlidingWindowLimiter>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl ChatService {
    pub fn new(
        pool: Arc<DbPool>,
        llm: Arc<dyn LlmBackend>,
        rag: RagService,
        limiter: Arc<SlidingWindowLimiter>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            llm,
            rag,
            limiter,
            model: config.llm_default_model.clone(),
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        }
    }

    fn owned_session(&self, user_id: &str, session_id: &str) -> Result<ChatSession, ApiError> {
        let session = repo::get_chat_session(&self.pool, session_id)?.ok_or(ApiError::NotFound("Chat session"))?;
        if session.user_id != user_id {
            return Err(ApiError::PermissionDenied("You do not own this chat session".into()));
        }
        Ok(session)
    }

    pub fn create_session(&self, user_id: &str, title: Option<String>, context: Option<Value>) -> Result<ChatSession, ApiError> {
        let title = title.map(|t| t.trim().to_string()).unwrap_or_else(|| "New chat".to_string());
        if !(1..=255).contains(&title.chars().count()) {
            return Err(ApiError::Validation("title must be 1-255 characters".into()));
        }
        Ok(repo::insert_chat_session(&self.pool, ChatSession::new(user_id.to_string(), title, context))?)
    }

    pub fn list_sessions(&self, user_id: &str, offset: i64, limit: i64) -> Result<Page<ChatSession>, ApiError> {
        check_page(offset, limit)?;
        let (items, total) = repo::list_chat_sessions(&self.pool, user_id, offset, limit)?;
        Ok(Page { items, total, offset, limit })
    }

    pub fn get_session(&self, user_id: &str, session_id: &str) -> Result<SessionWithMessages, ApiError> {
        let session = self.owned_session(user_id, session_id)?;
        let messages = repo::list_chat_messages(&self.pool, session_id)?;
        Ok(SessionWithMessages { session, messages })
    }

    /// `context: Some(None)` clears the stored context
    pub fn update_session(
        &self,
        user_id: &str,
        session_id: &str,
        title: Option<String>,
        context: Option<Option<Value>>,
    ) -> Result<ChatSession, ApiError> {
        self.owned_session(user_id, session_id)?;
        let title = title.map(|t| t.trim().to_string());
        if title.as_ref().is_some_and(|t| !(1..=255).contains(&t.chars().count())) {
            return Err(ApiError::Validation("title must be 1-255 characters".into()));
        }
        let changes = ChatSessionChanges {
            title,
            context: context.map(|c| c.map(JsonValue)),
            updated_at: None,
        };
        repo::update_chat_session(&self.pool, session_id, changes)?.ok_or(ApiError::NotFound("Chat session"))
    }

    pub fn delete_session(&self, user_id: &str, session_id: &str) -> Result<(), ApiError> {
        self.owned_session(user_id, session_id)?;
        repo::delete_chat_session(&self.pool, session_id)?;
        Ok(())
    }

    /// Drops the session's messages; the session and its context stay
    #[instrument(skip(self))]
    pub fn clear_session(&self, user_id: &str, session_id: &str) -> Result<usize, ApiError> {
        self.owned_session(user_id, session_id)?;
        let deleted = repo::delete_chat_messages(&self.pool, session_id)?;
        info!("Cleared {} messages from chat session {}", deleted, session_id);
        Ok(deleted)
    }

    /// Checks the limit and ownership, then stores the user's message
    fn begin_turn(&self, user_id: &str, session_id: &str, request: SendMessage) -> Result<(Turn, ChatMessage), ApiError> {
        let content = request.content.trim().to_string();
        if content.is_empty() || content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ApiError::Validation(format!("content must be 1-{MAX_MESSAGE_CHARS} characters")));
        }
        let session = self.owned_session(user_id, session_id)?;
        self.limiter
            .check(user_id)
            .map_err(|retry_after| ApiError::RateLimited { retry_after })?;

        let history = repo::recent_chat_messages(&self.pool, session_id, HISTORY_LIMIT)?;
        let user_message = repo::insert_chat_message(
            &self.pool,
            ChatMessage::new(session_id.to_string(), ChatRole::User, content.clone(), Vec::new()),
        )?;

        let deck_ids = request.deck_ids.or_else(|| context_deck_ids(session.context.as_ref()));
        let turn = Turn { session, history, content, deck_ids, use_rag: request.use_rag };
        Ok((turn, user_message))
    }

    /// Cards relevant to the message; retrieval failures leave the reply without context
    async fn retrieve(&self, turn: &Turn) -> Vec<SearchHit> {
        if !turn.use_rag {
            return Vec::new();
        }
        let mut query = SearchQuery::new(turn.content.clone());
        query.k = CONTEXT_CARDS;
        query.threshold = CONTEXT_THRESHOLD;
        query.deck_ids = turn.deck_ids.clone();

        match self.rag.search(&turn.session.user_id, &query).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!("Chat context retrieval failed: {}", err);
                Vec::new()
            }
        }
    }

    async fn answer(&self, turn: &Turn) -> Result<(ChatMessage, Vec<ChatSource>), ApiError> {
        let hits = self.retrieve(turn).await;

        let mut system = SYSTEM_PROMPT.to_string();
        if !hits.is_empty() {
            let context: Vec<String> = hits
                .iter()
                .map(|hit| format!("Card (relevance {:.2}):\n{}", hit.similarity, hit.content_text))
                .collect();
            system.push_str("\n\nRelevant context from the user's cards:\n");
            system.push_str(&context.join("\n\n"));
        }

        let request = LlmRequest::new(self.model.clone(), system, history_prompt(&turn.history, &turn.content))
            .temperature(self.temperature)
            .max_tokens(self.max_tokens);
        let response = self.llm.generate(request).await?;

        let sources: Vec<ChatSource> = hits.iter().map(ChatSource::from).collect();
        let mut message = ChatMessage::new(
            turn.session.id.clone(),
            ChatRole::Assistant,
            response.content,
            sources.iter().map(|s| s.card_id.clone()).collect(),
        );
        message.tokens = i32::try_from(response.output_tokens).ok();
        let message = repo::insert_chat_message(&self.pool, message)?;
        Ok((message, sources))
    }

    /// Answers one message and stores both sides of the exchange
    #[instrument(skip(self, request))]
    pub async fn send_message(&self, user_id: &str, session_id: &str, request: SendMessage) -> Result<ChatReply, ApiError> {
        let (turn, user_message) = self.begin_turn(user_id, session_id, request)?;
        let (assistant_message, sources) = self.answer(&turn).await?;
        info!("Chat reply with {} sources", sources.len());
        Ok(ChatReply { user_message, assistant_message, sources })
    }

    /// Same as `send_message`, delivered as `chunk` events and a final `done`
    ///
    /// Validation, ownership and rate limiting fail before the stream starts;
    /// later failures arrive as an `error` event.
    pub fn stream_message(
        &self,
        user_id: &str,
        session_id: &str,
        request: SendMessage,
    ) -> Result<impl Stream<Item = ChatEvent> + Send + 'static + use<>, ApiError> {
        let (turn, _) = self.begin_turn(user_id, session_id, request)?;
        let service = self.clone();

        Ok(stream! {
            match service.answer(&turn).await {
                Ok((message, sources)) => {
                    for content in chunks(&message.content) {
                        yield ChatEvent::Chunk { content };
                    }
                    yield ChatEvent::Done { message_id: message.id, sources, tokens: message.tokens };
                }
                Err(err) => {
                    warn!("Streamed chat reply failed: {}", err);
                    yield ChatEvent::Error { error: err.to_string() };
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::base_config;
    use crate::llm::LlmError;
    use crate::test_utils::{ScriptedLlm, seed_card, seed_deck, seed_user, setup_test_db};
    use futures::StreamExt;
    use std::time::Duration;

    fn service(pool: &Arc<DbPool>, llm: &Arc<ScriptedLlm>, limit: usize) -> ChatService {
        let rag = RagService::new(pool.clone(), llm.clone(), "multilingual-e5-large".into(), 16);
        let limiter = Arc::new(SlidingWindowLimiter::new(limit, Duration::from_secs(3600)));
        ChatService::new(pool.clone(), llm.clone(), rag, limiter, &base_config(None))
    }

    fn message(content: &str) -> SendMessage {
        SendMessage { content: content.into(), use_rag: true, deck_ids: None }
    }

    #[test]
    fn test_chunks_keep_text() {
        let text = "one two three four five six seven eight nine ten";
        let parts = chunks(text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.concat(), text);
        assert!(chunks("").is_empty());
    }

    #[test]
    fn test_context_deck_ids() {
        let many = JsonValue(serde_json::json!({ "deck_ids": ["a", "b"] }));
        assert_eq!(context_deck_ids(Some(&many)), Some(vec!["a".to_string(), "b".to_string()]));
        let one = JsonValue(serde_json::json!({ "deck_id": "c" }));
        assert_eq!(context_deck_ids(Some(&one)), Some(vec!["c".to_string()]));
        assert_eq!(context_deck_ids(None), None);
    }

    #[tokio::test]
    async fn test_send_message_uses_cards_and_history() {
        let pool = setup_test_db();
        let llm = ScriptedLlm::shared("Ownership means one owner per value.");
        let chat = service(&pool, &llm, 10);
        let user = seed_user(&pool, "chat@example.com");
        let deck = seed_deck(&pool, &user, "Rust");
        let card = seed_card(&pool, &deck, "What is ownership in Rust?", "One owner per value");
        let rag = RagService::new(pool.clone(), llm.clone(), "multilingual-e5-large".into(), 16);
        rag.index_cards(&user.get_id(), &[card.get_id()], false).await.unwrap();

        let session = chat.create_session(&user.get_id(), None, None).unwrap();
        assert_eq!(session.title, "New chat");

        chat.send_message(&user.get_id(), &session.id, message("hello")).await.unwrap();
        // same words as the indexed card text, so the vectors match exactly
        let question = "Question: What is ownership in Rust? Answer: One owner per value";
        let reply = chat.send_message(&user.get_id(), &session.id, message(question)).await.unwrap();

        assert_eq!(reply.assistant_message.content, "Ownership means one owner per value.");
        assert_eq!(reply.sources.len(), 1);
        assert_eq!(reply.sources[0].card_id, card.get_id());
        assert_eq!(reply.assistant_message.sources.0, vec![card.get_id()]);

        let last = llm.requests.lock().unwrap().last().cloned().unwrap();
        assert!(last.system_prompt.contains("Relevant context"));
        assert!(last.user_prompt.starts_with("User: hello"));
        assert!(last.user_prompt.ends_with(question));

        let stored = chat.get_session(&user.get_id(), &session.id).unwrap();
        assert_eq!(stored.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_send_message_rate_limited_and_owned() {
        let pool = setup_test_db();
        let llm = ScriptedLlm::shared("ok");
        let chat = service(&pool, &llm, 1);
        let user = seed_user(&pool, "limit@example.com");
        let other = seed_user(&pool, "nosy@example.com");
        let session = chat.create_session(&user.get_id(), Some("Study".into()), None).unwrap();

        assert!(matches!(
            chat.send_message(&other.get_id(), &session.id, message("hi")).await,
            Err(ApiError::PermissionDenied(_))
        ));
        assert!(matches!(
            chat.send_message(&user.get_id(), &session.id, message("   ")).await,
            Err(ApiError::Validation(_))
        ));

        chat.send_message(&user.get_id(), &session.id, message("one")).await.unwrap();
        let err = chat.send_message(&user.get_id(), &session.id, message("two")).await.unwrap_err();
        assert_eq!(err.code(), "RATE_001");
    }

    #[tokio::test]
    async fn test_stream_message_events() {
        let pool = setup_test_db();
        let llm = ScriptedLlm::shared("a b c d e f g h i j");
        let chat = service(&pool, &llm, 10);
        let user = seed_user(&pool, "stream@example.com");
        let session = chat.create_session(&user.get_id(), None, None).unwrap();

        let mut request = message("tell me");
        request.use_rag = false;
        let events: Vec<ChatEvent> = chat
            .stream_message(&user.get_id(), &session.id, request)
            .unwrap()
            .collect()
            .await;

        let names: Vec<&str> = events.iter().map(ChatEvent::name).collect();
        assert_eq!(names, vec!["chunk", "chunk", "done"]);
        assert_eq!(llm.embed_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_message_reports_llm_errors() {
        let pool = setup_test_db();
        let llm = ScriptedLlm::shared("unused");
        llm.push_error(LlmError::Timeout);
        let chat = service(&pool, &llm, 10);
        let user = seed_user(&pool, "stream-err@example.com");
        let session = chat.create_session(&user.get_id(), None, None).unwrap();

        let events: Vec<ChatEvent> = chat
            .stream_message(&user.get_id(), &session.id, message("hi"))
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "error");
    }

    #[test]
    fn test_session_crud() {
        let pool = setup_test_db();
        let llm = ScriptedLlm::shared("");
        let chat = service(&pool, &llm, 10);
        let user = seed_user(&pool, "crud@example.com");
        let uid = user.get_id();

        let session = chat
            .create_session(&uid, Some("Rust".into()), Some(serde_json::json!({ "deck_id": "d1" })))
            .unwrap();
        let updated = chat.update_session(&uid, &session.id, Some("Rust 2".into()), Some(None)).unwrap();
        assert_eq!(updated.title, "Rust 2");
        assert_eq!(updated.context, None);

        assert_eq!(chat.list_sessions(&uid, 0, 20).unwrap().total, 1);
        let other = seed_user(&pool, "nosy@example.com");
        assert!(chat.clear_session(&other.get_id(), &session.id).is_err());
        assert_eq!(chat.clear_session(&uid, &session.id).unwrap(), 0);
        chat.delete_session(&uid, &session.id).unwrap();
        assert!(matches!(chat.get_session(&uid, &session.id), Err(ApiError::NotFound(_))));
    }
}
