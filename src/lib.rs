/// AnkiRAG: flashcard generation and review backed by retrieval
///
/// This library provides the server side of AnkiRAG: user accounts, decks
/// and cards, an LLM generation pipeline grounded on the user's own cards,
/// retrieval-augmented chat, and synchronisation with the Anki desktop
/// application through AnkiConnect.
///
/// ### Modules
///
/// - `db`: Database connection management
/// - `models`: Data structures stored in SQLite
/// - `repo`: Repository layer for database operations
/// - `services`: Ownership and business rules on top of the repository
/// - `rag`, `generation`, `llm`: Embeddings, search and card generation
/// - `anki`: AnkiConnect client
/// - `apkg`: Anki package reader for file imports
/// - `handlers`: Axum handlers for the REST API
///
/// ### Web API
///
/// Every route except the auth entry points and the health checks lives
/// under `/api` and requires a bearer access token.

/// AnkiConnect client
pub mod anki;

/// Reader for `.apkg` package exports
pub mod apkg;

/// Tokens, password hashing and the auth middleware
pub mod auth;

/// Configuration module
pub mod config;

/// Database connection module
pub mod db;

/// Request and query bodies of the REST API
pub mod dto;

/// API error type and its JSON rendering
pub mod errors;

/// Card generation jobs
pub mod generation;

/// REST API handlers
pub mod handlers;

/// LLM service client
pub mod llm;

/// Data models module
pub mod models;

/// Embedding index and search
pub mod rag;

/// Sliding-window rate limiting
pub mod rate_limit;

/// Repository module for database operations
pub mod repo;

/// Database schema module
pub mod schema;

/// Business rules behind the handlers
pub mod services;

/// Background task queue
pub mod worker;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use secrecy::SecretString;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::anki::AnkiClient;
use crate::auth::{JwtService, require_auth};
use crate::config::Config;
use crate::db::DbPool;
use crate::generation::{GenerationService, JobHub, Pipeline};
use crate::handlers::*;
use crate::llm::{LlmBackend, SopLlmClient};
use crate::rag::RagService;
use crate::rate_limit::SlidingWindowLimiter;
use crate::services::chat::ChatService;
use crate::worker::{QueueSettings, TaskQueue};

/// How often expired refresh tokens and idle rate-limit keys are dropped
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<DbPool>,
    pub config: Arc<Config>,
    pub jwt: Arc<JwtService>,
    pub llm: Arc<dyn LlmBackend>,
    pub anki: AnkiClient,
    pub rag: RagService,
    pub generation: GenerationService,
    pub chat: ChatService,
    limiters: Vec<Arc<SlidingWindowLimiter>>,
}

impl AppState {
    /// Wires the services around an existing pool and LLM backend
    ///
    /// Starts the background task queue, so it must run inside a Tokio
    /// runtime.
    pub fn new(pool: Arc<DbPool>, config: Config, llm: Arc<dyn LlmBackend>, anki: AnkiClient) -> Self {
        let jwt = Arc::new(JwtService::new(
            SecretString::from(config.jwt_secret.clone()),
            config.access_token_ttl(),
            config.refresh_token_ttl(),
        ));
        let rag = RagService::new(
            pool.clone(),
            llm.clone(),
            config.embedding_model.clone(),
            config.embedding_batch_size,
        );

        let pipeline = Pipeline::new(pool.clone(), llm.clone(), rag.clone(), Arc::new(JobHub::new()), &config);
        let generation_limiter = Arc::new(SlidingWindowLimiter::new(
            config.generation_rate_limit,
            Duration::from_secs(config.generation_rate_window_seconds),
        ));
        let generation = GenerationService::new(
            pool.clone(),
            TaskQueue::start(QueueSettings::from_config(&config)),
            generation_limiter.clone(),
            pipeline,
        );

        let chat_limiter = Arc::new(SlidingWindowLimiter::new(
            config.chat_rate_limit,
            Duration::from_secs(config.chat_rate_window_seconds),
        ));
        let chat = ChatService::new(pool.clone(), llm.clone(), rag.clone(), chat_limiter.clone(), &config);

        Self {
            pool,
            config: Arc::new(config),
            jwt,
            llm,
            anki,
            rag,
            generation,
            chat,
            limiters: vec![generation_limiter, chat_limiter],
        }
    }

    /// Deletes expired refresh tokens and forgets idle rate-limit keys
    pub fn housekeeping(&self) -> anyhow::Result<()> {
        let tokens = repo::purge_expired_tokens(&self.pool, chrono::Utc::now().naive_utc())?;
        let keys: usize = self.limiters.iter().map(|limiter| limiter.purge()).sum();
        debug!("housekeeping removed {} expired tokens and {} idle rate-limit keys", tokens, keys);
        Ok(())
    }

    /// Runs `housekeeping` every `HOUSEKEEPING_INTERVAL` in the background
    pub fn spawn_housekeeping(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = state.housekeeping() {
                    warn!("housekeeping failed: {:#}", e);
                }
            }
        })
    }

    /// Opens the database, applies migrations and connects the HTTP clients
    /// named in `config`
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let pool = db::init_pool(&config.database_url)?;
        {
            let mut conn = pool.get()?;
            run_migrations(&mut conn)?;
        }

        let llm = SopLlmClient::new(&config.llm_base_url, Duration::from_secs(config.llm_timeout_seconds))?;
        let anki = AnkiClient::new(&config.anki_connect_url)?;
        info!("Using LLM service at {} and AnkiConnect at {}", config.llm_base_url, config.anki_connect_url);

        let state = Self::new(Arc::new(pool), config, Arc::new(llm), anki);
        state.spawn_housekeeping();
        Ok(state)
    }
}

/// Builds the CORS layer from the configured origins
///
/// `*` allows every origin; entries that are not valid header values are
/// skipped.
fn cors_layer(config: &Config) -> CorsLayer {
    let origins = config.cors_origin_list();
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin {:?}", origin);
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Creates the application router
///
/// ### Arguments
///
/// * `state` - The shared application state
///
/// ### Returns
///
/// The router with public routes, the authenticated `/api` routes and CORS
pub fn create_app(state: AppState) -> Router {
    let public = Router::new()
        // Account creation and token exchange
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler));

    let protected = Router::new()
        .route("/auth/logout-all", post(logout_all_handler))
        .route("/auth/me", get(auth_me_handler))
        // Users
        .route("/users", get(list_users_handler))
        .route("/users/me", get(get_me_handler).patch(update_me_handler))
        .route("/users/me/preferences", patch(update_preferences_handler))
        .route("/users/{id}", get(get_user_handler).delete(delete_user_handler))
        .route("/users/{id}/activate", post(activate_user_handler))
        .route("/users/{id}/deactivate", post(deactivate_user_handler))
        // Decks
        .route("/decks", post(create_deck_handler).get(list_decks_handler))
        .route("/decks/tree", get(deck_tree_handler))
        .route(
            "/decks/{id}",
            get(get_deck_handler).patch(update_deck_handler).delete(delete_deck_handler),
        )
        .route("/decks/{id}/cards", get(list_deck_cards_handler))
        .route("/decks/{id}/restore", post(restore_deck_handler))
        .route("/decks/{id}/ancestors", get(deck_ancestors_handler))
        .route("/decks/{id}/descendants", get(deck_descendants_handler))
        // Cards
        .route("/cards", post(create_card_handler).get(list_cards_handler))
        .route("/cards/bulk", post(bulk_create_cards_handler))
        .route("/cards/bulk/approve", post(bulk_approve_handler))
        .route("/cards/bulk/reject", post(bulk_reject_handler))
        .route(
            "/cards/{id}",
            get(get_card_handler).patch(update_card_handler).delete(delete_card_handler),
        )
        .route("/cards/{id}/restore", post(restore_card_handler))
        .route("/cards/{id}/approve", post(approve_card_handler))
        .route("/cards/{id}/reject", post(reject_card_handler))
        .route("/cards/{id}/synced", post(mark_synced_handler))
        .route("/cards/{id}/sync-failed", post(mark_sync_failed_handler))
        .route("/cards/{id}/similar", get(similar_cards_handler))
        // Templates
        .route("/templates", post(create_template_handler).get(list_templates_handler))
        .route(
            "/templates/{id}",
            get(get_template_handler).patch(update_template_handler).delete(delete_template_handler),
        )
        // Prompts
        .route("/prompts", post(create_prompt_handler).get(list_prompts_handler))
        .route(
            "/prompts/{id}",
            get(get_prompt_handler).patch(update_prompt_handler).delete(delete_prompt_handler),
        )
        .route("/prompts/{id}/versions", get(prompt_versions_handler))
        .route("/prompts/{id}/render", post(render_prompt_handler))
        // Model registry
        .route("/models/llm", get(list_llm_models_handler))
        .route("/models/embedding", get(list_embedding_models_handler))
        .route("/models/available", get(available_models_handler))
        // Retrieval
        .route("/rag/search", post(search_handler))
        .route("/rag/index", post(index_handler))
        .route("/rag/index/{card_id}", delete(remove_from_index_handler))
        .route("/rag/reindex", post(reindex_handler))
        .route("/rag/duplicates", post(check_duplicates_handler))
        .route("/rag/similar/{card_id}", get(similar_cards_handler))
        .route("/rag/stats", get(index_stats_handler))
        // Generation
        .route("/generation", post(start_generation_handler))
        .route("/generation/jobs", get(list_jobs_handler))
        .route("/generation/jobs/{id}", get(get_job_handler))
        .route("/generation/jobs/{id}/status", get(job_status_handler))
        .route("/generation/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/generation/jobs/{id}/stream", get(stream_job_handler))
        // Chat
        .route("/chat/sessions", post(create_session_handler).get(list_sessions_handler))
        .route(
            "/chat/sessions/{id}",
            get(get_session_handler).patch(update_session_handler).delete(delete_session_handler),
        )
        .route("/chat/sessions/{id}/clear", post(clear_session_handler))
        .route("/chat/sessions/{id}/messages", post(send_message_handler))
        .route("/chat/sessions/{id}/stream", post(stream_message_handler))
        // Sync with Anki
        .route("/sync/push", post(push_handler))
        .route("/sync/execute/{id}", post(execute_handler))
        .route("/sync/pull", post(pull_handler))
        .route("/sync/status", get(sync_status_handler))
        .route("/sync/complete", post(complete_handler))
        .route("/sync/history", get(history_handler))
        .route("/sync/import/cards", post(import_cards_handler))
        .route(
            "/sync/import",
            post(import_apkg_handler).layer(DefaultBodyLimit::max(apkg::MAX_PACKAGE_BYTES)),
        )
        .route(
            "/sync/import/stream",
            post(import_apkg_stream_handler).layer(DefaultBodyLimit::max(apkg::MAX_PACKAGE_BYTES)),
        )
        // Every route above needs a valid access token
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .nest("/api", public.merge(protected))
        .layer(cors)
        .with_state(state)
}

/// Runs the embedded migrations
///
/// ### Arguments
///
/// * `conn` - A mutable reference to a SQLite connection
pub fn run_migrations(conn: &mut diesel::SqliteConnection) -> anyhow::Result<()> {
    use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

    // Define the embedded migrations
    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("failed to run migrations: {e}"))?;
    if !applied.is_empty() {
        info!("Applied {} migrations", applied.len());
    }
    Ok(())
}
