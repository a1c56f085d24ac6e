use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::generation_handlers::sse_event;
use crate::auth::CurrentUser;
use crate::dto::{CreateSessionRequest, PageQuery, UpdateSessionRequest};
use crate::errors::ApiError;
use crate::models::ChatSession;
use crate::services::chat::{ChatReply, SendMessage, SessionWithMessages};
use crate::services::Page;
use crate::AppState;

/// Handler for opening a chat session
///
/// This function handles POST requests to `/api/chat/sessions`. `context`
/// may carry `deck_id` or `deck_ids` to scope retrieval for the session.
#[instrument(skip(state, user, payload))]
pub async fn create_session_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<ChatSession>), ApiError> {
    let session = state.chat.create_session(&user.get_id(), payload.title, payload.context)?;
    info!("Created chat session with id: {}", session.id);
    Ok((StatusCode::CREATED, Json(session)))
}

#[instrument(skip(state, user))]
pub async fn list_sessions_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<ChatSession>>, ApiError> {
    let sessions = state.chat.list_sessions(&user.get_id(), page.offset, page.limit)?;
    debug!("Retrieved {} chat sessions", sessions.items.len());
    Ok(Json(sessions))
}

pub async fn get_session_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionWithMessages>, ApiError> {
    Ok(Json(state.chat.get_session(&user.get_id(), &session_id)?))
}

#[instrument(skip(state, user, payload))]
pub async fn update_session_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(session_id): Path<String>,
    Json(payload): Json<UpdateSessionRequest>,
) -> Result<Json<ChatSession>, ApiError> {
    let session = state
        .chat
        .update_session(&user.get_id(), &session_id, payload.title, payload.context)?;
    Ok(Json(session))
}

#[instrument(skip(state, user))]
pub async fn delete_session_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.chat.delete_session(&user.get_id(), &session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct ClearedSession {
    pub message: String,
    pub deleted_messages: usize,
}

/// Handler for wiping a session's history
///
/// This function handles POST requests to `/api/chat/sessions/{id}/clear`.
/// The session keeps its title and context.
#[instrument(skip(state, user))]
pub async fn clear_session_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<Json<ClearedSession>, ApiError> {
    let deleted_messages = state.chat.clear_session(&user.get_id(), &session_id)?;
    Ok(Json(ClearedSession {
        message: "Conversation cleared".to_string(),
        deleted_messages,
    }))
}

/// Handler for sending a message and waiting for the full reply
///
/// This function handles POST requests to `/api/chat/sessions/{id}/messages`.
///
/// ### Returns
///
/// Both stored messages and the cards quoted as sources
#[instrument(skip(state, user, payload), fields(use_rag = payload.use_rag))]
pub async fn send_message_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(session_id): Path<String>,
    Json(payload): Json<SendMessage>,
) -> Result<Json<ChatReply>, ApiError> {
    let reply = state.chat.send_message(&user.get_id(), &session_id, payload).await?;
    Ok(Json(reply))
}

/// Handler for sending a message and streaming the reply
///
/// This function handles POST requests to `/api/chat/sessions/{id}/stream`.
/// The reply arrives as `chunk` events followed by one `done` event.
#[instrument(skip(state, user, payload))]
pub async fn stream_message_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(session_id): Path<String>,
    Json(payload): Json<SendMessage>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.chat.stream_message(&user.get_id(), &session_id, payload)?;
    let stream = events.map(|event| Ok(sse_event(event.name(), None, &event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
