use crate::db::DbPool;
use crate::models::{ChatMessage, ChatSession, JsonValue};
use crate::schema::{chat_messages, chat_sessions};
use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;

#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = chat_sessions)]
pub struct ChatSessionChanges {
    pub title: Option<String>,
    pub context: Option<Option<JsonValue>>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Inserts a new chat session
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `session` - The session to insert
///
/// ### Returns
///
/// The inserted session
pub fn insert_chat_session(pool: &DbPool, session: ChatSession) -> Result<ChatSession> {
    let conn = &mut pool.get()?;

    diesel::insert_into(chat_sessions::table)
        .values(&session)
        .execute(conn)?;

    Ok(session)
}

pub fn get_chat_session(pool: &DbPool, session_id: &str) -> Result<Option<ChatSession>> {
    let conn = &mut pool.get()?;

    let session = chat_sessions::table
        .find(session_id)
        .first::<ChatSession>(conn)
        .optional()?;

    Ok(session)
}

/// A user's sessions, most recently active first
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `user_id` - The owner of the sessions
/// * `offset` - Number of sessions to skip
/// * `limit` - Maximum number of sessions to return
///
/// ### Returns
///
/// The requested page and the total number of sessions of the user
pub fn list_chat_sessions(
    pool: &DbPool,
    user_id: &str,
    offset: i64,
    limit: i64,
) -> Result<(Vec<ChatSession>, i64)> {
    let conn = &mut pool.get()?;

    let total = chat_sessions::table
        .filter(chat_sessions::user_id.eq(user_id))
        .count()
        .get_result::<i64>(conn)?;

    let page = chat_sessions::table
        .filter(chat_sessions::user_id.eq(user_id))
        .order(chat_sessions::updated_at.desc())
        .offset(offset)
        .limit(limit)
        .load::<ChatSession>(conn)?;

    Ok((page, total))
}

/// Applies `changes` to a session and bumps its `updated_at`
///
/// ### Returns
///
/// The updated session, or None if no session has that id
pub fn update_chat_session(
    pool: &DbPool,
    session_id: &str,
    mut changes: ChatSessionChanges,
) -> Result<Option<ChatSession>> {
    let conn = &mut pool.get()?;
    changes.updated_at = Some(Utc::now().naive_utc());

    let session = diesel::update(chat_sessions::table.find(session_id))
        .set(&changes)
        .get_result::<ChatSession>(conn)
        .optional()?;

    Ok(session)
}

/// Deletes a session; its messages go with it through the foreign key
pub fn delete_chat_session(pool: &DbPool, session_id: &str) -> Result<bool> {
    let conn = &mut pool.get()?;

    let deleted = diesel::delete(chat_sessions::table.find(session_id)).execute(conn)?;

    Ok(deleted > 0)
}

/// Deletes every message of a session, keeping the session itself
///
/// ### Returns
///
/// Number of messages deleted
pub fn delete_chat_messages(pool: &DbPool, session_id: &str) -> Result<usize> {
    let conn = &mut pool.get()?;

    let deleted = conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let deleted = diesel::delete(chat_messages::table.filter(chat_messages::session_id.eq(session_id)))
            .execute(conn)?;
        diesel::update(chat_sessions::table.find(session_id))
            .set(chat_sessions::updated_at.eq(Utc::now().naive_utc()))
            .execute(conn)?;
        Ok(deleted)
    })?;

    Ok(deleted)
}

/// Appends a message and bumps the session's `updated_at`
///
/// Both writes happen in one transaction.
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `message` - The message to store
///
/// ### Returns
///
/// The stored message
///
/// ### Errors
///
/// Returns an error if:
/// - Unable to get a connection from the pool
/// - The session does not exist
/// - Either write fails, in which case neither is kept
pub fn insert_chat_message(pool: &DbPool, message: ChatMessage) -> Result<ChatMessage> {
    let conn = &mut pool.get()?;

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(chat_messages::table)
            .values(&message)
            .execute(conn)?;
        diesel::update(chat_sessions::table.find(&message.session_id))
            .set(chat_sessions::updated_at.eq(message.created_at))
            .execute(conn)?;
        Ok(())
    })?;

    Ok(message)
}

/// All messages of a session in chronological order
pub fn list_chat_messages(pool: &DbPool, session_id: &str) -> Result<Vec<ChatMessage>> {
    let conn = &mut pool.get()?;

    let messages = chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .order((chat_messages::created_at.asc(), chat_messages::id.asc()))
        .load::<ChatMessage>(conn)?;

    Ok(messages)
}

/// The last `limit` messages of a session, oldest first
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `session_id` - The session to read
/// * `limit` - How many of the newest messages to return
///
/// ### Returns
///
/// Up to `limit` messages in chronological order, ready to be used as history
pub fn recent_chat_messages(pool: &DbPool, session_id: &str, limit: i64) -> Result<Vec<ChatMessage>> {
    let conn = &mut pool.get()?;

    let mut messages = chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .order(chat_messages::created_at.desc())
        .limit(limit)
        .load::<ChatMessage>(conn)?;
    messages.reverse();

    Ok(messages)
}
