use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use super::generation_handlers::sse_event;
use crate::apkg;
use crate::auth::CurrentUser;
use crate::dto::{HistoryQuery, SyncPushRequest};
use crate::errors::ApiError;
use crate::models::SyncRun;
use crate::services::cards;
use crate::services::sync::{
    self, AgentReport, ImportProgress, ImportRequest, ImportResult, ImportStage, PackageImportOptions, PullRequest,
    PullResponse, PushReceipt, SyncOverview, SyncResult,
};
use crate::AppState;

/// Handler for queueing cards for a server-side sync
///
/// This function handles POST requests to `/api/sync/push`.
///
/// ### Returns
///
/// `202 Accepted` with the run id; `/api/sync/execute/{id}` performs it
#[instrument(skip(state, user, payload), fields(count = payload.cards.len()))]
pub async fn push_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<SyncPushRequest>,
) -> Result<(StatusCode, Json<PushReceipt>), ApiError> {
    let receipt = sync::push(&state.pool, &user.get_id(), payload.cards)?;
    info!("Queued sync run {}", receipt.sync_id);
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Handler for pushing a queued run into Anki
///
/// This function handles POST requests to `/api/sync/execute/{id}`. Cards
/// are added one by one and failures do not undo earlier cards.
#[instrument(skip(state, user))]
pub async fn execute_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(sync_id): Path<String>,
) -> Result<Json<SyncResult>, ApiError> {
    let result = sync::execute(&state.pool, &state.anki, &user.get_id(), &sync_id).await?;
    Ok(Json(result))
}

#[instrument(skip(state, user, payload))]
pub async fn pull_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<PullRequest>,
) -> Result<Json<PullResponse>, ApiError> {
    Ok(Json(sync::pull(&state.pool, &user.get_id(), payload)?))
}

pub async fn sync_status_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<SyncOverview>, ApiError> {
    Ok(Json(sync::status(&state.pool, &state.anki, &user.get_id()).await?))
}

/// Handler for the agent's end-of-sync report
///
/// This function handles POST requests to `/api/sync/complete`.
#[instrument(skip(state, user, payload), fields(synced = payload.cards_synced, failed = payload.cards_failed))]
pub async fn complete_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<AgentReport>,
) -> Result<Json<SyncRun>, ApiError> {
    let run = sync::complete(&state.pool, &user.get_id(), payload)?;
    if run.failed_cards > 0 {
        warn!("Agent reported {} failed cards", run.failed_cards);
    }
    Ok(Json(run))
}

pub async fn history_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SyncRun>>, ApiError> {
    Ok(Json(sync::history(&state.pool, &user.get_id(), query.limit)?))
}

/// Handler for importing notes read from Anki by the agent
///
/// This function handles POST requests to `/api/sync/import/cards`.
///
/// ### Arguments
///
/// * `state` - The application state
/// * `user` - The authenticated user
/// * `payload` - Target deck by id or name, the notes and whether they count
///   as synced
///
/// ### Returns
///
/// Counts of imported, skipped and failed notes with status 201
#[instrument(skip(state, user, payload), fields(count = payload.cards.len()))]
pub async fn import_cards_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<ImportRequest>,
) -> Result<(StatusCode, Json<ImportResult>), ApiError> {
    let user_id = user.get_id();
    let result = sync::import_cards(&state.pool, &user_id, payload)?;

    if !result.card_ids.is_empty() {
        cards::refresh_index(&state.rag, &user_id, &result.card_ids).await;
    }
    info!(
        "Imported {} of {} cards into {}",
        result.imported_cards, result.total_cards, result.deck_name
    );
    Ok((StatusCode::CREATED, Json(result)))
}

/// An `.apkg` upload and the form fields sent with it
struct PackageUpload {
    file_name: String,
    bytes: Bytes,
    options: PackageImportOptions,
}

fn bad_form(err: MultipartError) -> ApiError {
    ApiError::Validation(format!("invalid upload: {}", err.body_text()))
}

/// Reads the `file` part and the optional `deck_id`, `tags` and
/// `mark_as_synced` parts of an upload form
async fn read_upload(mut multipart: Multipart) -> Result<PackageUpload, ApiError> {
    let mut file = None;
    let mut options = PackageImportOptions::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                if !file_name.to_lowercase().ends_with(".apkg") {
                    return Err(ApiError::Validation("file must be an .apkg export".to_string()));
                }
                let bytes = field.bytes().await.map_err(bad_form)?;
                file = Some((file_name, bytes));
            }
            "deck_id" => {
                let deck_id = field.text().await.map_err(bad_form)?;
                options.deck_id = Some(deck_id.trim().to_string()).filter(|id| !id.is_empty());
            }
            "tags" => options.tags = PackageImportOptions::parse_tags(&field.text().await.map_err(bad_form)?),
            "mark_as_synced" => {
                let flag = field.text().await.map_err(bad_form)?;
                options.mark_as_synced = matches!(flag.trim(), "true" | "1" | "on");
            }
            _ => {}
        }
    }

    let (file_name, bytes) = file.ok_or_else(|| ApiError::Validation("no package file provided".to_string()))?;
    Ok(PackageUpload { file_name, bytes, options })
}

/// Handler for importing an Anki package export
///
/// This function handles multipart POST requests to `/api/sync/import`.
///
/// ### Arguments
///
/// * `state` - The application state
/// * `user` - The authenticated user
/// * `multipart` - A `file` part holding the `.apkg`, plus optional
///   `deck_id`, comma-separated `tags` and `mark_as_synced` parts
///
/// ### Returns
///
/// The import tally with status 201; imported cards are indexed for search
#[instrument(skip(state, user, multipart))]
pub async fn import_apkg_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<ImportResult>), ApiError> {
    let upload = read_upload(multipart).await?;
    let user_id = user.get_id();
    info!("Importing {} ({} bytes)", upload.file_name, upload.bytes.len());

    let pool = state.pool.clone();
    let owner = user_id.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<ImportResult, ApiError> {
        let package = apkg::parse_apkg(&upload.bytes)?;
        sync::import_package(&pool, &owner, package, upload.options, |_| {})
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    if !result.card_ids.is_empty() {
        cards::refresh_index(&state.rag, &user_id, &result.card_ids).await;
    }
    Ok((StatusCode::CREATED, Json(result)))
}

/// Handler for importing an Anki package while streaming progress
///
/// This function handles multipart POST requests to `/api/sync/import/stream`
/// and takes the same form as `/api/sync/import`. Upload errors are plain
/// error responses; once the stream is open it sends `progress` events, then
/// one `complete` event with the tally or one `error` event.
#[instrument(skip(state, user, multipart))]
pub async fn import_apkg_stream_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    multipart: Multipart,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let upload = read_upload(multipart).await?;
    let user_id = user.get_id();
    info!("Streaming import of {} ({} bytes)", upload.file_name, upload.bytes.len());

    let (tx, mut rx) = mpsc::unbounded_channel::<ImportProgress>();
    let pool = state.pool.clone();
    let owner = user_id.clone();
    let task = tokio::task::spawn_blocking(move || -> Result<ImportResult, ApiError> {
        // A closed channel only means the client went away
        let _ = tx.send(ImportProgress::new(ImportStage::Parsing, 0, 0, format!("Reading {}", upload.file_name)));
        let package = apkg::parse_apkg(&upload.bytes)?;
        sync::import_package(&pool, &owner, package, upload.options, |progress| {
            let _ = tx.send(progress);
        })
    });

    let rag = state.rag.clone();
    let stream = async_stream::stream! {
        while let Some(progress) = rx.recv().await {
            yield Ok(sse_event("progress", None, &progress));
        }
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) => Err(ApiError::Internal(err.to_string())),
        };
        match outcome {
            Ok(result) => {
                if !result.card_ids.is_empty() {
                    cards::refresh_index(&rag, &user_id, &result.card_ids).await;
                }
                yield Ok(sse_event("complete", None, &result));
            }
            Err(err) => {
                error!("Package import failed: {}", err);
                yield Ok(sse_event("error", None, &json!({ "error": err.to_string(), "code": err.code() })));
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
