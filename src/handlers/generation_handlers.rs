use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::auth::CurrentUser;
use crate::dto::{JobListQuery, StreamQuery, parse_resume_token};
use crate::errors::ApiError;
use crate::generation::{GenerationRequest, JobStatusView};
use crate::models::GenerationJob;
use crate::AppState;

/// Builds an SSE event carrying `payload` as JSON
pub(crate) fn sse_event(name: &str, id: Option<&str>, payload: &impl Serialize) -> Event {
    let event = Event::default().event(name);
    let event = match id {
        Some(id) => event.id(id),
        None => event,
    };
    match serde_json::to_string(payload) {
        Ok(data) => event.data(data),
        Err(err) => Event::default().event("error").data(json!({ "error": err.to_string() }).to_string()),
    }
}

/// Handler for starting a generation job
///
/// This function handles POST requests to `/api/generation`.
///
/// ### Arguments
///
/// * `state` - The application state
/// * `user` - The authenticated user
/// * `payload` - Topic, card type, count and the other generation options
///
/// ### Returns
///
/// `202 Accepted` with the job id and status. A repeated idempotency key
/// returns the job created the first time.
#[instrument(skip(state, user, payload), fields(user_id = %user.get_id(), topic = %payload.topic))]
pub async fn start_generation_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let outcome = state.generation.start(&user.get_id(), payload).await?;

    info!("Generation job {} (existing: {})", outcome.job.get_id(), outcome.existing);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": outcome.job.get_id(),
            "status": outcome.job.get_status(),
        })),
    ))
}

#[instrument(skip(state, user))]
pub async fn list_jobs_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<GenerationJob>>, ApiError> {
    let jobs = state.generation.list(&user.get_id(), query.limit)?;
    debug!("Retrieved {} jobs", jobs.len());
    Ok(Json(jobs))
}

#[instrument(skip(state, user))]
pub async fn get_job_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(job_id): Path<String>,
) -> Result<Json<GenerationJob>, ApiError> {
    Ok(Json(state.generation.get(&user.get_id(), &job_id)?))
}

pub async fn job_status_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusView>, ApiError> {
    Ok(Json(state.generation.status(&user.get_id(), &job_id)?))
}

/// Handler for cancelling a job
///
/// This function handles POST requests to `/api/generation/jobs/{id}/cancel`.
/// Finished jobs answer with `GEN_001`.
#[instrument(skip(state, user))]
pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(job_id): Path<String>,
) -> Result<Json<GenerationJob>, ApiError> {
    let job = state.generation.cancel(&user.get_id(), &job_id)?;
    info!("Cancelled generation job");
    Ok(Json(job))
}

/// Handler for following a job over server-sent events
///
/// This function handles GET requests to `/api/generation/jobs/{id}/stream`.
/// Each event's id is its resume token. A client resumes with `resume_from`,
/// `resume_token` or the `Last-Event-ID` header, in that order.
#[instrument(skip(state, user, headers, query))]
pub async fn stream_job_handler(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(job_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let last_index = query.last_index(&job_id).or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|token| parse_resume_token(token, &job_id))
    });
    debug!("Streaming job from card index {:?}", last_index);

    let events = state.generation.stream(&user.get_id(), &job_id, last_index)?;
    let stream = events.map(|event| Ok(sse_event(event.name(), Some(event.token()), &event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
