use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, instrument, warn};

use super::hub::{JobEvent, JobHub};
use super::pipeline::{Pipeline, PipelineError};
use super::{GeneratedCard, GenerationRequest, GenerationResult};
use crate::db::DbPool;
use crate::errors::ApiError;
use crate::models::{GenerationJob, JobStatus, JsonValue};
use crate::rate_limit::SlidingWindowLimiter;
use crate::repo::{self, JobChanges};
use crate::worker::{BackgroundTask, TaskQueue};

/// How long idempotency keys and finished jobs are kept
const JOB_RETENTION_HOURS: i64 = 24;

/// Result of `GenerationService::start`
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub job: GenerationJob,
    /// The job was found through its idempotency key, nothing was enqueued
    pub existing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: i32,
    pub current_step: Option<String>,
    pub cards_generated: i32,
    pub error: Option<String>,
}

impl From<&GenerationJob> for JobStatusView {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.get_id(),
            status: job.get_status(),
            progress: job.get_progress(),
            current_step: job.get_current_step(),
            cards_generated: job.get_cards_generated(),
            error: job.get_error(),
        }
    }
}

fn stored_cards(job: &GenerationJob) -> Vec<GeneratedCard> {
    job.get_result()
        .and_then(|value| serde_json::from_value::<GenerationResult>(value.clone()).ok())
        .map(|result| result.cards)
        .unwrap_or_default()
}

fn card_event(job_id: &str, index: usize, total: usize, card: GeneratedCard) -> JobEvent {
    JobEvent::Card {
        card,
        card_index: index,
        progress: (index + 1) as f64 / total.max(1) as f64 * 100.0,
        resume_token: JobEvent::resume_token(job_id, Some(index)),
    }
}

/// The closing event of a finished job
fn terminal_event(job: &GenerationJob, total_cards: usize, last_index: Option<usize>) -> Option<JobEvent> {
    let resume_token = JobEvent::resume_token(&job.get_id(), last_index);
    match job.get_status() {
        JobStatus::Completed => Some(JobEvent::Complete {
            progress: 100.0,
            message: "Generation completed".to_string(),
            total_cards,
            resume_token,
        }),
        JobStatus::Failed => Some(JobEvent::Error {
            error: job.get_error().unwrap_or_else(|| "Generation failed".to_string()),
            resume_token,
        }),
        JobStatus::Cancelled => Some(JobEvent::Error {
            error: "Generation cancelled".to_string(),
            resume_token,
        }),
        JobStatus::Pending | JobStatus::Running => None,
    }
}

/// Entry point for generation requests
#[derive(Clone)]
pub struct GenerationService {
    pool: Arc<DbPool>,
    queue: TaskQueue,
    limiter: Arc<SlidingWindowLimiter>,
    pipeline: Pipeline,
}

impl GenerationService {
    pub fn new(pool: Arc<DbPool>, queue: TaskQueue, limiter: Arc<SlidingWindowLimiter>, pipeline: Pipeline) -> Self {
        Self { pool, queue, limiter, pipeline }
    }

    fn hub(&self) -> &Arc<JobHub> {
        self.pipeline.hub()
    }

    /// Stores and enqueues a job, or returns the one created earlier with
    /// the same idempotency key
    #[instrument(skip(self, request), fields(topic = %request.topic))]
    pub async fn start(&self, user_id: &str, request: GenerationRequest) -> Result<StartOutcome, ApiError> {
        self.limiter
            .check(user_id)
            .map_err(|retry_after| ApiError::RateLimited { retry_after })?;
        let request = request.validate()?;

        if let Some(key) = &request.idempotency_key {
            let since = Utc::now().naive_utc() - Duration::hours(JOB_RETENTION_HOURS);
            if let Some(job) = repo::find_job_by_idempotency_key(&self.pool, user_id, key, since)? {
                info!("returning job {} for idempotency key", job.get_id());
                return Ok(StartOutcome { job, existing: true });
            }
        }

        if let Some(deck_id) = &request.deck_id {
            match repo::get_deck(&self.pool, deck_id)? {
                Some(deck) if deck.is_owned_by(user_id) => {}
                _ => return Err(ApiError::NotFound("Deck")),
            }
        }

        let payload = serde_json::to_value(&request).map_err(|e| ApiError::Internal(e.to_string()))?;
        let job = repo::insert_job(
            &self.pool,
            GenerationJob::new(user_id.to_string(), payload, request.idempotency_key.clone()),
        )?;

        let task = GenerationTask {
            job_id: job.get_id(),
            pool: self.pool.clone(),
            pipeline: self.pipeline.clone(),
        };
        if let Err(err) = self.queue.enqueue(Arc::new(task)).await {
            error!("failed to enqueue job {}: {:#}", job.get_id(), err);
            repo::update_job(
                &self.pool,
                &job.get_id(),
                JobChanges {
                    status: Some(JobStatus::Failed),
                    error: Some(Some("task queue unavailable".to_string())),
                    completed_at: Some(Some(Utc::now().naive_utc())),
                    ..Default::default()
                },
            )?;
            return Err(ApiError::Internal("task queue unavailable".to_string()));
        }

        info!("queued generation job {}", job.get_id());
        Ok(StartOutcome { job, existing: false })
    }

    /// A job owned by `user_id`
    pub fn get(&self, user_id: &str, job_id: &str) -> Result<GenerationJob, ApiError> {
        let job = repo::get_job(&self.pool, job_id)?.ok_or(ApiError::NotFound("Generation job"))?;
        if !job.is_owned_by(user_id) {
            return Err(ApiError::PermissionDenied("access denied to this generation job".into()));
        }
        Ok(job)
    }

    pub fn status(&self, user_id: &str, job_id: &str) -> Result<JobStatusView, ApiError> {
        self.get(user_id, job_id).map(|job| JobStatusView::from(&job))
    }

    /// Cancels a pending or running job
    ///
    /// A running pipeline stops at its next checkpoint.
    #[instrument(skip(self))]
    pub fn cancel(&self, user_id: &str, job_id: &str) -> Result<GenerationJob, ApiError> {
        let job = self.get(user_id, job_id)?;
        if job.get_status().is_terminal() || !repo::cancel_job(&self.pool, job_id)? {
            let status = repo::get_job(&self.pool, job_id)?
                .map(|j| j.get_status())
                .unwrap_or(job.get_status());
            return Err(ApiError::JobNotCancellable(status.as_str().to_string()));
        }

        let resume_token = self.hub().resume_token(job_id);
        self.hub().publish(
            job_id,
            JobEvent::Error {
                error: "Generation cancelled".to_string(),
                resume_token,
            },
        );
        info!("cancelled job {}", job_id);
        repo::get_job(&self.pool, job_id)?.ok_or(ApiError::NotFound("Generation job"))
    }

    /// The user's recent jobs, newest first
    ///
    /// Finished jobs past the retention window are pruned first.
    pub fn list(&self, user_id: &str, limit: i64) -> Result<Vec<GenerationJob>, ApiError> {
        if !(1..=100).contains(&limit) {
            return Err(ApiError::Validation("limit must be between 1 and 100".into()));
        }
        let cutoff = Utc::now().naive_utc() - Duration::hours(JOB_RETENTION_HOURS);
        let pruned = repo::prune_jobs(&self.pool, cutoff)?;
        if pruned > 0 {
            info!("pruned {} expired generation jobs", pruned);
        }
        Ok(repo::list_jobs(&self.pool, user_id, limit)?)
    }

    /// Events of a job, starting after card `resume_from`
    ///
    /// A finished job replays the cards stored with it. A running job
    /// replays the cards published so far and is then followed live until
    /// it finishes.
    pub fn stream(
        &self,
        user_id: &str,
        job_id: &str,
        resume_from: Option<usize>,
    ) -> Result<impl Stream<Item = JobEvent> + Send + 'static + use<>, ApiError> {
        let hub = self.hub().clone();
        let (published, mut rx) = hub.subscribe(job_id);
        let job = match self.get(user_id, job_id) {
            Ok(job) => job,
            Err(err) => {
                drop(rx);
                hub.release(job_id);
                return Err(err);
            }
        };

        Ok(async_stream::stream! {
            let job_id = job.get_id();
            let mut next = resume_from.map(|i| i + 1).unwrap_or(0);

            if job.get_status().is_terminal() {
                drop(rx);
                hub.release(&job_id);
                let saved = stored_cards(&job);
                for (index, card) in saved.iter().enumerate().skip(next) {
                    yield card_event(&job_id, index, saved.len(), card.clone());
                    next = index + 1;
                }
                if let Some(event) = terminal_event(&job, saved.len(), next.checked_sub(1)) {
                    yield event;
                }
            } else {
                for event in published {
                    if let JobEvent::Card { card_index, .. } = &event {
                        if *card_index < next {
                            continue;
                        }
                        next = card_index + 1;
                    }
                    yield event;
                }

                yield JobEvent::Progress {
                    progress: f64::from(job.get_progress()),
                    step: job.get_current_step().unwrap_or_else(|| job.get_status().as_str().to_string()),
                    resume_token: JobEvent::resume_token(&job_id, next.checked_sub(1)),
                };

                loop {
                    match rx.recv().await {
                        Ok(JobEvent::Card { card_index, .. }) if card_index < next => continue,
                        Ok(event) => {
                            if let JobEvent::Card { card_index, .. } = &event {
                                next = card_index + 1;
                            }
                            let terminal = event.is_terminal();
                            yield event;
                            if terminal {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("stream for job {} skipped {} events", job_id, skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

/// Runs one generation job on the task queue
pub struct GenerationTask {
    job_id: String,
    pool: Arc<DbPool>,
    pipeline: Pipeline,
}

impl GenerationTask {
    pub fn new(job_id: String, pool: Arc<DbPool>, pipeline: Pipeline) -> Self {
        Self { job_id, pool, pipeline }
    }

    fn finish(&self, result: &GenerationResult) -> anyhow::Result<bool> {
        let changes = JobChanges {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            current_step: Some(None),
            cards_generated: Some(result.cards.len() as i32),
            result: Some(Some(JsonValue(serde_json::to_value(result)?))),
            completed_at: Some(Some(Utc::now().naive_utc())),
            ..Default::default()
        };
        repo::update_running_job(&self.pool, &self.job_id, changes)
    }
}

#[async_trait]
impl BackgroundTask for GenerationTask {
    fn name(&self) -> String {
        format!("generation:{}", self.job_id)
    }

    async fn run(&self) -> anyhow::Result<()> {
        let job = repo::get_job(&self.pool, &self.job_id)?
            .ok_or_else(|| anyhow::anyhow!("generation job {} not found", self.job_id))?;
        if !repo::start_job(&self.pool, &self.job_id)? {
            info!("job {} is no longer pending, skipping", self.job_id);
            return Ok(());
        }

        match self.pipeline.run(&job).await {
            Ok(result) => {
                if !self.finish(&result)? {
                    self.pipeline.hub().close(&self.job_id);
                } else {
                    self.pipeline.hub().publish(
                        &self.job_id,
                        JobEvent::Complete {
                            progress: 100.0,
                            message: "Generation completed".to_string(),
                            total_cards: result.cards.len(),
                            resume_token: JobEvent::resume_token(&self.job_id, result.cards.len().checked_sub(1)),
                        },
                    );
                }
                Ok(())
            }
            Err(PipelineError::Cancelled) => {
                info!("job {} cancelled", self.job_id);
                self.pipeline.hub().close(&self.job_id);
                Ok(())
            }
            Err(err) => Err(anyhow::Error::new(err)),
        }
    }

    /// Pipeline steps retry on their own and saved cards must not be
    /// written twice
    fn is_retryable(&self, _error: &anyhow::Error) -> bool {
        false
    }

    async fn on_failure(&self, error: anyhow::Error) {
        let message = format!("{error:#}");
        let current = match repo::get_job(&self.pool, &self.job_id) {
            Ok(job) => job,
            Err(err) => {
                error!("failed to load job {} after failure: {:#}", self.job_id, err);
                return;
            }
        };
        if current.is_none_or(|job| job.get_status().is_terminal()) {
            return;
        }

        let changes = JobChanges {
            status: Some(JobStatus::Failed),
            error: Some(Some(message.clone())),
            completed_at: Some(Some(Utc::now().naive_utc())),
            ..Default::default()
        };
        if let Err(err) = repo::update_job(&self.pool, &self.job_id, changes) {
            error!("failed to mark job {} failed: {:#}", self.job_id, err);
        }
        let hub = self.pipeline.hub();
        let resume_token = hub.resume_token(&self.job_id);
        hub.publish(&self.job_id, JobEvent::Error { error: message, resume_token });
    }
}
