use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::{StreamExt, stream};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::hub::{JobEvent, JobHub};
use super::prompt::{parse_cards, system_prompt, user_prompt};
use super::{
    CardType, DEFAULT_DECK_NAME, GeneratedCard, GenerationRequest, GenerationResult, MIN_CONFIDENCE,
};
use crate::db::DbPool;
use crate::errors::ApiError;
use crate::llm::{FactCheckResult, LlmBackend, LlmError, LlmRequest, fact_check};
use crate::models::{
    BASIC_TEMPLATE_ID, CLOZE_TEMPLATE_ID, Card, CardGenerationInfo, Deck, GenerationJob, JsonValue,
};
use crate::rag::{DUPLICATE_THRESHOLD, DuplicateCandidate, RagService, SearchQuery};
use crate::repo::{self, JobChanges};

const STEP_RETRIES: usize = 2;
const STEP_RETRY_DELAY: Duration = Duration::from_secs(1);
const FACT_CHECK_CONCURRENCY: usize = 4;
const CONTEXT_HITS: usize = 5;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job was cancelled")]
    Cancelled,
    #[error("invalid job request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

/// Pipeline checkpoints and the progress reached when each one is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepProgress {
    FetchContext,
    Generate,
    CheckDuplicates,
    FactCheck,
    Route,
    Save,
}

impl StepProgress {
    pub fn name(&self) -> &'static str {
        match self {
            StepProgress::FetchContext => "fetch_context",
            StepProgress::Generate => "generate",
            StepProgress::CheckDuplicates => "check_duplicates",
            StepProgress::FactCheck => "fact_check",
            StepProgress::Route => "route",
            StepProgress::Save => "save",
        }
    }

    pub fn percent(&self) -> i32 {
        match self {
            StepProgress::FetchContext => 20,
            StepProgress::Generate => 50,
            StepProgress::CheckDuplicates => 65,
            StepProgress::FactCheck => 80,
            StepProgress::Route => 90,
            StepProgress::Save => 100,
        }
    }
}

/// A generated card on its way through the pipeline
struct Candidate {
    card: GeneratedCard,
    verdict: Option<FactCheckResult>,
}

fn api_error_is_transient(error: &ApiError) -> bool {
    matches!(error, ApiError::LlmUnavailable(_) | ApiError::RateLimited { .. })
}

/// Runs the generation steps for one job
#[derive(Clone)]
pub struct Pipeline {
    pool: Arc<DbPool>,
    llm: Arc<dyn LlmBackend>,
    rag: RagService,
    hub: Arc<JobHub>,
    default_model: String,
    fact_check_model: String,
    temperature: f64,
    max_tokens: u32,
    step_delay: Duration,
}

impl Pipeline {
    pub fn new(
        pool: Arc<DbPool>,
        llm: Arc<dyn LlmBackend>,
        rag: RagService,
        hub: Arc<JobHub>,
        config: &crate::config::Config,
    ) -> Self {
        Self {
            pool,
            llm,
            rag,
            hub,
            default_model: config.llm_default_model.clone(),
            fact_check_model: config.fact_check_model.clone(),
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
            step_delay: STEP_RETRY_DELAY,
        }
    }

    /// Overrides the base delay between step retries
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn hub(&self) -> &Arc<JobHub> {
        &self.hub
    }

    /// Retries `f` on errors accepted by `transient`
    async fn retry_step<T, E, F, Fut>(&self, step: &str, f: F, transient: fn(&E) -> bool) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        f.retry(
            ExponentialBuilder::default()
                .with_min_delay(self.step_delay)
                .with_factor(2.0)
                .with_max_times(STEP_RETRIES),
        )
        .when(transient)
        .notify(|err, delay| warn!("step {} failed, retrying in {:?}: {}", step, delay, err))
        .await
    }

    /// Records that `step` finished
    ///
    /// Doubles as the cancellation checkpoint: once the job is no longer
    /// `running` the write is refused and the pipeline stops.
    fn advance(&self, job_id: &str, step: StepProgress) -> Result<(), PipelineError> {
        let changes = JobChanges {
            progress: Some(step.percent()),
            current_step: Some(Some(step.name().to_string())),
            ..Default::default()
        };
        if !repo::update_running_job(&self.pool, job_id, changes)? {
            info!("job {} stopped after {}", job_id, step.name());
            return Err(PipelineError::Cancelled);
        }
        self.hub.publish(
            job_id,
            JobEvent::Progress {
                progress: f64::from(step.percent()),
                step: step.name().to_string(),
                resume_token: self.hub.resume_token(job_id),
            },
        );
        Ok(())
    }

    /// The deck named by the request, or the user's default generation deck
    fn target_deck(&self, user_id: &str, deck_id: Option<&str>) -> Result<String, PipelineError> {
        if let Some(deck_id) = deck_id {
            let deck = repo::get_deck(&self.pool, deck_id)?.ok_or(ApiError::NotFound("Deck"))?;
            if !deck.is_owned_by(user_id) {
                return Err(ApiError::NotFound("Deck").into());
            }
            return Ok(deck.get_id());
        }

        if let Some(deck) = repo::find_deck_by_name(&self.pool, user_id, DEFAULT_DECK_NAME)? {
            return Ok(deck.get_id());
        }
        let deck = repo::insert_deck(
            &self.pool,
            Deck::new(
                user_id.to_string(),
                DEFAULT_DECK_NAME.to_string(),
                Some("Cards generated without a target deck".to_string()),
                None,
            ),
        )?;
        Ok(deck.get_id())
    }

    /// Registry model name for `model_id`, or the id itself when unknown
    fn resolve_model(&self, model_id: Option<&str>) -> Result<String, PipelineError> {
        let Some(model_id) = model_id else {
            return Ok(self.default_model.clone());
        };
        Ok(match repo::get_llm_model(&self.pool, model_id)? {
            Some(model) => model.model_id,
            None => model_id.to_string(),
        })
    }

    /// Executes every step of `job`
    ///
    /// The job must already be `running`.
    #[instrument(skip(self, job), fields(job_id = %job.get_id()))]
    pub async fn run(&self, job: &GenerationJob) -> Result<GenerationResult, PipelineError> {
        let job_id = job.get_id();
        let user_id = job.get_user_id();
        let request: GenerationRequest = serde_json::from_value(job.get_request().clone())
            .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;

        let deck_id = self.target_deck(&user_id, request.deck_id.as_deref())?;
        let model = self.resolve_model(request.model_id.as_deref())?;

        let contexts = self.fetch_context(&user_id, &request).await;
        self.advance(&job_id, StepProgress::FetchContext)?;

        let generated = self.generate(&model, &request, &contexts).await?;
        let total_generated = generated.len();
        let mut candidates: Vec<Candidate> = generated
            .into_iter()
            .map(|card| Candidate { card, verdict: None })
            .collect();
        self.advance(&job_id, StepProgress::Generate)?;

        self.check_duplicates(&user_id, &mut candidates).await;
        self.advance(&job_id, StepProgress::CheckDuplicates)?;

        if request.fact_check && !candidates.is_empty() {
            self.fact_check(&request, &mut candidates).await;
        }
        self.advance(&job_id, StepProgress::FactCheck)?;

        let (kept, rejected) = route(candidates, request.include_sources);
        self.advance(&job_id, StepProgress::Route)?;

        let saved = self.save(&job_id, &user_id, &deck_id, &model, &request, kept).await?;
        self.advance(&job_id, StepProgress::Save)?;

        info!(
            generated = total_generated,
            saved = saved.len(),
            rejected = rejected.len(),
            "generation finished"
        );

        Ok(GenerationResult {
            deck_id,
            cards: saved,
            rejected: rejected.into_iter().map(|c| c.card).collect(),
            total_generated,
            model,
        })
    }

    /// User supplied context first, then cards similar to the topic
    async fn fetch_context(&self, user_id: &str, request: &GenerationRequest) -> Vec<String> {
        let mut contexts = Vec::new();
        if let Some(context) = request.context.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            contexts.push(context.to_string());
        }

        let mut query = SearchQuery::new(request.topic.clone());
        query.k = CONTEXT_HITS;
        if let Some(deck_id) = &request.deck_id {
            query.deck_ids = Some(vec![deck_id.clone()]);
        }

        let hits = self
            .retry_step("fetch_context", || self.rag.search(user_id, &query), api_error_is_transient)
            .await;
        match hits {
            Ok(hits) => contexts.extend(hits.into_iter().map(|hit| hit.content_text)),
            Err(error) => warn!("context retrieval failed, continuing without it: {}", error),
        }

        contexts
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
        contexts: &[String],
    ) -> Result<Vec<GeneratedCard>, PipelineError> {
        let llm_request = LlmRequest::new(model, system_prompt(request), user_prompt(request, contexts))
            .temperature(self.temperature)
            .max_tokens(self.max_tokens);

        let response = self
            .retry_step("generate", || self.llm.generate(llm_request.clone()), LlmError::is_transient)
            .await?;

        let mut cards = parse_cards(&response.content, request.card_type, &request.tags);
        if cards.is_empty() {
            warn!("completion contained no usable cards");
        }
        cards.truncate(request.num_cards as usize);
        Ok(cards)
    }

    /// Marks candidates that match existing cards; a failed check marks none
    async fn check_duplicates(&self, user_id: &str, candidates: &mut [Candidate]) {
        if candidates.is_empty() {
            return;
        }
        let queries: Vec<DuplicateCandidate> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| DuplicateCandidate { temp_id: i.to_string(), text: c.card.claim() })
            .collect();

        let results = self
            .retry_step(
                "check_duplicates",
                || self.rag.check_duplicates(user_id, &queries, DUPLICATE_THRESHOLD),
                api_error_is_transient,
            )
            .await;

        let results = match results {
            Ok(results) => results,
            Err(error) => {
                warn!("duplicate check failed, keeping all cards: {}", error);
                return;
            }
        };

        for result in results {
            let Some(candidate) = result.temp_id.parse::<usize>().ok().and_then(|i| candidates.get_mut(i)) else {
                continue;
            };
            if result.is_duplicate {
                candidate.card.is_duplicate = true;
                candidate.card.duplicate_card_id = result.matches.first().map(|m| m.existing_card_id.clone());
                candidate.card.similarity_score = Some(result.highest_similarity);
            }
        }
    }

    /// Fact-checks every candidate; a failed check yields neutral confidence
    async fn fact_check(&self, request: &GenerationRequest, candidates: &mut [Candidate]) {
        let context = request.context.as_deref();
        let claims: Vec<String> = candidates.iter().map(|c| c.card.claim()).collect();

        let verdicts: Vec<FactCheckResult> = stream::iter(claims)
            .map(|claim| async move {
                let verdict = self
                    .retry_step(
                        "fact_check",
                        || fact_check(self.llm.as_ref(), &self.fact_check_model, &claim, context),
                        LlmError::is_transient,
                    )
                    .await;
                verdict.unwrap_or_else(|error| {
                    warn!("fact check failed: {}", error);
                    FactCheckResult::neutral(format!("Fact check failed: {error}"))
                })
            })
            .buffered(FACT_CHECK_CONCURRENCY)
            .collect()
            .await;

        for (candidate, verdict) in candidates.iter_mut().zip(verdicts) {
            candidate.card.confidence = Some(verdict.confidence);
            candidate.verdict = Some(verdict);
        }
    }

    /// Stores kept cards with their provenance and indexes them
    async fn save(
        &self,
        job_id: &str,
        user_id: &str,
        deck_id: &str,
        model: &str,
        request: &GenerationRequest,
        kept: Vec<Candidate>,
    ) -> Result<Vec<GeneratedCard>, PipelineError> {
        let total = kept.len();
        let mut saved = Vec::with_capacity(total);

        for (index, mut candidate) in kept.into_iter().enumerate() {
            let (template_id, fields) = match candidate.card.card_type {
                CardType::Cloze => (
                    CLOZE_TEMPLATE_ID,
                    json!({ "Text": candidate.card.front, "Extra": candidate.card.back }),
                ),
                CardType::Basic | CardType::BasicReversed => (
                    BASIC_TEMPLATE_ID,
                    json!({ "Front": candidate.card.front, "Back": candidate.card.back }),
                ),
            };
            let card = repo::insert_card(
                &self.pool,
                Card::new(
                    deck_id.to_string(),
                    template_id.to_string(),
                    fields,
                    candidate.card.tags.clone(),
                    Some(user_id.to_string()),
                ),
            )?;

            repo::insert_generation_info(
                &self.pool,
                &CardGenerationInfo {
                    card_id: card.get_id(),
                    job_id: Some(job_id.to_string()),
                    model_name: Some(model.to_string()),
                    user_request: request.topic.clone(),
                    fact_check_result: candidate
                        .verdict
                        .as_ref()
                        .and_then(|v| serde_json::to_value(v).ok())
                        .map(JsonValue),
                    fact_check_confidence: candidate.verdict.as_ref().map(|v| v.confidence),
                    created_at: chrono::Utc::now().naive_utc(),
                },
            )?;

            candidate.card.card_id = Some(card.get_id());
            self.hub.publish(
                job_id,
                JobEvent::Card {
                    card: candidate.card.clone(),
                    card_index: index,
                    progress: (index + 1) as f64 / total as f64 * 100.0,
                    resume_token: JobEvent::resume_token(job_id, Some(index)),
                },
            );
            saved.push(candidate.card);
        }

        let ids: Vec<String> = saved.iter().filter_map(|c| c.card_id.clone()).collect();
        if !ids.is_empty() {
            if let Err(error) = self.rag.index_cards(user_id, &ids, false).await {
                warn!("indexing generated cards failed: {}", error);
            }
        }

        Ok(saved)
    }
}

/// Splits candidates into kept and rejected
///
/// Duplicates are rejected first, then cards under `MIN_CONFIDENCE`. Cards
/// that were not fact-checked count as fully confident.
fn route(candidates: Vec<Candidate>, include_sources: bool) -> (Vec<Candidate>, Vec<Candidate>) {
    let mut kept = Vec::new();
    let mut rejected = Vec::new();

    for mut candidate in candidates {
        if include_sources {
            candidate.card.source = candidate
                .verdict
                .as_ref()
                .map(|v| v.sources.join(", "))
                .filter(|s| !s.is_empty());
        }

        let confidence = candidate.card.confidence.unwrap_or(1.0);
        if candidate.card.is_duplicate {
            candidate.card.rejection_reason = Some("duplicate".to_string());
            rejected.push(candidate);
        } else if confidence < MIN_CONFIDENCE {
            candidate.card.rejection_reason = Some("low_confidence".to_string());
            rejected.push(candidate);
        } else {
            kept.push(candidate);
        }
    }

    (kept, rejected)
}
