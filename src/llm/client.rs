use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{LlmBackend, LlmError, LlmRequest, LlmResponse};

/// Client for the SOP LLM task service
///
/// Completions are asynchronous on the service side: a task is created and
/// then polled until it completes or fails.
#[derive(Clone, Debug)]
pub struct SopLlmClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    poll_interval: Duration,
    retry_attempts: usize,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    task_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct TaskUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
struct TaskResult {
    #[serde(default)]
    text: String,
    model: Option<String>,
    #[serde(default)]
    usage: TaskUsage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskState {
    status: String,
    result: Option<TaskResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

fn transport_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else if err.is_decode() {
        LlmError::InvalidResponse(err.to_string())
    } else {
        LlmError::Unavailable(err.to_string())
    }
}

/// Turns an error status into an `LlmError`, reading the body for context
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(LlmError::RateLimited(retry_after));
    }
    if status.is_client_error() || status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

impl SopLlmClient {
    /// Delay between two polls of a running task
    pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            poll_interval: Self::POLL_INTERVAL,
            retry_attempts: 3,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_factor(2.0)
            .with_max_times(self.retry_attempts.saturating_sub(1))
    }

    /// Poll attempts that fit in the client timeout, plus some slack
    fn max_polls(&self) -> u64 {
        let interval = self.poll_interval.as_millis().max(1);
        (self.timeout.as_millis() / interval) as u64 + 10
    }

    async fn create_task(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let mut payload = json!({
            "model": request.model,
            "prompt": format!("System: {}\n\nUser: {}", request.system_prompt, request.user_prompt),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "priority": 5.0,
        });
        if let Some(format) = &request.response_format {
            payload["response_format"] = format.clone();
        }

        let response = self
            .http
            .post(self.url("/api/v1/tasks"))
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let created: CreatedTask = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        Ok(created.task_id)
    }

    async fn poll_task(&self, task_id: &str) -> Result<TaskResult, LlmError> {
        for _ in 0..self.max_polls() {
            let response = self
                .http
                .get(self.url(&format!("/api/v1/tasks/{task_id}")))
                .send()
                .await
                .map_err(transport_error)?;
            let state: TaskState = check_status(response)
                .await?
                .json()
                .await
                .map_err(transport_error)?;

            match state.status.as_str() {
                "completed" => return Ok(state.result.unwrap_or_default()),
                "failed" => {
                    return Err(LlmError::TaskFailed(
                        state.error.unwrap_or_else(|| "Unknown error".to_string()),
                    ));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }

        warn!("task {} did not finish within {:?}", task_id, self.timeout);
        Err(LlmError::Timeout)
    }
}

#[async_trait]
impl LlmBackend for SopLlmClient {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let task_id = (|| self.create_task(&request))
            .retry(self.backoff())
            .when(LlmError::is_transient)
            .notify(|err, delay| warn!(?err, ?delay, "retrying task creation"))
            .await?;
        debug!("created task {}", task_id);

        let result = self.poll_task(&task_id).await?;
        info!(
            input_tokens = result.usage.prompt_tokens,
            output_tokens = result.usage.completion_tokens,
            "LLM task {} completed",
            task_id
        );

        Ok(LlmResponse {
            content: result.text,
            model: result.model.unwrap_or(request.model),
            input_tokens: result.usage.prompt_tokens,
            output_tokens: result.usage.completion_tokens,
            finish_reason: result.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }

    #[instrument(skip(self, texts), fields(batch = texts.len()))]
    async fn embed(&self, texts: Vec<String>, model: &str) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let payload = json!({ "texts": texts, "model_name": model });

        let embed_once = || async {
            let response = self
                .http
                .post(self.url("/api/v1/embeddings"))
                .json(&payload)
                .send()
                .await
                .map_err(transport_error)?;
            check_status(response)
                .await?
                .json::<EmbeddingsResponse>()
                .await
                .map_err(transport_error)
        };

        let response = embed_once
            .retry(self.backoff())
            .when(LlmError::is_transient)
            .notify(|err, delay| warn!(?err, ?delay, "retrying embeddings"))
            .await?;

        if response.embeddings.len() != texts.len() {
            return Err(LlmError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }

    async fn health(&self) -> bool {
        match self.http.get(self.url("/api/v1/monitor/health")).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(err) => {
                debug!(?err, "LLM health check failed");
                false
            }
        }
    }

    async fn list_models(&self) -> Vec<serde_json::Value> {
        let Ok(response) = self.http.get(self.url("/api/v1/models")).send().await else {
            return Vec::new();
        };
        if response.status() != StatusCode::OK {
            return Vec::new();
        }
        response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body.get("models").and_then(|m| m.as_array()).cloned())
            .unwrap_or_default()
    }
}
