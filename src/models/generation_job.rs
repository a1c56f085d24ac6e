use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JsonValue;

sql_text_enum! {
    /// Lifecycle of a generation job
    pub enum JobStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl JobStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// A background card generation job
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::generation_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct GenerationJob {
    /// Unique identifier for the job (UUID v4 as string)
    id: String,

    /// The user who started the job
    user_id: String,

    status: JobStatus,

    /// The validated generation request
    request: JsonValue,

    /// Client supplied key used to deduplicate retries
    idempotency_key: Option<String>,

    /// Percentage in 0..=100
    progress: i32,

    /// Name of the pipeline step being executed
    current_step: Option<String>,

    cards_generated: i32,

    /// Final outcome, set when the job completes
    result: Option<JsonValue>,

    error: Option<String>,

    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    completed_at: Option<NaiveDateTime>,
}

impl GenerationJob {
    pub fn new(user_id: String, request: serde_json::Value, idempotency_key: Option<String>) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            status: JobStatus::Pending,
            request: JsonValue(request),
            idempotency_key,
            progress: 0,
            current_step: None,
            cards_generated: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn get_id(&self) -> String {
        self.id.clone()
    }

    pub fn get_user_id(&self) -> String {
        self.user_id.clone()
    }

    pub fn get_status(&self) -> JobStatus {
        self.status
    }

    pub fn get_request(&self) -> &serde_json::Value {
        &self.request.0
    }

    pub fn get_idempotency_key(&self) -> Option<String> {
        self.idempotency_key.clone()
    }

    pub fn get_progress(&self) -> i32 {
        self.progress
    }

    pub fn get_current_step(&self) -> Option<String> {
        self.current_step.clone()
    }

    pub fn get_cards_generated(&self) -> i32 {
        self.cards_generated
    }

    pub fn get_result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref().map(|r| &r.0)
    }

    pub fn get_error(&self) -> Option<String> {
        self.error.clone()
    }

    pub fn get_created_at(&self) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(self.created_at, Utc)
    }

    pub fn get_created_at_raw(&self) -> NaiveDateTime {
        self.created_at
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}
