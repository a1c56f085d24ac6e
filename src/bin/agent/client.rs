use ankirag::auth::TokenPair;
use ankirag::models::{Card, Deck, SyncRun, User};
use ankirag::services::Page;
use ankirag::services::cards::AgentCardStatus;
use ankirag::services::sync::{AgentReport, ImportRequest, ImportResult, SyncOverview};
use chrono::NaiveDateTime;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;

/// Error type for backend API calls
#[derive(Debug)]
pub enum ClientError {
    /// Server returned an error status with a message body
    Server { status: reqwest::StatusCode, message: String },
    /// Network/connection/request error
    Request(reqwest::Error),
    /// No stored access token
    NotLoggedIn,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Server { status, message } => {
                write!(f, "Server error ({}): {}", status.as_u16(), message)
            }
            ClientError::Request(err) => write!(f, "{}", err),
            ClientError::NotLoggedIn => write!(f, "Not logged in. Run `ankirag-agent login` first"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Request(err)
    }
}

/// Extension trait for checking HTTP responses and extracting server error messages
trait ResponseExt {
    async fn check(self) -> Result<reqwest::Response, ClientError>;
}

impl ResponseExt for reqwest::Response {
    async fn check(self) -> Result<reqwest::Response, ClientError> {
        if self.status().is_success() {
            return Ok(self);
        }
        let status = self.status();
        // Errors arrive as {"error": {"code", "message"}}
        let message = match self.json::<serde_json::Value>().await {
            Ok(body) => body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error")
                .to_string(),
            Err(_) => format!("HTTP {}", status),
        };
        Err(ClientError::Server { status, message })
    }
}

/// Per-card outcome sent back after pushing to Anki
#[derive(Debug, Clone, Serialize)]
pub struct CardSyncUpdate {
    pub status: AgentCardStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anki_note_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anki_card_id: Option<i64>,
    pub synced_at: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// HTTP client for the AnkiRAG backend
pub struct ApiClient {
    /// The base URL of the server (e.g. "http://localhost:8080")
    base_url: String,
    client: Client,
    access_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, access_token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            access_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    fn token(&self) -> Result<&str, ClientError> {
        self.access_token.as_deref().ok_or(ClientError::NotLoggedIn)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(self.token()?)
            .query(query)
            .send()
            .await?
            .check()
            .await?;
        Ok(resp.json().await?)
    }

    async fn send<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let resp = self
            .client
            .request(method, self.url(path))
            .bearer_auth(self.token()?)
            .json(body)
            .send()
            .await?
            .check()
            .await?;
        Ok(resp.json().await?)
    }

    // ── Auth ─────────────────────────────────────────────────────────

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, ClientError> {
        let resp = self
            .client
            .post(self.url("/auth/login"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?
            .check()
            .await?;
        Ok(resp.json().await?)
    }

    /// Revokes a refresh token on the server
    pub async fn logout(&self, refresh_token: &str) -> Result<(), ClientError> {
        self.client
            .post(self.url("/auth/logout"))
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?
            .check()
            .await?;
        Ok(())
    }

    pub async fn me(&self) -> Result<User, ClientError> {
        self.get("/auth/me", &[]).await
    }

    // ── Decks and cards ──────────────────────────────────────────────

    pub async fn list_decks(&self) -> Result<Page<Deck>, ClientError> {
        self.get("/decks", &[("limit", "100".to_string())]).await
    }

    /// One page of approved cards, oldest first
    pub async fn approved_cards(&self, offset: usize, limit: usize) -> Result<Page<Card>, ClientError> {
        self.get(
            "/cards",
            &[
                ("status", "approved".to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    pub async fn report_card(&self, card_id: &str, update: &CardSyncUpdate) -> Result<Card, ClientError> {
        self.send(reqwest::Method::PATCH, &format!("/cards/{card_id}"), update).await
    }

    // ── Sync ─────────────────────────────────────────────────────────

    pub async fn complete_sync(&self, report: &AgentReport) -> Result<SyncRun, ClientError> {
        self.send(reqwest::Method::POST, "/sync/complete", report).await
    }

    pub async fn sync_status(&self) -> Result<SyncOverview, ClientError> {
        self.get("/sync/status", &[]).await
    }

    pub async fn sync_history(&self, limit: i64) -> Result<Vec<SyncRun>, ClientError> {
        self.get("/sync/history", &[("limit", limit.to_string())]).await
    }

    pub async fn import_cards(&self, request: &ImportRequest) -> Result<ImportResult, ClientError> {
        self.send(reqwest::Method::POST, "/sync/import/cards", request).await
    }
}
