/// Common test utilities for AnkiRAG integration tests
///
/// Builds the full router on a private in-memory database with a fake LLM
/// backend, and offers request helpers that register and log in users.

use ankirag::{
    anki::AnkiClient,
    config::base_config,
    create_app,
    db::init_pool,
    llm::{LlmBackend, LlmError, LlmRequest, LlmResponse},
    AppState,
};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

/// Completion returned by `FakeLlm` for every prompt
pub const GENERATED_CARDS: &str = r#"```json
[{"front": "What does the borrow checker enforce?", "back": "Aliasing XOR mutability"},
 {"front": "What is a lifetime?", "back": "The scope a reference stays valid for"}]
```"#;

/// LLM backend that always answers with the same completion
pub struct FakeLlm {
    pub reply: String,
}

#[async_trait]
impl LlmBackend for FakeLlm {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        Ok(LlmResponse {
            content: self.reply.clone(),
            model: request.model,
            input_tokens: 10,
            output_tokens: 20,
            finish_reason: "stop".to_string(),
        })
    }

    /// Embeds by letter frequency so equal texts get equal vectors
    async fn embed(&self, texts: Vec<String>, _model: &str) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; 26];
                for c in text.to_lowercase().chars().filter(char::is_ascii_lowercase) {
                    vector[(c as u8 - b'a') as usize] += 1.0;
                }
                vector
            })
            .collect())
    }

    async fn health(&self) -> bool {
        true
    }

    async fn list_models(&self) -> Vec<Value> {
        vec![json!({ "name": "fake" })]
    }
}

/// Creates a test application with an in-memory SQLite database
///
/// AnkiConnect points at a closed port, so sync endpoints that need Anki
/// see it as unavailable.
pub fn create_test_app() -> Router {
    let url = format!("file:it_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
    let pool = init_pool(&url).unwrap();
    {
        let mut conn = pool.get().unwrap();
        ankirag::run_migrations(&mut conn).unwrap();
    }

    let llm = Arc::new(FakeLlm { reply: GENERATED_CARDS.to_string() });
    let anki = AnkiClient::new("http://127.0.0.1:1/").unwrap();
    let state = AppState::new(Arc::new(pool), base_config(None), llm, anki);
    create_app(state)
}

/// Sends a request and returns the status and the decoded JSON body
///
/// Empty bodies decode as `Value::Null`.
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

/// Registers a user and returns their access token
pub async fn register_and_login(app: &Router, email: &str) -> String {
    let (status, _) = send(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "email": email, "password": "correct-horse", "display_name": "Tester" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, tokens) = send(
        app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": email, "password": "correct-horse" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    tokens["access_token"].as_str().unwrap().to_string()
}

/// Creates a deck and returns its JSON
pub async fn create_deck(app: &Router, token: &str, name: &str, parent_id: Option<&str>) -> Value {
    let (status, deck) = send(
        app,
        "POST",
        "/api/decks",
        Some(token),
        Some(json!({ "name": name, "parent_id": parent_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{deck}");
    deck
}

/// Creates a basic card and returns its JSON
pub async fn create_card(app: &Router, token: &str, deck_id: &str, front: &str, back: &str) -> Value {
    let (status, card) = send(
        app,
        "POST",
        "/api/cards",
        Some(token),
        Some(json!({
            "deck_id": deck_id,
            "template_id": ankirag::models::BASIC_TEMPLATE_ID,
            "fields": { "Front": front, "Back": back },
            "tags": ["rust"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{card}");
    card
}

/// Builds a minimal `.apkg`: one "Basic" note type and one note per
/// `(front, back)` pair, all in a deck named `deck_name`
pub fn build_apkg(deck_name: &str, notes: &[(&str, &str)]) -> Vec<u8> {
    use diesel::connection::SimpleConnection;
    use diesel::sql_types::{BigInt, Text};
    use diesel::{Connection, RunQueryDsl, SqliteConnection};
    use std::io::Write;

    let models = json!({
        "100": {
            "name": "Basic",
            "type": 0,
            "flds": [{ "name": "Front" }, { "name": "Back" }],
            "tmpls": [{ "qfmt": "{{Front}}", "afmt": "{{FrontSide}}<hr id=answer>{{Back}}" }]
        }
    });
    let decks = json!({ "1": { "name": "Default" }, "5": { "name": deck_name } });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("collection.anki21");
    {
        let mut conn = SqliteConnection::establish(path.to_str().unwrap()).unwrap();
        conn.batch_execute(
            "CREATE TABLE col (id INTEGER PRIMARY KEY, models TEXT NOT NULL, decks TEXT NOT NULL);
             CREATE TABLE notes (id INTEGER PRIMARY KEY, mid INTEGER NOT NULL, tags TEXT NOT NULL, flds TEXT NOT NULL);
             CREATE TABLE cards (id INTEGER PRIMARY KEY, nid INTEGER NOT NULL, did INTEGER NOT NULL, ord INTEGER NOT NULL);",
        )
        .unwrap();
        diesel::sql_query("INSERT INTO col (id, models, decks) VALUES (1, ?, ?)")
            .bind::<Text, _>(models.to_string())
            .bind::<Text, _>(decks.to_string())
            .execute(&mut conn)
            .unwrap();
        for (i, (front, back)) in notes.iter().enumerate() {
            let note_id = 1000 + i as i64;
            diesel::sql_query("INSERT INTO notes (id, mid, tags, flds) VALUES (?, 100, 'anki', ?)")
                .bind::<BigInt, _>(note_id)
                .bind::<Text, _>(format!("{front}\x1f{back}"))
                .execute(&mut conn)
                .unwrap();
            diesel::sql_query("INSERT INTO cards (id, nid, did, ord) VALUES (?, ?, 5, 0)")
                .bind::<BigInt, _>(note_id * 10)
                .bind::<BigInt, _>(note_id)
                .execute(&mut conn)
                .unwrap();
        }
    }
    let collection = std::fs::read(&path).unwrap();

    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("collection.anki21", zip::write::SimpleFileOptions::default()).unwrap();
        zip.write_all(&collection).unwrap();
        zip.start_file("media", zip::write::SimpleFileOptions::default()).unwrap();
        zip.write_all(b"{}").unwrap();
        zip.finish().unwrap();
    }
    buf
}

/// Posts a multipart form and returns the status and the raw body
///
/// Each part is `(name, file name, content)`; parts without a file name are
/// plain form fields.
pub async fn send_multipart(
    app: &Router,
    uri: &str,
    token: &str,
    parts: &[(&str, Option<&str>, &[u8])],
) -> (StatusCode, String) {
    const BOUNDARY: &str = "ankirag-test-boundary";

    let mut body = Vec::new();
    for (name, file_name, content) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes()),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let request = Request::builder()
        .uri(uri)
        .method("POST")
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}
