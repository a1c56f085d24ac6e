/// Integration tests for the Anki sync endpoints
///
/// AnkiConnect is unreachable in these tests, so only the bookkeeping and
/// agent-facing paths complete.

mod common;

use axum::http::StatusCode;
use common::{build_apkg, create_card, create_deck, create_test_app, register_and_login, send, send_multipart};
use serde_json::{json, Value};

#[tokio::test]
async fn test_push_then_execute_without_anki() {
    let app = create_test_app();
    let token = register_and_login(&app, "push@example.com").await;

    let (status, receipt) = send(
        &app,
        "POST",
        "/api/sync/push",
        Some(&token),
        Some(json!({ "cards": [
            { "card_id": "c1", "front": "Q1", "back": "A1", "deck_name": "AnkiRAG" },
            { "card_id": "c2", "front": "Q2", "back": "A2", "deck_name": "AnkiRAG", "tags": ["x"] }
        ] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(receipt["queued_count"], 2);
    let sync_id = receipt["sync_id"].as_str().unwrap();

    let (status, body) = send(&app, "POST", &format!("/api/sync/execute/{sync_id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SYNC_002");

    // The run stays pending and can be retried
    let (status, pulled) = send(
        &app,
        "POST",
        "/api/sync/pull",
        Some(&token),
        Some(json!({ "sync_id": sync_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pulled["total"], 2);
    assert_eq!(pulled["pending"], 2);

    let (_, overview) = send(&app, "GET", "/api/sync/status", Some(&token), None).await;
    assert_eq!(overview["state"], "pending");
    assert_eq!(overview["pending_cards"], 2);
    assert_eq!(overview["anki_connected"], false);
}

#[tokio::test]
async fn test_empty_push_is_rejected() {
    let app = create_test_app();
    let token = register_and_login(&app, "emptypush@example.com").await;

    let (status, body) = send(&app, "POST", "/api/sync/push", Some(&token), Some(json!({ "cards": [] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VAL_001");
}

#[tokio::test]
async fn test_runs_of_other_users_look_missing() {
    let app = create_test_app();
    let owner = register_and_login(&app, "runowner@example.com").await;
    let other = register_and_login(&app, "runother@example.com").await;

    let (_, receipt) = send(
        &app,
        "POST",
        "/api/sync/push",
        Some(&owner),
        Some(json!({ "cards": [{ "card_id": "c1", "front": "Q", "back": "A", "deck_name": "AnkiRAG" }] })),
    )
    .await;
    let sync_id = receipt["sync_id"].as_str().unwrap();

    let (status, body) = send(&app, "POST", &format!("/api/sync/execute/{sync_id}"), Some(&other), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "RES_001");
}

#[tokio::test]
async fn test_agent_report_shows_in_history() {
    let app = create_test_app();
    let token = register_and_login(&app, "agent@example.com").await;

    let (status, run) = send(
        &app,
        "POST",
        "/api/sync/complete",
        Some(&token),
        Some(json!({ "cards_synced": 3, "cards_failed": 1, "cards_skipped": 2, "errors": ["model was not found"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["source"], "agent");
    assert_eq!(run["total_cards"], 6);

    let (status, history) = send(&app, "GET", "/api/sync/history?limit=5", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let runs = history.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["synced_cards"], 3);
    assert_eq!(runs[0]["errors"], json!(["model was not found"]));

    let (status, _) = send(
        &app,
        "POST",
        "/api/sync/complete",
        Some(&token),
        Some(json!({ "cards_synced": -1, "cards_failed": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_import_creates_deck_and_skips_known_notes() {
    let app = create_test_app();
    let token = register_and_login(&app, "import@example.com").await;
    let request = json!({
        "deck_name": "From Anki",
        "mark_as_synced": true,
        "cards": [
            { "front": "Capital of France?", "back": "Paris", "anki_note_id": 11 },
            { "front": "Capital of Spain?", "back": "Madrid", "anki_note_id": 12, "tags": ["geo"] }
        ]
    });

    let (status, result) = send(&app, "POST", "/api/sync/import/cards", Some(&token), Some(request.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(result["deck_name"], "From Anki");
    assert_eq!(result["imported_cards"], 2);
    assert_eq!(result["card_ids"].as_array().unwrap().len(), 2);

    let (_, again) = send(&app, "POST", "/api/sync/import/cards", Some(&token), Some(request)).await;
    assert_eq!(again["imported_cards"], 0);
    assert_eq!(again["skipped_cards"], 2);
    assert_eq!(again["deck_id"], result["deck_id"]);

    let (_, page) = send(&app, "GET", "/api/cards?status=synced", Some(&token), None).await;
    assert_eq!(page["total"], 2);
}

#[tokio::test]
async fn test_import_into_foreign_deck_fails() {
    let app = create_test_app();
    let owner = register_and_login(&app, "deckowner@example.com").await;
    let other = register_and_login(&app, "importer@example.com").await;
    let deck = create_deck(&app, &owner, "Mine", None).await;
    create_card(&app, &owner, deck["id"].as_str().unwrap(), "Q", "A").await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/sync/import/cards",
        Some(&other),
        Some(json!({ "deck_id": deck["id"], "cards": [{ "front": "Q", "back": "A" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_apkg_upload_imports_notes() {
    let app = create_test_app();
    let token = register_and_login(&app, "apkg@example.com").await;
    let package = build_apkg("Capitals", &[("Capital of France?", "Paris"), ("Capital of Spain?", "Madrid")]);
    let parts: [(&str, Option<&str>, &[u8]); 3] = [
        ("file", Some("capitals.apkg"), package.as_slice()),
        ("tags", None, b"imported, europe".as_slice()),
        ("mark_as_synced", None, b"true".as_slice()),
    ];

    let (status, body) = send_multipart(&app, "/api/sync/import", &token, &parts).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let result: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(result["deck_name"], "Capitals");
    assert_eq!(result["imported_cards"], 2);
    assert_eq!(result["note_types"], json!(["Basic"]));

    let card_id = result["card_ids"][0].as_str().unwrap();
    let (_, card) = send(&app, "GET", &format!("/api/cards/{card_id}"), Some(&token), None).await;
    assert_eq!(card["fields"]["Front"], "Capital of France?");
    assert_eq!(card["fields"]["Back"], "Paris");
    assert_eq!(card["tags"], json!(["anki", "imported", "europe"]));
    assert_eq!(card["status"], "synced");

    // Same notes again are recognised by their Anki note id
    let (status, body) = send_multipart(&app, "/api/sync/import", &token, &parts).await;
    assert_eq!(status, StatusCode::CREATED);
    let again: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(again["skipped_cards"], 2);
    assert_eq!(again["deck_id"], result["deck_id"]);
}

#[tokio::test]
async fn test_apkg_upload_rejects_other_files() {
    let app = create_test_app();
    let token = register_and_login(&app, "notapkg@example.com").await;

    let (status, body) = send_multipart(&app, "/api/sync/import", &token, &[("file", Some("notes.txt"), b"hello".as_slice())]).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");

    let (status, body) = send_multipart(&app, "/api/sync/import", &token, &[("file", Some("broken.apkg"), b"hello".as_slice())]).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    assert!(body.contains("VAL_001"));

    let (status, _) = send_multipart(&app, "/api/sync/import", &token, &[("tags", None, b"x".as_slice())]).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_apkg_stream_reports_progress() {
    let app = create_test_app();
    let token = register_and_login(&app, "apkgstream@example.com").await;
    let package = build_apkg("Capitals", &[("Capital of Italy?", "Rome")]);

    let (status, body) =
        send_multipart(&app, "/api/sync/import/stream", &token, &[("file", Some("capitals.apkg"), package.as_slice())]).await;
    assert_eq!(status, StatusCode::OK);

    let events: Vec<&str> = body.lines().filter_map(|line| line.strip_prefix("event:").map(str::trim)).collect();
    assert_eq!(events.first(), Some(&"progress"));
    assert_eq!(events.last(), Some(&"complete"));
    assert!(body.contains("\"stage\":\"parsing\""));
    assert!(body.contains("\"imported_cards\":1"));
}
