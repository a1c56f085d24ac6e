/// Integration tests for the deck endpoints

mod common;

use axum::http::StatusCode;
use common::{create_card, create_deck, create_test_app, register_and_login, send};
use serde_json::json;

#[tokio::test]
async fn test_create_and_list_decks() {
    let app = create_test_app();
    let token = register_and_login(&app, "decks@example.com").await;

    let deck = create_deck(&app, &token, "Rust", None).await;
    assert_eq!(deck["name"], "Rust");
    create_deck(&app, &token, "Biology", None).await;

    let (status, page) = send(&app, "GET", "/api/decks", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 2);
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let app = create_test_app();
    let token = register_and_login(&app, "dupdeck@example.com").await;
    create_deck(&app, &token, "Rust", None).await;

    let (status, body) = send(&app, "POST", "/api/decks", Some(&token), Some(json!({ "name": "Rust" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONF_001");
}

#[tokio::test]
async fn test_tree_and_hierarchy() {
    let app = create_test_app();
    let token = register_and_login(&app, "tree@example.com").await;
    let root = create_deck(&app, &token, "Languages", None).await;
    let root_id = root["id"].as_str().unwrap();
    let child = create_deck(&app, &token, "Rust", Some(root_id)).await;
    let child_id = child["id"].as_str().unwrap();
    let grandchild = create_deck(&app, &token, "Lifetimes", Some(child_id)).await;
    let grandchild_id = grandchild["id"].as_str().unwrap();

    let (status, tree) = send(&app, "GET", "/api/decks/tree", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let roots = tree.as_array().unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0]["name"], "Languages");
    assert_eq!(roots[0]["children"][0]["children"][0]["name"], "Lifetimes");

    let (_, ancestors) = send(&app, "GET", &format!("/api/decks/{grandchild_id}/ancestors"), Some(&token), None).await;
    assert_eq!(ancestors.as_array().unwrap().len(), 2);

    let (_, descendants) = send(&app, "GET", &format!("/api/decks/{root_id}/descendants"), Some(&token), None).await;
    assert_eq!(descendants.as_array().unwrap().len(), 2);

    // Moving a deck under its own descendant is refused
    let (status, body) = send(
        &app,
        "PATCH",
        &format!("/api/decks/{root_id}"),
        Some(&token),
        Some(json!({ "parent_id": grandchild_id })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "DECK_001");
}

#[tokio::test]
async fn test_delete_cascades_and_restore() {
    let app = create_test_app();
    let token = register_and_login(&app, "cascade@example.com").await;
    let root = create_deck(&app, &token, "Science", None).await;
    let root_id = root["id"].as_str().unwrap();
    let child = create_deck(&app, &token, "Physics", Some(root_id)).await;
    let child_id = child["id"].as_str().unwrap();
    create_card(&app, &token, root_id, "What is mass?", "Resistance to acceleration").await;
    create_card(&app, &token, child_id, "What is c?", "The speed of light").await;

    let (status, counts) = send(&app, "DELETE", &format!("/api/decks/{root_id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counts, json!({ "deleted_decks": 2, "deleted_cards": 2 }));

    let (status, _) = send(&app, "GET", &format!("/api/decks/{child_id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, restored) = send(&app, "POST", &format!("/api/decks/{root_id}/restore"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["name"], "Science");

    let (status, deck) = send(&app, "GET", &format!("/api/decks/{root_id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deck["card_count"], 1);
}

#[tokio::test]
async fn test_other_users_deck_is_forbidden() {
    let app = create_test_app();
    let owner = register_and_login(&app, "owner@example.com").await;
    let intruder = register_and_login(&app, "intruder@example.com").await;
    let deck = create_deck(&app, &owner, "Private", None).await;
    let deck_id = deck["id"].as_str().unwrap();

    let (status, body) = send(&app, "GET", &format!("/api/decks/{deck_id}"), Some(&intruder), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "PERM_001");

    let (_, page) = send(&app, "GET", "/api/decks", Some(&intruder), None).await;
    assert_eq!(page["total"], 0);
}
