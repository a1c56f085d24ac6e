/// Integration tests for registration, login and token handling

mod common;

use axum::http::StatusCode;
use common::{create_test_app, register_and_login, send};
use serde_json::json;

#[tokio::test]
async fn test_register_and_read_profile() {
    let app = create_test_app();
    let token = register_and_login(&app, "Alice@Example.com").await;

    let (status, me) = send(&app, "GET", "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["email"], "alice@example.com");
    assert_eq!(me["display_name"], "Tester");
    assert!(me.get("hashed_password").is_none());
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let app = create_test_app();
    register_and_login(&app, "bob@example.com").await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "email": "BOB@example.com", "password": "another-pass", "display_name": "Bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONF_001");
}

#[tokio::test]
async fn test_short_password_is_rejected() {
    let app = create_test_app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "email": "c@example.com", "password": "short", "display_name": "C" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VAL_001");
}

#[tokio::test]
async fn test_wrong_password() {
    let app = create_test_app();
    register_and_login(&app, "dana@example.com").await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "dana@example.com", "password": "wrong-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTH_001");
}

#[tokio::test]
async fn test_missing_and_garbage_tokens() {
    let app = create_test_app();

    let (status, _) = send(&app, "GET", "/api/decks", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, "GET", "/api/decks", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"]["code"].as_str().unwrap().starts_with("AUTH_"));
}

#[tokio::test]
async fn test_refresh_rotates_and_revokes() {
    let app = create_test_app();
    register_and_login(&app, "erin@example.com").await;
    let (_, tokens) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "erin@example.com", "password": "correct-horse" })),
    )
    .await;
    let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    let (status, rotated) = send(
        &app,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(rotated["refresh_token"], tokens["refresh_token"]);

    // The old refresh token was revoked by the rotation
    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_access_token_cannot_refresh() {
    let app = create_test_app();
    let access = register_and_login(&app, "finn@example.com").await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({ "refresh_token": access })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_deactivated_user_cannot_log_in() {
    let app = create_test_app();
    let token = register_and_login(&app, "gail@example.com").await;
    let (_, me) = send(&app, "GET", "/api/auth/me", Some(&token), None).await;
    let id = me["id"].as_str().unwrap();

    let (status, _) = send(&app, "POST", &format!("/api/users/{id}/deactivate"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "gail@example.com", "password": "correct-horse" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "AUTH_005");
}
