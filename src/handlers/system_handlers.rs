use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::warn;

use crate::db;
use crate::AppState;

/// Handler for the health check
///
/// This function handles GET requests to `/health`. It answers 503 when the
/// database does not respond; an unreachable LLM service only marks the
/// status as degraded.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database = match db::ping(&state.pool) {
        Ok(()) => true,
        Err(err) => {
            warn!("Database health check failed: {:#}", err);
            false
        }
    };
    let llm = state.llm.health().await;

    let (code, status) = match (database, llm) {
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        (true, false) => (StatusCode::OK, "degraded"),
        (true, true) => (StatusCode::OK, "healthy"),
    };
    (
        code,
        Json(json!({
            "status": status,
            "database": if database { "connected" } else { "disconnected" },
            "llm": if llm { "connected" } else { "disconnected" },
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// Handler for the readiness check; ready once the database answers
pub async fn ready_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match db::ping(&state.pool) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not_ready" }))),
    }
}

pub async fn live_handler() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}
