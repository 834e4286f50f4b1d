use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde_json::json;
use tracing::warn;

use crate::hooks::{self, HookServer};
use crate::models::HealthResponse;
use crate::registry::AgentRegistry;
use crate::ws::{self, UiNotifier};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub hooks: Arc<HookServer>,
    pub notifier: UiNotifier,
}

/// All routes. Hook traffic POSTs to any path, so ingestion is the fallback;
/// the named routes are the front-end surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/agents", get(get_agents).delete(clear_agents))
        .route("/api/agents/tree", get(get_tree))
        .route("/api/agents/stats", get(get_stats))
        .route("/api/agents/:id", delete(terminate_agent))
        .route("/ws", get(ws::ws_handler))
        .fallback(hooks::ingest)
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn get_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.get_active_agents().await)
}

pub async fn get_tree(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.get_agent_tree().await)
}

pub async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.get_stats().await)
}

pub async fn clear_agents(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.clear_all_agents().await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => {
            warn!("clear_agents error: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

pub async fn terminate_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.terminate_agent(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!("terminate_agent error: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}
