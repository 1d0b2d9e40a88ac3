// src/routes.rs

use crate::{identity::AuthUser, models::UserId, state::AppState, websocket::websocket_handler};
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Builds the application router.
pub fn build_router(state: AppState) -> Router {
    let chat = Router::new().route("/rooms/{id}/ws", get(websocket_handler));

    let presence = Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/status", post(online_status))
        .route("/online", get(online_users));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/chat", chat)
        .nest("/api/v1/presence", presence)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// `POST /api/v1/presence/heartbeat`, sent by clients every 30 seconds.
async fn heartbeat(State(state): State<AppState>, AuthUser(identity): AuthUser) -> Json<Value> {
    state.presence.heartbeat(identity.user_id);
    Json(json!({ "message": "heartbeat received" }))
}

#[derive(Debug, Deserialize)]
struct OnlineStatusRequest {
    user_ids: Vec<UserId>,
}

/// `POST /api/v1/presence/status`: online flag for each requested user.
async fn online_status(
    State(state): State<AppState>,
    _caller: AuthUser,
    Json(request): Json<OnlineStatusRequest>,
) -> Json<Value> {
    let status: BTreeMap<UserId, bool> = request
        .user_ids
        .into_iter()
        .map(|user_id| (user_id, state.presence.is_online(user_id)))
        .collect();
    Json(json!({ "online_status": status }))
}

/// `GET /api/v1/presence/online`
async fn online_users(State(state): State<AppState>, _caller: AuthUser) -> Json<Value> {
    Json(json!({ "online_users": state.presence.online_users() }))
}
