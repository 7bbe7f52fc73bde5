pub mod health;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/webhook/message", post(webhook::message_handler))
        .route("/webhook/session", post(webhook::session_handler))
        .with_state(state)
}
