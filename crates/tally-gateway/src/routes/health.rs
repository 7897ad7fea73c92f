//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" while the change feed listener is down.
    pub status: String,
    /// Gateway version.
    pub version: String,
    /// Live subscribers.
    pub subscribers: usize,
    /// Listener state; absent when only the webhook feeds changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_feed_subscribed: Option<bool>,
}

/// Health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let change_feed_subscribed = state.listener.as_ref().map(|status| status.is_subscribed());
    let healthy = change_feed_subscribed.unwrap_or(true) && !state.feed.is_closed();

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        subscribers: state.notifier.subscriber_count(),
        change_feed_subscribed,
    })
}
