//! Change-feed webhook.
//!
//! The database's webhook integration posts here when a watched table
//! changes. The body is queued on the change feed like a LISTEN/NOTIFY
//! payload, so the feed processor stays the only place that records changes
//! and broadcasts them. The handler waits for the processor and answers with
//! the recorded timestamp.

use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;

use tally_notify::RowChange;

use crate::error::AppError;
use crate::AppState;

/// Header carrying the shared webhook secret.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Webhook routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/api/webhooks/stocks-updated", post(handle_change_webhook))
}

/// Webhook acknowledgement.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub message: String,
    /// Last-change timestamp after the change was recorded.
    pub new_timestamp: DateTime<Utc>,
}

/// Accept a row change. An empty body is a generic change signal.
async fn handle_change_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    if let Some(expected) = state.config.webhook_secret.as_deref() {
        let provided = headers
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected) {
            return Err(AppError::Unauthorized("invalid webhook secret".to_string()));
        }
    }

    let change = if body.iter().all(u8::is_ascii_whitespace) {
        RowChange::default()
    } else {
        serde_json::from_slice::<RowChange>(&body)?
    };

    tracing::info!(
        table = ?change.table,
        operation = ?change.operation,
        "change webhook received"
    );

    let reply = state.feed.try_submit(change).map_err(|e| match e {
        TrySendError::Full(_) => AppError::Unavailable("change feed is saturated".to_string()),
        TrySendError::Closed(_) => AppError::Unavailable("change feed is not running".to_string()),
    })?;

    let new_timestamp = reply
        .await
        .map_err(|_| AppError::Unavailable("change feed stopped".to_string()))?;

    Ok(Json(WebhookAck {
        message: "Notification received successfully.".to_string(),
        new_timestamp,
    }))
}
