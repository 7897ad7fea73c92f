//! Server-Sent Events stream and last-change polling.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use serde::Serialize;

use tally_notify::{ChangeEvent, ClientInfo, Transport};

use crate::auth::MaybeUser;
use crate::AppState;

/// Status routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/status/stream", get(handle_stream))
        .route("/api/status/stocks", get(handle_last_change))
}

/// Polling response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastChangeResponse {
    /// ISO-8601 time of the last recorded change.
    pub last_updated_at: DateTime<Utc>,
}

/// Open an event stream.
///
/// Sends `connected` once, then one `update` per broadcast. The subscriber is
/// deregistered when the client goes away and the response body is dropped.
async fn handle_stream(
    State(state): State<AppState>,
    user: MaybeUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client = ClientInfo::new(Transport::Sse).with_user(user.user_id());
    let subscription = state.notifier.subscribe(client);

    let events = stream::once(async { ChangeEvent::connected() })
        .chain(subscription)
        .map(|event| Ok(to_sse_event(&event)));

    Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.keep_alive))
}

/// Return the last-change timestamp.
async fn handle_last_change(State(state): State<AppState>) -> Json<LastChangeResponse> {
    Json(LastChangeResponse {
        last_updated_at: state.notifier.last_change_at(),
    })
}

fn to_sse_event(event: &ChangeEvent) -> Event {
    let sse = Event::default().event(event.kind.as_str());
    match serde_json::to_string(event) {
        Ok(json) => sse.data(json),
        Err(e) => {
            tracing::warn!(error = %e, kind = %event.kind, "failed to encode change event");
            sse.data("{}")
        }
    }
}
