//! WebSocket change channel.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use tally_notify::{ChangeEvent, ClientInfo, SharedNotifier, Transport};

use crate::auth::MaybeUser;
use crate::AppState;

/// Largest frame accepted from a client. Clients only ever send control frames.
const MAX_CLIENT_MESSAGE_SIZE: usize = 4 * 1024;

/// WebSocket routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/changes", get(ws_changes))
}

/// WebSocket upgrade handler for change subscriptions.
async fn ws_changes(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    user: MaybeUser,
) -> Response {
    let notifier = state.notifier.clone();
    ws.max_message_size(MAX_CLIENT_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, notifier, user))
}

/// Push change events as JSON text frames until either side closes.
async fn handle_socket(socket: WebSocket, notifier: SharedNotifier, user: MaybeUser) {
    let client = ClientInfo::new(Transport::WebSocket).with_user(user.user_id());
    let mut subscription = notifier.subscribe(client);
    let subscriber_id = subscription.id();

    let (mut sink, mut incoming) = socket.split();

    if let Err(e) = send_event(&mut sink, &ChangeEvent::connected()).await {
        tracing::debug!(%subscriber_id, error = %e, "websocket closed before acknowledgement");
        return;
    }

    // Subscriber -> client. Owns the subscription, so aborting it deregisters.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            if let Err(e) = send_event(&mut sink, &event).await {
                tracing::debug!(%subscriber_id, error = %e, "websocket send failed");
                break;
            }
        }
    });

    // Client -> server: only watched for close and errors.
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = incoming.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(%subscriber_id, error = %e, "websocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::debug!(%subscriber_id, "websocket connection finished");
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ChangeEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sink.send(Message::Text(text)).await
}
