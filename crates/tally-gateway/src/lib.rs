//! Tally live-update gateway.
//!
//! This crate exposes the change notifier over HTTP: a Server-Sent Events
//! stream and a WebSocket channel for subscribers, a last-change timestamp
//! for clients that poll, and a webhook the database calls when watched
//! tables change.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;

pub use config::{Args, GatewayConfig};
pub use error::AppError;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tally_notify::{ChangeFeedHandle, ListenerStatus, SharedNotifier, TokenVerifier};

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Subscriber registry and last-change timestamp.
    pub notifier: SharedNotifier,
    /// Queue into the change feed processor.
    pub feed: ChangeFeedHandle,
    /// Session-token verifier. `None` leaves subscription endpoints open.
    pub verifier: Option<Arc<dyn TokenVerifier>>,
    /// LISTEN/NOTIFY status, when the listener is configured.
    pub listener: Option<ListenerStatus>,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl AppState {
    /// Create new application state.
    pub fn new(notifier: SharedNotifier, feed: ChangeFeedHandle, config: GatewayConfig) -> Self {
        Self {
            notifier,
            feed,
            verifier: None,
            listener: None,
            config,
        }
    }

    /// Require bearer tokens checked by `verifier` on subscription endpoints.
    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Report the change feed listener in health checks.
    pub fn with_listener(mut self, status: ListenerStatus) -> Self {
        self.listener = Some(status);
        self
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .merge(routes::health::routes())
        .merge(routes::status::routes())
        .merge(routes::ws::routes())
        .merge(routes::webhook::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let values = origins.iter().filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        });
        AllowOrigin::list(values)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}
