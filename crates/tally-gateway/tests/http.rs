//! HTTP integration tests for the gateway routes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, Request, StatusCode};
use axum_test::TestServer;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;

use tally_gateway::{create_router, AppState, GatewayConfig};
use tally_notify::{
    start_processor, ChangeEvent, ChangeNotifier, ClientInfo, JwtVerifier, NotifierConfig,
    SharedNotifier, SledTimestampStore, Transport,
};

const SECRET: &str = "gateway-test-secret";

struct TestContext {
    notifier: SharedNotifier,
    state: AppState,
}

impl TestContext {
    fn new(config: GatewayConfig) -> Self {
        let store = SledTimestampStore::temporary().expect("temporary store");
        let notifier = ChangeNotifier::shared(Arc::new(store), NotifierConfig::default());
        let feed = start_processor(notifier.clone(), config.feed_config());

        let mut state = AppState::new(notifier.clone(), feed, config.clone());
        if let Some(secret) = config.jwt_secret.as_deref() {
            state = state.with_verifier(Arc::new(JwtVerifier::with_secret_str(secret)));
        }

        Self { notifier, state }
    }

    fn open() -> Self {
        Self::new(GatewayConfig::default())
    }

    fn server(&self) -> TestServer {
        TestServer::new(create_router(self.state.clone())).expect("test server")
    }

    /// Server on a real socket, needed for WebSocket upgrades.
    fn http_server(&self) -> TestServer {
        TestServer::builder()
            .http_transport()
            .build(create_router(self.state.clone()))
            .expect("http test server")
    }

    async fn wait_for_subscribers(&self, expected: usize) {
        for _ in 0..200 {
            if self.notifier.subscriber_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} subscribers, found {}",
            expected,
            self.notifier.subscriber_count()
        );
    }
}

fn token(sub: &str) -> String {
    let claims = json!({
        "sub": sub,
        "exp": Utc::now().timestamp() + 3600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn next_frame(body: &mut Body) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .expect("frame in time")
        .expect("stream still open")
        .expect("frame ok");
    let data = frame.into_data().expect("data frame");
    String::from_utf8(data.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let ctx = TestContext::open();
    let server = ctx.server();

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["subscribers"], 0);
    assert!(body.get("change_feed_subscribed").is_none());
}

#[tokio::test]
async fn test_poll_initializes_and_is_stable() {
    let ctx = TestContext::open();
    let server = ctx.server();

    let first: Value = server.get("/api/status/stocks").await.json();
    let second: Value = server.get("/api/status/stocks").await.json();

    let at = first["lastUpdatedAt"].as_str().expect("timestamp string");
    assert!(DateTime::parse_from_rfc3339(at).is_ok());
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_webhook_reaches_subscriber_and_moves_timestamp() {
    let ctx = TestContext::open();
    let server = ctx.server();
    let before = ctx.notifier.last_change_at();

    let mut subscription = ctx.notifier.subscribe(ClientInfo::new(Transport::Internal));

    let response = server
        .post("/api/webhooks/stocks-updated")
        .json(&json!({
            "table": "items",
            "type": "UPDATE",
            "record": { "id": 7, "stock": 3 }
        }))
        .await;
    response.assert_status_ok();
    let ack: Value = response.json();
    assert_eq!(ack["message"], "Notification received successfully.");
    let new_timestamp = DateTime::parse_from_rfc3339(ack["newTimestamp"].as_str().unwrap())
        .unwrap()
        .with_timezone(&Utc);
    assert!(new_timestamp >= before);

    let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("update in time")
        .expect("subscription open");
    assert_eq!(event.subject.as_deref(), Some("items"));
    assert_eq!(event.payload, Some(json!({ "id": 7, "stock": 3 })));

    let polled: Value = server.get("/api/status/stocks").await.json();
    // The change is recorded before the webhook answers.
    assert_eq!(polled["lastUpdatedAt"], ack["newTimestamp"]);
}

#[tokio::test]
async fn test_webhook_empty_body_is_generic_change() {
    let ctx = TestContext::open();
    let server = ctx.server();
    let mut subscription = ctx.notifier.subscribe(ClientInfo::new(Transport::Internal));

    server
        .post("/api/webhooks/stocks-updated")
        .await
        .assert_status_ok();

    let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.subject.is_none());
}

#[tokio::test]
async fn test_webhook_rejects_malformed_json() {
    let ctx = TestContext::open();
    let server = ctx.server();

    let response = server
        .post("/api/webhooks/stocks-updated")
        .text("{not json")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_webhook_secret() {
    let ctx = TestContext::new(GatewayConfig::default().with_webhook_secret("hook"));
    let server = ctx.server();
    let name = HeaderName::from_static("x-webhook-secret");

    server
        .post("/api/webhooks/stocks-updated")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .post("/api/webhooks/stocks-updated")
        .add_header(name.clone(), HeaderValue::from_static("wrong"))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .post("/api/webhooks/stocks-updated")
        .add_header(name, HeaderValue::from_static("hook"))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_stream_requires_token_when_configured() {
    let ctx = TestContext::new(GatewayConfig::default().with_jwt_secret(SECRET));
    let server = ctx.server();

    server
        .get("/api/status/stream")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .get("/api/status/stream")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer not-a-token"),
        )
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    assert_eq!(ctx.notifier.subscriber_count(), 0);
}

#[tokio::test]
async fn test_stream_accepts_query_token() {
    let ctx = TestContext::new(GatewayConfig::default().with_jwt_secret(SECRET));
    let app = create_router(ctx.state.clone());

    let uri = format!("/api/status/stream?access_token={}", token("cashier-1"));
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    assert!(next_frame(&mut body).await.contains("event: connected"));
    assert_eq!(ctx.notifier.subscriber_count(), 1);
}

#[tokio::test]
async fn test_stream_sends_connected_then_updates() {
    let ctx = TestContext::open();
    let app = create_router(ctx.state.clone());

    let response = app
        .oneshot(
            Request::get("/api/status/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let mut body = response.into_body();
    let connected = next_frame(&mut body).await;
    assert!(connected.contains("event: connected"));
    assert!(connected.contains("Connection established"));
    assert_eq!(ctx.notifier.subscriber_count(), 1);

    assert_eq!(ctx.notifier.broadcast(&ChangeEvent::update()), 1);
    let update = next_frame(&mut body).await;
    assert!(update.contains("event: update"));
    assert!(update.contains(r#""kind":"update""#));

    drop(body);
    assert_eq!(ctx.notifier.subscriber_count(), 0);
}

#[tokio::test]
async fn test_stream_ends_on_disconnect_all() {
    let ctx = TestContext::open();
    let app = create_router(ctx.state.clone());

    let response = app
        .oneshot(
            Request::get("/api/status/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let mut body = response.into_body();
    next_frame(&mut body).await;

    ctx.notifier.disconnect_all();

    let end = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .expect("stream ends in time");
    assert!(end.is_none());
}

#[tokio::test]
async fn test_cors_allows_configured_origin() {
    let ctx = TestContext::open();
    let server = ctx.server();

    let response = server
        .get("/health")
        .add_header(
            header::ORIGIN,
            HeaderValue::from_static("http://localhost:5173"),
        )
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:5173"
    );
}

#[tokio::test]
async fn test_websocket_sends_connected_then_updates() {
    let ctx = TestContext::open();
    let server = ctx.http_server();

    let mut socket = server
        .get_websocket("/ws/changes")
        .await
        .into_websocket()
        .await;

    let connected: Value = socket.receive_json().await;
    assert_eq!(
        connected,
        json!({"kind": "connected", "message": "Connection established"})
    );
    assert_eq!(ctx.notifier.subscriber_count(), 1);

    assert_eq!(
        ctx.notifier
            .broadcast(&ChangeEvent::update().with_subject("items")),
        1
    );
    let update: Value = socket.receive_json().await;
    assert_eq!(update, json!({"kind": "update", "subject": "items"}));

    socket.close().await;
    ctx.wait_for_subscribers(0).await;
}

#[tokio::test]
async fn test_websocket_requires_token_when_configured() {
    let ctx = TestContext::new(GatewayConfig::default().with_jwt_secret(SECRET));
    let server = ctx.http_server();

    server
        .get_websocket("/ws/changes")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(ctx.notifier.subscriber_count(), 0);

    let uri = format!("/ws/changes?access_token={}", token("cashier-2"));
    let mut socket = server.get_websocket(&uri).await.into_websocket().await;

    let connected: Value = socket.receive_json().await;
    assert_eq!(connected["kind"], "connected");
    assert_eq!(ctx.notifier.subscriber_count(), 1);

    socket.close().await;
    ctx.wait_for_subscribers(0).await;
}
