//! Demo `customers` upstream.
//!
//! Serves a shared feed of customers over SSE (`GET /customers`) and
//! WebSocket (`/ws/customers`), a failure-injecting `GET /error/{id}`, a
//! counting `GET /hello` and `GET /health`.
pub mod feed;
pub mod reliability;

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderName, HeaderValue, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use eyre::{Result, WrapErr};
use futures_util::{Stream, StreamExt};
use tokio::{net::TcpListener, sync::broadcast};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub use feed::{Customer, CustomerFeed};
pub use reliability::{ErrorCall, FailureInjector, HelloCounter};

pub static X_ERROR_COUNT: HeaderName = HeaderName::from_static("x-error-count");

#[derive(Debug, Clone)]
pub struct CustomersConfig {
    /// Calls per key that fail before `/error/{id}` succeeds.
    pub error_failures: u32,
    /// Cadence of the customer feed.
    pub interval: Duration,
    /// Per-subscriber backlog before the oldest customers are skipped.
    pub buffer: usize,
}

impl Default for CustomersConfig {
    fn default() -> Self {
        Self {
            error_failures: 5,
            interval: Duration::from_secs(1),
            buffer: 16,
        }
    }
}

#[derive(Clone)]
pub struct CustomersState {
    feed: CustomerFeed,
    errors: Arc<FailureInjector>,
    hello: Arc<HelloCounter>,
    shutdown: CancellationToken,
}

impl CustomersState {
    pub fn new(config: &CustomersConfig, shutdown: CancellationToken) -> Self {
        Self {
            feed: CustomerFeed::new(config.interval, config.buffer, shutdown.clone()),
            errors: Arc::new(FailureInjector::new(config.error_failures)),
            hello: Arc::new(HelloCounter::new()),
            shutdown,
        }
    }

    pub fn feed(&self) -> &CustomerFeed {
        &self.feed
    }
}

pub fn router(state: CustomersState) -> Router {
    Router::new()
        .route("/customers", get(customers_sse))
        .route("/ws/customers", get(customers_ws))
        .route("/error/{id}", get(error))
        .route("/hello", get(hello))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the demo service on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    config: CustomersConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().wrap_err("Failed to read local address")?;
    tracing::info!(
        "Customers service listening on {} (error failures: {}, interval: {:?})",
        addr,
        config.error_failures,
        config.interval
    );

    let app = router(CustomersState::new(&config, shutdown.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .wrap_err("Customers service failed")
}

fn customer_events(
    receiver: broadcast::Receiver<Customer>,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(customer) => Some(Event::default().json_data(&customer)),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::debug!("SSE subscriber lagged, skipped {} customers", skipped);
                None
            }
        }
    })
}

async fn customers_sse(State(state): State<CustomersState>) -> impl IntoResponse {
    let shutdown = state.shutdown.clone();
    let events = customer_events(state.feed.subscribe())
        .take_until(async move { shutdown.cancelled().await });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn customers_ws(ws: WebSocketUpgrade, State(state): State<CustomersState>) -> Response {
    ws.on_upgrade(move |socket| stream_customers(socket, state))
}

async fn stream_customers(mut socket: WebSocket, state: CustomersState) {
    let mut receiver = state.feed.subscribe();
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            customer = receiver.recv() => match customer {
                Ok(customer) => {
                    let Ok(json) = serde_json::to_string(&customer) else {
                        continue;
                    };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("WebSocket subscriber lagged, skipped {} customers", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn error(State(state): State<CustomersState>, Path(id): Path<String>) -> Response {
    match state.errors.call(&id).await {
        ErrorCall::Failed { count } => {
            let mut response = (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "service unavailable", "count": count })),
            )
                .into_response();
            response
                .headers_mut()
                .insert(X_ERROR_COUNT.clone(), HeaderValue::from(count));
            response
        }
        ErrorCall::Succeeded { count } => Json(serde_json::json!({
            "message": format!("good job, {id} you did in try number {count}"),
            "count": count,
        }))
        .into_response(),
    }
}

async fn hello(State(state): State<CustomersState>) -> &'static str {
    state.hello.record().await;
    "hello()"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "UP" }))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    fn app(error_failures: u32) -> Router {
        router(CustomersState::new(
            &CustomersConfig {
                error_failures,
                interval: Duration::from_millis(10),
                buffer: 8,
            },
            CancellationToken::new(),
        ))
    }

    async fn get_json(app: Router, path: &str) -> (StatusCode, Option<HeaderValue>, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let count = response.headers().get(&X_ERROR_COUNT).cloned();
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        (status, count, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_error_endpoint_counts_per_id() {
        let app = app(2);
        let (status, header, body) = get_json(app.clone(), "/error/alice").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header.unwrap(), "1");
        assert_eq!(body["count"], 1);

        let (status, _, _) = get_json(app.clone(), "/error/alice").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, header, body) = get_json(app.clone(), "/error/alice").await;
        assert_eq!(status, StatusCode::OK);
        assert!(header.is_none());
        assert_eq!(body["message"], "good job, alice you did in try number 3");
        assert_eq!(body["count"], 3);

        let (status, _, body) = get_json(app, "/error/bob").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn test_health_and_hello() {
        let (status, _, body) = get_json(app(5), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "UP");

        let response = app(5)
            .oneshot(Request::builder().uri("/hello").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 64).await.unwrap();
        assert_eq!(&body[..], b"hello()");
    }

    #[tokio::test]
    async fn test_sse_stream_emits_customers() {
        let response = app(5)
            .oneshot(Request::builder().uri("/customers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let mut seen = String::new();
        while !seen.contains("\n\n") {
            let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        let data = seen
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
            .unwrap();
        let customer: Customer = serde_json::from_str(data.trim()).unwrap();
        assert_eq!(customer, Customer::numbered(customer.id));
    }
}
