use std::{
    error::Error as _,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, FromRequestParts, ws::WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use hyper::Request;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::{
        middleware::{RequestId, request_id_middleware, request_timing_middleware},
        websocket,
    },
    core::{GatewayService, context::RequestContext, streaming::UpstreamSocket},
    error::GatewayError,
    metrics::{instance_health_snapshot, render_prometheus},
};

/// Inbound HTTP handler for the Rampart gateway.
///
/// Built-in endpoints (`/health`, `/status`, `/metrics`,
/// `/metrics/prometheus`) are answered before
/// routing; everything else goes through [`GatewayService::handle`].
#[derive(Clone)]
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    started_at: Instant,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self {
            gateway,
            started_at: Instant::now(),
        }
    }

    /// Axum router serving every path through this handler.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(move |req: Request<AxumBody>| {
                let handler = self.clone();
                async move {
                    let client_addr = req
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|info| info.0);
                    handler.handle_request(req, client_addr).await
                }
            })
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response {
        if req.method() == Method::GET {
            match req.uri().path() {
                "/health" => return self.handle_health().await,
                "/status" => return self.handle_status().await,
                "/metrics" => return self.handle_metrics(),
                "/metrics/prometheus" => return handle_prometheus(),
                _ => {}
            }
        }
        self.handle_proxy_request(req, client_addr).await
    }

    async fn handle_health(&self) -> Response {
        let discovery = self.gateway.discovery();
        let mut services = serde_json::Map::new();
        let (mut healthy, mut total) = (0usize, 0usize);

        for name in discovery.services() {
            let Ok(instances) = discovery.resolve(&name).await else {
                continue;
            };
            let service_healthy = instances.iter().filter(|i| i.healthy).count();
            healthy += service_healthy;
            total += instances.len();
            services.insert(
                name,
                serde_json::json!({
                    "healthy": service_healthy,
                    "total": instances.len(),
                    "instances": instances
                        .iter()
                        .map(|i| serde_json::json!({ "address": i.address.as_str(), "healthy": i.healthy }))
                        .collect::<Vec<_>>(),
                }),
            );
        }

        let status = if total == 0 || healthy > 0 {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let body = serde_json::json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
            "instances": { "healthy": healthy, "total": total },
            "services": services,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(status, body)
    }

    async fn handle_status(&self) -> Response {
        let status = self.gateway.status().await;
        let body = serde_json::json!({
            "service": "Rampart",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "route_table": status,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(StatusCode::OK, body)
    }

    fn handle_metrics(&self) -> Response {
        let body = serde_json::json!({
            "outcomes": self.gateway.counters().snapshot(),
            "instance_health": instance_health_snapshot(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(StatusCode::OK, body)
    }

    async fn handle_proxy_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response {
        let (mut parts, body) = req.into_parts();
        let limit = self.gateway.settings().max_body_bytes;

        let upgrade = if is_websocket_upgrade(&parts.headers) {
            match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                Ok(upgrade) => Some(upgrade),
                Err(rejection) => return rejection.into_response(),
            }
        } else {
            None
        };

        let declared_length = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared_length.is_some_and(|len| len > limit) {
            return GatewayError::PayloadTooLarge(limit).into_response();
        }
        let body = match axum::body::to_bytes(body, limit).await {
            Ok(body) => body,
            Err(e) if e.source().is_some_and(|s| s.is::<LengthLimitError>()) => {
                return GatewayError::PayloadTooLarge(limit).into_response();
            }
            Err(e) => {
                return GatewayError::InvalidRequest(format!("failed to read request body: {e}"))
                    .into_response();
            }
        };

        let request_id = parts.extensions.get::<RequestId>().map(|id| id.0.clone());
        let mut ctx = RequestContext::new(parts.method, parts.uri)
            .with_headers(parts.headers)
            .with_body(body);
        if let Some(addr) = client_addr {
            ctx = ctx.with_client_addr(addr);
        }
        if let Some(id) = request_id {
            ctx.request_id = id;
        }
        ctx.websocket = upgrade.is_some();
        let request_id = ctx.request_id.clone();

        match self.gateway.handle(ctx).await {
            Ok(response) => {
                let upstream = response
                    .extensions()
                    .get::<UpstreamSocket>()
                    .and_then(UpstreamSocket::take);
                match (upgrade, upstream) {
                    (Some(upgrade), Some(socket)) => upgrade
                        .on_upgrade(move |client| websocket::relay(client, socket, request_id)),
                    _ => response,
                }
            }
            Err(e) => {
                if e.status().is_server_error() {
                    tracing::warn!("Request {} failed: {}", request_id, e);
                } else {
                    tracing::debug!("Request {} rejected: {}", request_id, e);
                }
                e.into_response()
            }
        }
    }
}

fn handle_prometheus() -> Response {
    match render_prometheus() {
        Some(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        None => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "prometheus recorder not installed" }),
        ),
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
