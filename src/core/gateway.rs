use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use axum::body::Body;
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, header};
use serde::Serialize;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::{
    config::{GatewayConfig, StreamingConfig},
    core::{
        backend::InstanceUrl,
        circuit_breaker::{BreakerRegistry, BreakerSnapshot},
        context::RequestContext,
        filter_chain::Chain,
        load_balancer::LoadBalancer,
        route::{Route, RouteError, RouteTarget},
        router::{RouteTable, Router},
        streaming::{UpstreamSocket, is_event_stream, relay_sse_body},
    },
    error::{GatewayError, Outcome},
    metrics::{OutcomeCounters, RequestTimer, increment_upstream_request},
    ports::{
        authenticator::{AuthDecision, Authenticator},
        discovery::Discovery,
        http_client::{HttpClient, HttpClientError},
    },
};

/// Request headers that describe a single connection and are not forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Per-reload settings for upstream calls and streams.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub streaming: StreamingConfig,
}

impl GatewaySettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            request_timeout: config.upstream.request_timeout(),
            max_body_bytes: config.upstream.max_body_bytes,
            streaming: config.streaming.clone(),
        }
    }
}

/// External collaborators swapped together on reload.
struct Collaborators {
    discovery: Arc<dyn Discovery>,
    authenticator: Arc<dyn Authenticator>,
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize)]
pub struct RouteSummary {
    pub id: String,
    pub path: String,
    pub host: Option<String>,
    pub priority: i32,
    pub target: String,
    pub filters: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub version: u64,
    pub routes: Vec<RouteSummary>,
    pub breakers: Vec<BreakerSnapshot>,
}

/// The resilience gateway: matches requests, runs route filter chains and
/// forwards to upstreams.
pub struct GatewayService {
    router: Router,
    breakers: Arc<BreakerRegistry>,
    collaborators: ArcSwap<Collaborators>,
    settings: ArcSwap<GatewaySettings>,
    http_client: Arc<dyn HttpClient>,
    counters: OutcomeCounters,
    versions: AtomicU64,
}

impl GatewayService {
    pub async fn new(
        config: &GatewayConfig,
        discovery: Arc<dyn Discovery>,
        authenticator: Arc<dyn Authenticator>,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Self, RouteError> {
        let breakers = Arc::new(BreakerRegistry::new());
        let table = RouteTable::build(config, 1, &breakers).await?;
        tracing::info!("Built route table v1 with {} routes", table.len());

        Ok(Self {
            router: Router::new(table),
            breakers,
            collaborators: ArcSwap::from_pointee(Collaborators {
                discovery,
                authenticator,
                load_balancer: LoadBalancer::from_config(config),
            }),
            settings: ArcSwap::from_pointee(GatewaySettings::from_config(config)),
            http_client,
            counters: OutcomeCounters::new(),
            versions: AtomicU64::new(1),
        })
    }

    /// Rebuild the route table and collaborators from `config` and swap them
    /// in. Breaker state is kept; on error nothing changes.
    pub async fn reload(
        &self,
        config: &GatewayConfig,
        discovery: Arc<dyn Discovery>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<u64, RouteError> {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let table = RouteTable::build(config, version, &self.breakers).await?;

        self.collaborators.store(Arc::new(Collaborators {
            discovery,
            authenticator,
            load_balancer: LoadBalancer::from_config(config),
        }));
        self.settings
            .store(Arc::new(GatewaySettings::from_config(config)));
        self.router.publish(table);
        Ok(version)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn discovery(&self) -> Arc<dyn Discovery> {
        self.collaborators.load().discovery.clone()
    }

    pub fn settings(&self) -> Arc<GatewaySettings> {
        self.settings.load_full()
    }

    pub fn counters(&self) -> &OutcomeCounters {
        &self.counters
    }

    /// Handle one inbound request end to end and count its outcome.
    pub async fn handle(&self, ctx: RequestContext) -> Outcome {
        let _timer = RequestTimer::new();
        let outcome = self.authenticate_and_dispatch(ctx).await;
        self.counters.record(outcome_label(&outcome));
        outcome
    }

    async fn authenticate_and_dispatch(&self, mut ctx: RequestContext) -> Outcome {
        let authenticator = self.collaborators.load().authenticator.clone();
        match authenticator.authenticate(&ctx.headers).await {
            AuthDecision::Rejected => return Err(GatewayError::Unauthorized),
            AuthDecision::Authenticated(principal) => ctx.principal = Some(principal),
            AuthDecision::Anonymous => {}
        }

        let table = self.router.snapshot();
        self.dispatch(&table, ctx).await
    }

    /// Match `ctx` against `table` and run the matched route's chain. Also used
    /// for internal forwards, which stay on the caller's table snapshot.
    pub fn dispatch<'a>(
        &'a self,
        table: &'a Arc<RouteTable>,
        mut ctx: RequestContext,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let (route, vars) = table.match_request(&ctx)?;
            tracing::debug!(
                "{} {} matched route '{}' (table v{})",
                ctx.method,
                ctx.path(),
                route.id,
                table.version()
            );
            tracing::Span::current().record("route_id", route.id.as_str());
            ctx.path_vars = vars;
            ctx.route_id = Some(route.id.clone());
            Chain::new(self, table, &route).run(0, ctx).await
        })
    }

    /// Terminal step of every chain: answer inline or forward upstream.
    pub async fn forward(&self, route: &Route, ctx: RequestContext) -> Outcome {
        match &route.target {
            RouteTarget::Respond(respond) => Response::builder()
                .status(respond.status)
                .header(header::CONTENT_TYPE, respond.content_type.clone())
                .body(Body::from(respond.body.clone()))
                .map_err(|e| GatewayError::InvalidRequest(e.to_string())),
            RouteTarget::Uri(base) => self.send(base, ctx).await,
            RouteTarget::Service(service) => {
                let collaborators = self.collaborators.load_full();
                let instance = collaborators
                    .load_balancer
                    .select(collaborators.discovery.as_ref(), service)
                    .await?;
                self.send(&instance.address, ctx).await
            }
        }
    }

    async fn send(&self, base: &InstanceUrl, ctx: RequestContext) -> Outcome {
        if ctx.websocket {
            return self.connect_websocket(base, &ctx).await;
        }

        let settings = self.settings.load_full();
        let target = base.join(ctx.path_and_query());
        let uri: Uri = target
            .parse()
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid upstream URI '{target}': {e}")))?;

        let mut request = Request::new(Body::from(ctx.body.clone()));
        *request.method_mut() = ctx.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = forwarded_headers(&ctx);

        let response = self
            .http_client
            .send_request(request, settings.request_timeout)
            .await
            .map_err(|e| match e {
                HttpClientError::Timeout(timeout) => GatewayError::UpstreamTimeout {
                    target: target.clone(),
                    timeout,
                },
                HttpClientError::ConnectionError(reason) => GatewayError::UpstreamConnect {
                    target: target.clone(),
                    reason,
                },
                HttpClientError::InvalidRequest(reason) => GatewayError::InvalidRequest(reason),
            })?;

        increment_upstream_request(base.as_str(), response.status().as_u16());

        if is_event_stream(response.headers()) {
            let (parts, body) = response.into_parts();
            return Ok(Response::from_parts(
                parts,
                relay_sse_body(body, &settings.streaming),
            ));
        }
        Ok(response)
    }

    async fn connect_websocket(&self, base: &InstanceUrl, ctx: &RequestContext) -> Outcome {
        let settings = self.settings.load_full();
        let url = base.ws_url(ctx.path_and_query());
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid WebSocket URL '{url}': {e}")))?;
        for name in [header::AUTHORIZATION, HeaderName::from_static("x-request-id")] {
            if let Some(value) = ctx.headers.get(&name) {
                request.headers_mut().insert(name, value.clone());
            }
        }

        let socket = match timeout(
            settings.request_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(e)) => {
                tracing::warn!("WebSocket connect to {} failed: {}", url, e);
                return Err(GatewayError::UpstreamConnect {
                    target: url,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(GatewayError::UpstreamTimeout {
                    target: url,
                    timeout: settings.request_timeout,
                });
            }
        };

        increment_upstream_request(base.as_str(), StatusCode::SWITCHING_PROTOCOLS.as_u16());
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .extension(UpstreamSocket::new(socket))
            .body(Body::empty())
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))
    }

    pub async fn status(&self) -> GatewayStatus {
        let table = self.router.snapshot();
        let routes = table
            .routes()
            .iter()
            .map(|route| RouteSummary {
                id: route.id.clone(),
                path: route.path.as_str().to_string(),
                host: route.host.as_ref().map(|h| h.as_str().to_string()),
                priority: route.priority,
                target: route.target.describe(),
                filters: route.filters.iter().map(|f| f.kind()).collect(),
            })
            .collect();

        GatewayStatus {
            version: table.version(),
            routes,
            breakers: self.breakers.snapshot().await,
        }
    }
}

/// Copy end-to-end headers and add the `X-Forwarded-*` set.
fn forwarded_headers(ctx: &RequestContext) -> HeaderMap {
    let mut headers = ctx.headers.clone();
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    let original_host = headers.remove(header::HOST);

    if let Some(ip) = ctx.client_addr.map(|addr| addr.ip().to_string()) {
        let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert("x-forwarded-for", value);
        }
    }
    if let Some(host) = original_host {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers
            .entry("x-request-id")
            .or_insert(value);
    }
    headers
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Ok(response) if response.status().is_server_error() => "upstream_error",
        Ok(_) => "success",
        Err(e) => e.kind(),
    }
}
