//! Versioned route tables and the atomically swapped active pointer.
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{HeaderValue, StatusCode};

use crate::{
    config::models::{GatewayConfig, RouteConfig},
    core::{
        circuit_breaker::BreakerRegistry,
        context::RequestContext,
        filter_chain::Filter,
        route::{HostPattern, PathPattern, PathVars, Route, RouteError, RouteTarget, StaticResponse},
    },
    error::GatewayError,
};

/// Immutable, ordered set of routes published as one unit.
#[derive(Debug, Default)]
pub struct RouteTable {
    version: u64,
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Compile every route. Routes are ordered by priority (lower first,
    /// missing = 0); equal priorities keep declaration order.
    pub async fn build(
        config: &GatewayConfig,
        version: u64,
        breakers: &BreakerRegistry,
    ) -> Result<Self, RouteError> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            routes.push(Arc::new(Self::compile(route, breakers).await?));
        }
        // Vec::sort_by_key is stable.
        routes.sort_by_key(|route| route.priority);

        Ok(Self { version, routes })
    }

    async fn compile(config: &RouteConfig, breakers: &BreakerRegistry) -> Result<Route, RouteError> {
        let path = PathPattern::parse(&config.path)?;
        let host = config.host.as_deref().map(HostPattern::parse).transpose()?;

        let target = match (&config.uri, &config.respond) {
            (Some(uri), None) => RouteTarget::parse_uri(uri)?,
            (None, Some(respond)) => {
                let invalid = |reason: String| RouteError::InvalidTarget {
                    target: format!("route '{}' respond", config.id),
                    reason,
                };
                RouteTarget::Respond(StaticResponse {
                    status: StatusCode::from_u16(respond.status)
                        .map_err(|e| invalid(e.to_string()))?,
                    content_type: HeaderValue::from_str(&respond.content_type)
                        .map_err(|e| invalid(e.to_string()))?,
                    body: Bytes::from(respond.body.clone()),
                })
            }
            _ => {
                return Err(RouteError::InvalidTarget {
                    target: config.id.clone(),
                    reason: "exactly one of 'uri' or 'respond' must be set".to_string(),
                });
            }
        };

        let mut filters = Vec::with_capacity(config.filters.len());
        for filter in &config.filters {
            filters.push(Filter::build(&config.id, &target, filter, breakers).await?);
        }

        Ok(Route {
            id: config.id.clone(),
            path,
            host,
            priority: config.priority.unwrap_or(0),
            target,
            filters,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First route whose predicate accepts the request.
    pub fn find(&self, host: Option<&str>, path: &str) -> Option<(Arc<Route>, PathVars)> {
        self.routes
            .iter()
            .find_map(|route| route.matches(host, path).map(|vars| (route.clone(), vars)))
    }

    /// Match a request; no match is a `RoutingFailure`, never a default route.
    pub fn match_request(&self, ctx: &RequestContext) -> Result<(Arc<Route>, PathVars), GatewayError> {
        self.find(ctx.host(), ctx.path())
            .ok_or_else(|| GatewayError::RoutingFailure {
                method: ctx.method.to_string(),
                path: ctx.path().to_string(),
            })
    }
}

/// Holder of the active route table. Readers take a snapshot and keep using
/// it for the whole request, however many tables are published meanwhile.
#[derive(Debug)]
pub struct Router {
    active: ArcSwap<RouteTable>,
}

impl Router {
    pub fn new(table: RouteTable) -> Self {
        Self {
            active: ArcSwap::from_pointee(table),
        }
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.active.load_full()
    }

    /// Swap in a new table; returns the one it replaced.
    pub fn publish(&self, table: RouteTable) -> Arc<RouteTable> {
        let version = table.version();
        let previous = self.active.swap(Arc::new(table));
        tracing::info!(
            "Published route table v{} ({} routes), replacing v{}",
            version,
            self.active.load().len(),
            previous.version()
        );
        previous
    }

    pub fn version(&self) -> u64 {
        self.active.load().version()
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;
    use crate::config::models::StaticResponseConfig;

    fn config(routes: Vec<RouteConfig>) -> GatewayConfig {
        GatewayConfig {
            routes,
            ..GatewayConfig::default()
        }
    }

    fn respond(body: &str) -> StaticResponseConfig {
        StaticResponseConfig {
            status: 200,
            content_type: "text/plain".to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_declaration_order_decides_ties() {
        let table = RouteTable::build(
            &config(vec![
                RouteConfig::new("specific", "/error/{id}", "http://127.0.0.1:1"),
                RouteConfig::new("catch-all", "/**", "http://127.0.0.1:2"),
            ]),
            1,
            &BreakerRegistry::new(),
        )
        .await
        .unwrap();

        let (route, vars) = table.find(None, "/error/alice").unwrap();
        assert_eq!(route.id, "specific");
        assert_eq!(vars.get("id").map(String::as_str), Some("alice"));
        assert_eq!(table.find(None, "/hello").unwrap().0.id, "catch-all");
    }

    #[tokio::test]
    async fn test_explicit_priority_wins() {
        let table = RouteTable::build(
            &config(vec![
                RouteConfig::new("catch-all", "/**", "http://127.0.0.1:2").with_priority(10),
                RouteConfig::new("hello", "/hello", "http://127.0.0.1:1"),
            ]),
            1,
            &BreakerRegistry::new(),
        )
        .await
        .unwrap();
        assert_eq!(table.find(None, "/hello").unwrap().0.id, "hello");
        assert_eq!(table.find(None, "/other").unwrap().0.id, "catch-all");
    }

    #[tokio::test]
    async fn test_host_predicate() {
        let table = RouteTable::build(
            &config(vec![
                RouteConfig::new("api", "/**", "http://127.0.0.1:1").with_host("api.example.org"),
                RouteConfig::new("www", "/**", "http://127.0.0.1:2").with_host("*.example.org"),
            ]),
            1,
            &BreakerRegistry::new(),
        )
        .await
        .unwrap();
        assert_eq!(table.find(Some("api.example.org"), "/x").unwrap().0.id, "api");
        assert_eq!(table.find(Some("www.example.org:8080"), "/x").unwrap().0.id, "www");
        assert!(table.find(Some("example.com"), "/x").is_none());
        assert!(table.find(None, "/x").is_none());
    }

    #[tokio::test]
    async fn test_no_match_is_routing_failure() {
        let table = RouteTable::build(
            &config(vec![RouteConfig::responding("hello", "/hello", respond("hi"))]),
            1,
            &BreakerRegistry::new(),
        )
        .await
        .unwrap();
        let ctx = RequestContext::new(Method::GET, "/missing".parse().unwrap());
        let err = table.match_request(&ctx).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_route_is_rejected() {
        let mut route = RouteConfig::new("bad", "/x", "http://127.0.0.1:1");
        route.respond = Some(respond("both"));
        let result = RouteTable::build(&config(vec![route]), 1, &BreakerRegistry::new()).await;
        assert!(matches!(result, Err(RouteError::InvalidTarget { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_survives_publish() {
        let breakers = BreakerRegistry::new();
        let old = RouteTable::build(
            &config(vec![RouteConfig::responding("old", "/x", respond("old"))]),
            1,
            &breakers,
        )
        .await
        .unwrap();
        let router = Router::new(old);

        let in_flight = router.snapshot();
        let new = RouteTable::build(
            &config(vec![RouteConfig::responding("new", "/y", respond("new"))]),
            2,
            &breakers,
        )
        .await
        .unwrap();
        let previous = router.publish(new);

        assert_eq!(previous.version(), 1);
        assert_eq!(router.version(), 2);
        // The request that matched before the swap still completes against v1.
        assert_eq!(in_flight.find(None, "/x").unwrap().0.id, "old");
        assert!(in_flight.find(None, "/y").is_none());
        assert!(router.snapshot().find(None, "/x").is_none());
    }
}
