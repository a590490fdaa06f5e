//! Route filters and the interpreter that runs them.
//!
//! A route's filters form an ordered list executed front to back. Each filter
//! either short-circuits with an outcome or hands the (possibly transformed)
//! context to the rest of the chain; past the last filter the request is
//! forwarded. Wrapping filters (retry, circuit breaker) run the remainder of
//! the chain as their protected call, so declared order decides what they see.
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{HeaderName, HeaderValue, StatusCode};
use regex::Regex;

use crate::{
    config::models::FilterConfig,
    core::{
        circuit_breaker::{BreakerRegistry, BreakerSettings, CircuitBreaker},
        context::{MAX_FORWARD_DEPTH, RequestContext},
        gateway::GatewayService,
        rate_limiter::RateLimitFilter,
        retry::RetryPolicy,
        route::{Route, RouteError, RouteTarget},
        router::RouteTable,
    },
    error::{GatewayError, Outcome},
};

/// Circuit breaker binding on one route.
#[derive(Debug)]
pub struct BreakerFilter {
    pub breaker: Arc<CircuitBreaker>,
    pub failure_statuses: Vec<StatusCode>,
    /// Path re-dispatched while the breaker is open.
    pub fallback: Option<String>,
}

impl BreakerFilter {
    /// Failures are upstream failures and configured failure statuses.
    fn is_failure(&self, outcome: &Outcome) -> bool {
        match outcome {
            Ok(response) => self.failure_statuses.contains(&response.status()),
            Err(e) => e.is_upstream_failure(),
        }
    }
}

#[derive(Debug)]
pub enum Filter {
    AuthRequired,
    RateLimit(Arc<RateLimitFilter>),
    Retry(RetryPolicy),
    CircuitBreaker(BreakerFilter),
    Rewrite { regex: Regex, replacement: String },
    SetPath { template: String },
    AddRequestHeader { name: HeaderName, value: HeaderValue },
}

impl Filter {
    /// Compile one filter definition. Breakers are looked up in (or added
    /// to) `breakers`, so they outlive the route table being built.
    pub async fn build(
        route_id: &str,
        target: &RouteTarget,
        config: &FilterConfig,
        breakers: &BreakerRegistry,
    ) -> Result<Self, RouteError> {
        let invalid = |reason: String| RouteError::InvalidFilter {
            route: route_id.to_string(),
            reason,
        };

        let filter = match config {
            FilterConfig::AuthRequired => Filter::AuthRequired,
            FilterConfig::RateLimit(cfg) => {
                Filter::RateLimit(Arc::new(RateLimitFilter::new(route_id, cfg).map_err(invalid)?))
            }
            FilterConfig::Retry(cfg) => Filter::Retry(RetryPolicy::from_config(cfg).map_err(invalid)?),
            FilterConfig::CircuitBreaker(cfg) => {
                let settings = BreakerSettings::from_config(cfg).map_err(invalid)?;
                let failure_statuses = cfg
                    .failure_statuses
                    .iter()
                    .map(|code| {
                        StatusCode::from_u16(*code)
                            .map_err(|_| invalid(format!("Invalid failure status {code}")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let name = cfg.name.clone().unwrap_or_else(|| target.describe());
                let fallback = cfg.fallback.as_deref().map(|f| {
                    f.strip_prefix("forward:").unwrap_or(f).to_string()
                });
                Filter::CircuitBreaker(BreakerFilter {
                    breaker: breakers.get_or_create(&name, settings).await,
                    failure_statuses,
                    fallback,
                })
            }
            FilterConfig::Rewrite {
                pattern,
                replacement,
            } => Filter::Rewrite {
                regex: Regex::new(pattern).map_err(|e| invalid(format!("Invalid rewrite pattern: {e}")))?,
                replacement: replacement.clone(),
            },
            FilterConfig::SetPath { template } => Filter::SetPath {
                template: template.clone(),
            },
            FilterConfig::AddRequestHeader { name, value } => Filter::AddRequestHeader {
                name: HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| invalid(format!("Invalid header name '{name}': {e}")))?,
                value: HeaderValue::from_str(value)
                    .map_err(|e| invalid(format!("Invalid header value for '{name}': {e}")))?,
            },
        };
        Ok(filter)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Filter::AuthRequired => "auth_required",
            Filter::RateLimit(_) => "rate_limit",
            Filter::Retry(_) => "retry",
            Filter::CircuitBreaker(_) => "circuit_breaker",
            Filter::Rewrite { .. } => "rewrite",
            Filter::SetPath { .. } => "set_path",
            Filter::AddRequestHeader { .. } => "add_request_header",
        }
    }
}

/// Substitute `{name}` placeholders with captured path variables.
fn expand_template(template: &str, ctx: &RequestContext) -> String {
    ctx.path_vars
        .iter()
        .fold(template.to_string(), |path, (name, value)| {
            path.replace(&format!("{{{name}}}"), value)
        })
}

/// Interpreter state for one matched request: the route, the table snapshot it
/// matched against, and the gateway that forwards at the end of the chain.
#[derive(Clone, Copy)]
pub struct Chain<'a> {
    gateway: &'a GatewayService,
    table: &'a Arc<RouteTable>,
    route: &'a Route,
}

impl<'a> Chain<'a> {
    pub fn new(gateway: &'a GatewayService, table: &'a Arc<RouteTable>, route: &'a Route) -> Self {
        Self {
            gateway,
            table,
            route,
        }
    }

    /// Run the filters from `index` onward.
    pub fn run(self, index: usize, mut ctx: RequestContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let Some(filter) = self.route.filters.get(index) else {
                return self.gateway.forward(self.route, ctx).await;
            };

            match filter {
                Filter::AuthRequired => {
                    if ctx.principal.is_none() {
                        return Err(GatewayError::Unauthorized);
                    }
                    self.run(index + 1, ctx).await
                }
                Filter::RateLimit(limiter) => {
                    limiter.check(&ctx).await?;
                    self.run(index + 1, ctx).await
                }
                Filter::Retry(policy) => {
                    let method = ctx.method.clone();
                    policy
                        .execute(
                            &self.route.id,
                            &method,
                            || self.breaker_open(),
                            |_| self.run(index + 1, ctx.clone()),
                        )
                        .await
                }
                Filter::CircuitBreaker(binding) => self.guard(binding, index, ctx).await,
                Filter::Rewrite { regex, replacement } => {
                    let rewritten = regex.replace(ctx.path(), replacement.as_str()).into_owned();
                    ctx.set_path(&rewritten)
                        .map_err(|e| GatewayError::InvalidRequest(format!("rewrite produced '{rewritten}': {e}")))?;
                    self.run(index + 1, ctx).await
                }
                Filter::SetPath { template } => {
                    let path = expand_template(template, &ctx);
                    ctx.set_path(&path)
                        .map_err(|e| GatewayError::InvalidRequest(format!("set_path produced '{path}': {e}")))?;
                    self.run(index + 1, ctx).await
                }
                Filter::AddRequestHeader { name, value } => {
                    ctx.headers.append(name.clone(), value.clone());
                    self.run(index + 1, ctx).await
                }
            }
        })
    }

    /// Whether any breaker on this route is currently open.
    fn breaker_open(&self) -> bool {
        self.route.filters.iter().any(|filter| match filter {
            Filter::CircuitBreaker(binding) => binding.breaker.is_open(),
            _ => false,
        })
    }

    async fn guard(self, binding: &BreakerFilter, index: usize, ctx: RequestContext) -> Outcome {
        let Some(permit) = binding.breaker.try_acquire() else {
            return self.short_circuit(binding, ctx).await;
        };

        let outcome = self.run(index + 1, ctx).await;
        if binding.is_failure(&outcome) {
            permit.record_failure();
        } else if outcome.is_ok() {
            permit.record_success();
        } else {
            // Rejections and other gateway-side errors say nothing about the upstream.
            permit.release();
        }
        outcome
    }

    async fn short_circuit(self, binding: &BreakerFilter, mut ctx: RequestContext) -> Outcome {
        let Some(fallback) = &binding.fallback else {
            return Err(GatewayError::BreakerOpen(binding.breaker.name().to_string()));
        };

        if ctx.forward_depth >= MAX_FORWARD_DEPTH {
            return Err(GatewayError::ForwardLoop(fallback.clone()));
        }

        tracing::debug!(
            "Circuit breaker '{}' is open, forwarding route '{}' to {}",
            binding.breaker.name(),
            self.route.id,
            fallback
        );
        ctx.forward_depth += 1;
        ctx.set_path(fallback)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid fallback '{fallback}': {e}")))?;
        self.gateway.dispatch(self.table, ctx).await
    }
}
