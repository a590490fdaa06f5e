//! Configuration data structures for Rampart.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! Routes are an ordered array: declaration order is the match order unless a route
//! sets an explicit `priority`.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Top level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Static discovery table: logical service name -> instances.
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    /// Basic-auth user store.
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9999".to_string(),
            routes: Vec::new(),
            services: HashMap::new(),
            users: Vec::new(),
            health_check: HealthCheckConfig::default(),
            upstream: UpstreamConfig::default(),
            streaming: StreamingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Builder for GatewayConfig, mostly used by tests and embedders.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    listen_addr: Option<String>,
    routes: Vec<RouteConfig>,
    services: HashMap<String, ServiceConfig>,
    users: Vec<UserConfig>,
    health_check: Option<HealthCheckConfig>,
    upstream: Option<UpstreamConfig>,
    streaming: Option<StreamingConfig>,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Append a route; routes keep the order they are added in.
    pub fn route(mut self, route: RouteConfig) -> Self {
        self.routes.push(route);
        self
    }

    /// Register a logical service with its instance base URLs.
    pub fn service<I, S>(mut self, name: impl Into<String>, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.insert(
            name.into(),
            ServiceConfig {
                instances: instances.into_iter().map(Into::into).collect(),
                health_path: None,
                load_balance: LoadBalanceStrategy::default(),
            },
        );
        self
    }

    /// Add a basic-auth user.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.push(UserConfig {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    pub fn upstream(mut self, config: UpstreamConfig) -> Self {
        self.upstream = Some(config);
        self
    }

    pub fn streaming(mut self, config: StreamingConfig) -> Self {
        self.streaming = Some(config);
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| "listen_addr is required".to_string())?;

        if self.routes.is_empty() {
            return Err("At least one route must be configured".to_string());
        }

        Ok(GatewayConfig {
            listen_addr,
            routes: self.routes,
            services: self.services,
            users: self.users,
            health_check: self.health_check.unwrap_or_default(),
            upstream: self.upstream.unwrap_or_default(),
            streaming: self.streaming.unwrap_or_default(),
            logging: LoggingConfig::default(),
        })
    }
}

/// A single route definition.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub id: String,
    /// Path pattern: `**` spans segments, `*` stays within one, `{name}` captures one.
    pub path: String,
    /// Optional host glob, e.g. `*.example.org`.
    #[serde(default)]
    pub host: Option<String>,
    /// Lower values are matched first. A missing priority counts as 0 and ties keep
    /// declaration order.
    #[serde(default)]
    pub priority: Option<i32>,
    /// `lb://<service>` for a discovered service or an `http(s)://` base URI.
    #[serde(default)]
    pub uri: Option<String>,
    /// Answer directly from the gateway instead of forwarding.
    #[serde(default)]
    pub respond: Option<StaticResponseConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

impl RouteConfig {
    /// Route forwarding to `uri` with no filters.
    pub fn new(id: impl Into<String>, path: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            host: None,
            priority: None,
            uri: Some(uri.into()),
            respond: None,
            filters: Vec::new(),
        }
    }

    /// Route answered by the gateway itself.
    pub fn responding(
        id: impl Into<String>,
        path: impl Into<String>,
        respond: StaticResponseConfig,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            host: None,
            priority: None,
            uri: None,
            respond: Some(respond),
            filters: Vec::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filters.push(filter);
        self
    }
}

fn default_response_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

/// Inline response served by the gateway.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StaticResponseConfig {
    #[serde(default = "default_response_status")]
    pub status: u16,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub body: String,
}

/// Ordered filter definitions attached to a route.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum FilterConfig {
    AuthRequired,
    RateLimit(RateLimitConfig),
    Retry(RetryConfig),
    CircuitBreaker(CircuitBreakerConfig),
    /// Regex rewrite of the request path; `${name}` refers to named groups.
    Rewrite {
        pattern: String,
        replacement: String,
    },
    /// Replace the path with a template using `{name}` variables captured by the route path.
    SetPath {
        template: String,
    },
    AddRequestHeader {
        name: String,
        value: String,
    },
}

fn default_status_code() -> u16 {
    429
}

fn default_message() -> String {
    "Too Many Requests".to_string()
}

fn default_rate_limit_key() -> String {
    "anonymous".to_string()
}

/// How the rate limiter derives a bucket key from a request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBy {
    /// Authenticated principal name, `default_key` when anonymous.
    #[default]
    Principal,
    Ip,
    Header,
    /// One bucket shared by every request on the route.
    Route,
}

/// Algorithm used to enforce the quota semantics.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    Gcra,
}

/// Token bucket configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub by: RateLimitBy,
    #[serde(default)]
    pub header_name: Option<String>, // Should be Some if by == Header
    #[serde(default = "default_rate_limit_key")]
    pub default_key: String,
    /// Bucket capacity (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default = "default_message")]
    pub message: String,
}

impl RateLimitConfig {
    pub fn per_principal(capacity: u32, refill_rate: f64) -> Self {
        Self {
            by: RateLimitBy::Principal,
            header_name: None,
            default_key: default_rate_limit_key(),
            capacity,
            refill_rate,
            algorithm: RateLimitAlgorithm::TokenBucket,
            status_code: default_status_code(),
            message: default_message(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_retry_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

/// Bounded-attempt retry configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total tries, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_statuses")]
    pub statuses: Vec<u16>,
    #[serde(default = "default_retry_methods")]
    pub methods: Vec<String>,
    /// No delay between attempts when absent.
    #[serde(default)]
    pub backoff: Option<BackoffConfig>,
}

impl RetryConfig {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            statuses: default_retry_statuses(),
            methods: default_retry_methods(),
            backoff: None,
        }
    }
}

fn default_first_backoff() -> String {
    "50ms".to_string()
}

fn default_max_backoff() -> String {
    "500ms".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_first_backoff")]
    pub first_backoff: String,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration() -> String {
    "10s".to_string()
}

fn default_failure_statuses() -> Vec<u16> {
    vec![500, 502, 503, 504]
}

/// Circuit breaker configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CircuitBreakerConfig {
    /// Breaker identity; defaults to the route target so routes sharing an
    /// upstream share one breaker.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration")]
    pub open_duration: String,
    #[serde(default = "default_failure_statuses")]
    pub failure_statuses: Vec<u16>,
    /// Path (optionally `forward:`-prefixed) re-dispatched while the breaker is open.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl CircuitBreakerConfig {
    pub fn with_fallback(fallback: impl Into<String>) -> Self {
        Self {
            name: None,
            failure_threshold: default_failure_threshold(),
            open_duration: default_open_duration(),
            failure_statuses: default_failure_statuses(),
            fallback: Some(fallback.into()),
        }
    }
}

/// How an instance is picked among the healthy ones.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// One logical upstream service in the static discovery table.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub instances: Vec<String>,
    /// Health probe path overriding `health_check.path`.
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 2,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Settings for calls made to upstream instances.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Time allowed until response headers arrive (humantime).
    pub request_timeout: String,
    /// Largest request body buffered for forwarding and replay.
    pub max_body_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: "30s".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// What the streaming relay does when the client reads slower than the upstream writes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Pull based: the upstream is read only as fast as the client consumes.
    #[default]
    Block,
    /// Bounded queue; the oldest queued event is discarded when full.
    DropOldest,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StreamingConfig {
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Largest single SSE event relayed; a longer event ends the stream.
    pub max_event_bytes: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            overflow: OverflowPolicy::Block,
            max_event_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}
