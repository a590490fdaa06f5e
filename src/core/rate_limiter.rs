//! Per-key admission control for the `rate_limit` filter.
//!
//! The default algorithm is an exact token bucket: each resolved key owns a
//! [`Bucket`] stored in an `scc::HashMap`, and the entry lock held during
//! refill-and-take makes every update atomic per key. The `gcra` algorithm
//! delegates to `governor`'s keyed limiter with an equivalent quota (burst =
//! capacity, one token every `1 / refill_rate` seconds).
use std::{num::NonZeroU32, time::Duration};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
};
use http::{HeaderName, StatusCode};
use tokio::time::Instant;

use crate::{
    config::models::{RateLimitAlgorithm, RateLimitBy, RateLimitConfig},
    core::context::RequestContext,
    error::GatewayError,
    metrics::increment_rate_limited,
};

pub type KeyedRateLimiterImpl<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

/// Token state for one key.
#[derive(Debug, Clone)]
pub struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Buckets start full.
    pub fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Refill for the time elapsed since the last refill (capped at
    /// `capacity`), then take one token if available. A `now` earlier than the
    /// last refill adds nothing.
    pub fn try_take(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Exact floating-point token bucket per key.
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_rate: f64,
    buckets: scc::HashMap<String, Bucket>,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_rate,
            buckets: scc::HashMap::new(),
        }
    }

    pub async fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now()).await
    }

    /// Buckets are created lazily on first use and never removed.
    pub async fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let mut entry = self
            .buckets
            .entry_async(key.to_string())
            .await
            .or_insert_with(|| Bucket::full(self.capacity, now));
        entry
            .get_mut()
            .try_take(self.capacity, self.refill_rate, now)
    }

    pub async fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets
            .read_async(key, |_, bucket| bucket.tokens())
            .await
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

enum Limiter {
    TokenBucket(TokenBucketLimiter),
    Gcra(KeyedRateLimiterImpl<String>),
}

/// Derives the bucket key for a request.
#[derive(Debug, Clone)]
pub enum KeyResolver {
    /// Authenticated principal name, `default_key` when anonymous.
    Principal { default_key: String },
    /// Client IP (first `X-Forwarded-For` hop, else the socket address).
    Ip { default_key: String },
    Header {
        name: HeaderName,
        default_key: String,
    },
    /// One bucket for every request on the route.
    Route { route_id: String },
}

impl KeyResolver {
    pub fn from_config(route_id: &str, config: &RateLimitConfig) -> Result<Self, String> {
        let default_key = config.default_key.clone();
        Ok(match config.by {
            RateLimitBy::Principal => KeyResolver::Principal { default_key },
            RateLimitBy::Ip => KeyResolver::Ip { default_key },
            RateLimitBy::Header => {
                let header_name = config
                    .header_name
                    .as_ref()
                    .ok_or_else(|| "header_name is required when by = \"header\"".to_string())?;
                let name = HeaderName::from_bytes(header_name.as_bytes())
                    .map_err(|e| format!("Invalid header_name '{header_name}': {e}"))?;
                KeyResolver::Header { name, default_key }
            }
            RateLimitBy::Route => KeyResolver::Route {
                route_id: route_id.to_string(),
            },
        })
    }

    pub fn resolve(&self, ctx: &RequestContext) -> String {
        match self {
            KeyResolver::Principal { default_key } => ctx
                .principal
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| default_key.clone()),
            KeyResolver::Ip { default_key } => {
                ctx.client_ip().unwrap_or_else(|| default_key.clone())
            }
            KeyResolver::Header { name, default_key } => ctx
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| default_key.clone()),
            KeyResolver::Route { route_id } => route_id.clone(),
        }
    }
}

/// A `rate_limit` filter instance. Buckets belong to the instance, so two
/// filters never share a key space.
pub struct RateLimitFilter {
    route_id: String,
    resolver: KeyResolver,
    limiter: Limiter,
    status: StatusCode,
    message: String,
}

impl std::fmt::Debug for RateLimitFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitFilter")
            .field("route_id", &self.route_id)
            .field("resolver", &self.resolver)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl RateLimitFilter {
    pub fn new(route_id: &str, config: &RateLimitConfig) -> Result<Self, String> {
        let capacity = NonZeroU32::new(config.capacity)
            .ok_or_else(|| "Rate limit capacity must be greater than 0".to_string())?;

        if !(config.refill_rate.is_finite() && config.refill_rate > 0.0) {
            return Err(format!(
                "Refill rate must be a positive number, got {}",
                config.refill_rate
            ));
        }

        let status = StatusCode::from_u16(config.status_code)
            .map_err(|_| format!("Invalid status code: {}", config.status_code))?;

        let limiter = match config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                Limiter::TokenBucket(TokenBucketLimiter::new(config.capacity, config.refill_rate))
            }
            RateLimitAlgorithm::Gcra => {
                let period = Duration::try_from_secs_f64(1.0 / config.refill_rate)
                    .map_err(|e| format!("Refill rate {} is out of range: {e}", config.refill_rate))?;
                let quota = Quota::with_period(period)
                    .ok_or_else(|| format!("Invalid replenish period {period:?}"))?
                    .allow_burst(capacity);
                Limiter::Gcra(RateLimiter::keyed(quota))
            }
        };

        tracing::info!(
            "Creating rate limiter for route '{}': by={:?}, algorithm={:?}, capacity={}, refill_rate={}/s",
            route_id,
            config.by,
            config.algorithm,
            config.capacity,
            config.refill_rate
        );

        Ok(Self {
            route_id: route_id.to_string(),
            resolver: KeyResolver::from_config(route_id, config)?,
            limiter,
            status,
            message: config.message.clone(),
        })
    }

    /// Admit the request or reject it with `AdmissionRejected`.
    pub async fn check(&self, ctx: &RequestContext) -> Result<(), GatewayError> {
        let key = self.resolver.resolve(ctx);

        let admitted = match &self.limiter {
            Limiter::TokenBucket(buckets) => buckets.try_acquire(&key).await,
            Limiter::Gcra(limiter) => limiter.check_key(&key).is_ok(),
        };

        if admitted {
            return Ok(());
        }

        tracing::debug!("Rate limit exceeded on route '{}' for key '{}'", self.route_id, key);
        increment_rate_limited(&self.route_id);
        Err(GatewayError::AdmissionRejected {
            key,
            status: self.status,
            message: self.message.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{HeaderMap, Method};

    use super::*;
    use crate::{config::models::RateLimitConfig, ports::authenticator::Principal};

    fn ctx_for(principal: Option<&str>) -> RequestContext {
        let mut ctx = RequestContext::new(Method::GET, "/hello".parse().unwrap());
        ctx.principal = principal.map(|name| Principal {
            name: name.to_string(),
        });
        ctx
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = Bucket::full(5.0, start);

        assert!(bucket.try_take(5.0, 1.0, start + Duration::from_secs(3600)));
        assert!(bucket.tokens() <= 5.0);
        assert!((bucket.tokens() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_never_negative() {
        let start = Instant::now();
        let mut bucket = Bucket::full(2.0, start);
        for _ in 0..2 {
            assert!(bucket.try_take(2.0, 1.0, start));
        }
        for _ in 0..10 {
            assert!(!bucket.try_take(2.0, 1.0, start));
            assert!(bucket.tokens() >= 0.0);
        }
    }

    #[test]
    fn test_bucket_ignores_stale_timestamps() {
        let start = Instant::now();
        let later = start + Duration::from_secs(1);
        let mut bucket = Bucket::full(1.0, later);
        assert!(bucket.try_take(1.0, 1.0, later));
        assert!(!bucket.try_take(1.0, 1.0, start));
        assert!(bucket.tokens() >= 0.0);
    }

    #[tokio::test]
    async fn test_burst_then_refill() {
        let limiter = TokenBucketLimiter::new(5, 1.0);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.try_acquire_at("jlong", start).await);
        }
        assert!(!limiter.try_acquire_at("jlong", start).await);
        assert!(
            !limiter
                .try_acquire_at("jlong", start + Duration::from_millis(999))
                .await
        );
        assert!(
            limiter
                .try_acquire_at("jlong", start + Duration::from_millis(1100))
                .await
        );
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = TokenBucketLimiter::new(1, 0.5);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("a", now).await);
        assert!(!limiter.try_acquire_at("a", now).await);
        assert!(limiter.try_acquire_at("b", now).await);
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_bounded_by_capacity() {
        let limiter = Arc::new(TokenBucketLimiter::new(10, 0.001));
        let now = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire_at("shared", now).await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert!(limiter.tokens("shared").await.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_filter_rejects_with_configured_status() {
        let mut config = RateLimitConfig::per_principal(1, 0.001);
        config.status_code = 503;
        config.message = "slow down".to_string();
        let filter = RateLimitFilter::new("limited", &config).unwrap();

        let ctx = ctx_for(Some("jlong"));
        assert!(filter.check(&ctx).await.is_ok());
        match filter.check(&ctx).await {
            Err(GatewayError::AdmissionRejected {
                key,
                status,
                message,
            }) => {
                assert_eq!(key, "jlong");
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(message, "slow down");
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        // Other principals have their own bucket.
        assert!(filter.check(&ctx_for(Some("other"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_anonymous_requests_share_default_key() {
        let filter =
            RateLimitFilter::new("limited", &RateLimitConfig::per_principal(1, 0.001)).unwrap();
        assert!(filter.check(&ctx_for(None)).await.is_ok());
        match filter.check(&ctx_for(None)).await {
            Err(GatewayError::AdmissionRejected { key, .. }) => assert_eq!(key, "anonymous"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gcra_algorithm() {
        let mut config = RateLimitConfig::per_principal(2, 0.01);
        config.algorithm = RateLimitAlgorithm::Gcra;
        let filter = RateLimitFilter::new("gcra", &config).unwrap();
        let ctx = ctx_for(Some("jlong"));

        assert!(filter.check(&ctx).await.is_ok());
        assert!(filter.check(&ctx).await.is_ok());
        assert!(filter.check(&ctx).await.is_err());
    }

    #[test]
    fn test_header_resolver() {
        let mut config = RateLimitConfig::per_principal(1, 1.0);
        config.by = RateLimitBy::Header;
        assert!(KeyResolver::from_config("r", &config).is_err());

        config.header_name = Some("x-api-key".to_string());
        let resolver = KeyResolver::from_config("r", &config).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "k1".parse().unwrap());
        let ctx = RequestContext::new(Method::GET, "/".parse().unwrap()).with_headers(headers);
        assert_eq!(resolver.resolve(&ctx), "k1");
        assert_eq!(resolver.resolve(&ctx_for(None)), "anonymous");
    }

    #[test]
    fn test_invalid_configs() {
        assert!(RateLimitFilter::new("r", &RateLimitConfig::per_principal(0, 1.0)).is_err());
        assert!(RateLimitFilter::new("r", &RateLimitConfig::per_principal(1, 0.0)).is_err());
        assert!(RateLimitFilter::new("r", &RateLimitConfig::per_principal(1, f64::NAN)).is_err());
    }
}
