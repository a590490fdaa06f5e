use std::{future::Future, time::Duration};

use http::{Method, StatusCode};
use rand::Rng;

use crate::{
    config::models::{BackoffConfig, RetryConfig},
    error::Outcome,
    metrics::increment_retry_attempt,
};

/// Exponential backoff between attempts, optionally jittered.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Backoff {
    pub fn from_config(config: &BackoffConfig) -> Result<Self, String> {
        let first = humantime::parse_duration(&config.first_backoff)
            .map_err(|e| format!("Invalid first_backoff '{}': {e}", config.first_backoff))?;
        let max = humantime::parse_duration(&config.max_backoff)
            .map_err(|e| format!("Invalid max_backoff '{}': {e}", config.max_backoff))?;
        if !(config.factor.is_finite() && config.factor >= 1.0) {
            return Err(format!("Backoff factor must be >= 1, got {}", config.factor));
        }
        Ok(Self {
            first,
            max: max.max(first),
            factor: config.factor,
            jitter: config.jitter,
        })
    }

    /// Delay before retry number `retry` (1 = the first retry). With jitter the
    /// delay is drawn uniformly from `[delay / 2, delay]`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let nominal = self.first.as_secs_f64() * self.factor.powi(exponent);
        let capped = nominal.min(self.max.as_secs_f64());
        let seconds = if self.jitter && capped > 0.0 {
            rand::rng().random_range(capped / 2.0..=capped)
        } else {
            capped
        };
        Duration::from_secs_f64(seconds)
    }
}

/// Bounded-attempt retry for one `retry` filter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    statuses: Vec<StatusCode>,
    methods: Vec<Method>,
    backoff: Option<Backoff>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Result<Self, String> {
        if config.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        let statuses = config
            .statuses
            .iter()
            .map(|code| StatusCode::from_u16(*code).map_err(|_| format!("Invalid status {code}")))
            .collect::<Result<Vec<_>, _>>()?;
        let methods = config
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| format!("Invalid method '{m}'"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let backoff = config.backoff.as_ref().map(Backoff::from_config).transpose()?;

        Ok(Self {
            max_attempts: config.max_attempts,
            statuses,
            methods,
            backoff,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn applies_to(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// A retryable status, or an upstream failure (connect error, timeout,
    /// no healthy instance).
    pub fn is_retryable(&self, outcome: &Outcome) -> bool {
        match outcome {
            Ok(response) => self.statuses.contains(&response.status()),
            Err(e) => e.is_upstream_failure(),
        }
    }

    /// Run `attempt` until it yields a non-retryable outcome, attempts run out
    /// or `breaker_open` reports an open breaker. The last outcome is returned
    /// unchanged.
    pub async fn execute<F, Fut, B>(
        &self,
        route_id: &str,
        method: &Method,
        breaker_open: B,
        mut attempt: F,
    ) -> Outcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Outcome>,
        B: Fn() -> bool,
    {
        let budget = if self.applies_to(method) {
            self.max_attempts
        } else {
            1
        };

        let mut attempt_number = 1;
        loop {
            let outcome = attempt(attempt_number).await;

            if attempt_number >= budget || !self.is_retryable(&outcome) {
                return outcome;
            }
            if breaker_open() {
                tracing::debug!(
                    "Not retrying route '{}' after attempt {}: circuit breaker is open",
                    route_id,
                    attempt_number
                );
                return outcome;
            }

            tracing::debug!(
                "Retrying route '{}' ({}/{}) after {}",
                route_id,
                attempt_number + 1,
                budget,
                match &outcome {
                    Ok(response) => response.status().to_string(),
                    Err(e) => e.to_string(),
                }
            );
            drop(outcome);
            increment_retry_attempt(route_id);

            if let Some(backoff) = &self.backoff {
                tokio::time::sleep(backoff.delay(attempt_number)).await;
            }
            attempt_number += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use axum::body::Body;
    use http::Response;

    use super::*;
    use crate::error::GatewayError;

    fn status(code: u16) -> Outcome {
        Ok(Response::builder()
            .status(code)
            .body(Body::empty())
            .unwrap())
    }

    /// Fails the first `failures` calls with 503.
    async fn run(policy: &RetryPolicy, method: Method, failures: u32) -> (Outcome, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = policy
            .execute("test", &method, || false, move |_| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= failures { status(503) } else { status(200) }
                }
            })
            .await;
        (outcome, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_succeeds_on_last_attempt() {
        let policy = RetryPolicy::from_config(&RetryConfig::attempts(5)).unwrap();
        let (outcome, calls) = run(&policy, Method::GET, 4).await;
        assert_eq!(calls, 5);
        assert_eq!(outcome.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_surface_last_failure() {
        let policy = RetryPolicy::from_config(&RetryConfig::attempts(5)).unwrap();
        let (outcome, calls) = run(&policy, Method::GET, 5).await;
        assert_eq!(calls, 5);
        assert_eq!(outcome.unwrap().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_non_retryable_status_stops_immediately() {
        let policy = RetryPolicy::from_config(&RetryConfig::attempts(5)).unwrap();
        let calls = AtomicU32::new(0);
        let outcome = policy
            .execute("test", &Method::GET, || false, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { status(404) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_method_not_in_set_is_attempted_once() {
        let policy = RetryPolicy::from_config(&RetryConfig::attempts(5)).unwrap();
        let (_, calls) = run(&policy, Method::POST, 4).await;
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_connection_errors_are_retried() {
        let policy = RetryPolicy::from_config(&RetryConfig::attempts(3)).unwrap();
        let calls = AtomicU32::new(0);
        let outcome = policy
            .execute("test", &Method::GET, || false, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GatewayError::UpstreamConnect {
                        target: "http://127.0.0.1:1".into(),
                        reason: "connection refused".into(),
                    })
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcome, Err(GatewayError::UpstreamConnect { .. })));
    }

    #[tokio::test]
    async fn test_open_breaker_stops_retries() {
        let policy = RetryPolicy::from_config(&RetryConfig::attempts(5)).unwrap();
        let calls = AtomicU32::new(0);
        let _ = policy
            .execute(
                "test",
                &Method::GET,
                || calls.load(Ordering::SeqCst) >= 2,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { status(503) }
                },
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let backoff = Backoff {
            first: Duration::from_millis(10),
            max: Duration::from_millis(40),
            factor: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(30), Duration::from_millis(40));

        let jittered = Backoff {
            jitter: true,
            ..backoff
        };
        for retry in 1..10 {
            let delay = jittered.delay(retry);
            assert!(delay <= Duration::from_millis(40));
            assert!(delay >= Duration::from_millis(5));
        }
    }

    #[test]
    fn test_invalid_config() {
        assert!(RetryPolicy::from_config(&RetryConfig::attempts(0)).is_err());
        let mut config = RetryConfig::attempts(2);
        config.statuses = vec![42];
        assert!(RetryPolicy::from_config(&config).is_err());
    }
}
