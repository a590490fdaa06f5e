use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU8, AtomicU32, Ordering},
};

use thiserror::Error;
use url::Url;

use crate::{config::HealthStatus, metrics::set_instance_health_status};

const HEALTH_STATUS_UNHEALTHY: u8 = 0;
const HEALTH_STATUS_HEALTHY: u8 = 1;

/// Errors related to upstream instance addresses
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    #[error("Invalid instance URL: {0}")]
    InvalidUrl(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Base URL of one upstream instance, e.g. `http://127.0.0.1:8080`.
///
/// Only the origin is kept: any path, query or credentials in the configured
/// URL are ignored, and requests keep their own path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceUrl {
    /// Normalized form without a trailing slash.
    base: String,
    is_secure: bool,
}

impl InstanceUrl {
    pub fn new(url: &str) -> BackendResult<Self> {
        let parsed = Url::parse(url).map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;

        let is_secure = match parsed.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(BackendError::InvalidUrl(format!(
                    "Instance URL must use http:// or https://, got {other}:// in {url}"
                )));
            }
        };

        if parsed.host_str().is_none() {
            return Err(BackendError::InvalidUrl(format!("{url} has no host")));
        }
        if parsed.path() != "/" || parsed.query().is_some() {
            tracing::debug!("Ignoring path of upstream URL {}", url);
        }

        Ok(Self {
            base: parsed.origin().ascii_serialization(),
            is_secure,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.base
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Full upstream URL for a request path (which must start with `/`).
    pub fn join(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base, path_and_query)
    }

    /// WebSocket URL for the same instance (`http` -> `ws`, `https` -> `wss`).
    pub fn ws_url(&self, path_and_query: &str) -> String {
        let rest = self
            .base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base);
        let scheme = if self.is_secure { "wss" } else { "ws" };
        format!("{scheme}://{rest}{path_and_query}")
    }
}

impl FromStr for InstanceUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceUrl::new(s)
    }
}

impl fmt::Display for InstanceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)
    }
}

/// Snapshot of one instance as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamInstance {
    pub service_name: String,
    pub address: InstanceUrl,
    pub healthy: bool,
}

/// Probe-driven health of one registered instance.
///
/// Status flips only after `unhealthy_threshold` consecutive failed probes or
/// `healthy_threshold` consecutive successful ones.
#[derive(Debug)]
pub struct InstanceHealth {
    address: InstanceUrl,
    status: AtomicU8,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl InstanceHealth {
    /// New instances start healthy.
    pub fn new(address: InstanceUrl) -> Self {
        Self {
            address,
            status: AtomicU8::new(HEALTH_STATUS_HEALTHY),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> &InstanceUrl {
        &self.address
    }

    pub fn status(&self) -> HealthStatus {
        if self.status.load(Ordering::Acquire) == HEALTH_STATUS_HEALTHY {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Record a successful probe; returns the new status if it changed.
    pub fn record_success(&self, healthy_threshold: u32) -> Option<HealthStatus> {
        self.consecutive_failures.store(0, Ordering::Release);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;

        if successes >= healthy_threshold && !self.is_healthy() {
            self.mark_healthy();
            return Some(HealthStatus::Healthy);
        }
        None
    }

    /// Record a failed probe; returns the new status if it changed.
    pub fn record_failure(&self, unhealthy_threshold: u32) -> Option<HealthStatus> {
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        if failures >= unhealthy_threshold && self.is_healthy() {
            self.mark_unhealthy();
            return Some(HealthStatus::Unhealthy);
        }
        None
    }

    pub fn mark_healthy(&self) {
        self.status.store(HEALTH_STATUS_HEALTHY, Ordering::Release);
        set_instance_health_status(self.address.as_str(), true);
    }

    pub fn mark_unhealthy(&self) {
        self.status
            .store(HEALTH_STATUS_UNHEALTHY, Ordering::Release);
        set_instance_health_status(self.address.as_str(), false);
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}
