use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::discovery::{ProbeTarget, StaticDiscovery},
    config::{HealthCheckConfig, HealthStatus},
    ports::http_client::HttpClient,
};

/// Active prober flipping instance health in a [`StaticDiscovery`].
pub struct HealthChecker {
    discovery: Arc<StaticDiscovery>,
    http_client: Arc<dyn HttpClient>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(
        discovery: Arc<StaticDiscovery>,
        http_client: Arc<dyn HttpClient>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            discovery,
            http_client,
            config,
        }
    }

    /// Probe every instance each interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("Health checking is disabled");
            return Ok(());
        }

        let interval = Duration::from_secs(self.config.interval_secs);
        tracing::info!(
            "Starting health checker for {} instances: interval {}s, timeout {}s, default path {}",
            self.discovery.instance_count(),
            self.config.interval_secs,
            self.config.timeout_secs,
            self.config.path
        );

        loop {
            // Sleep first so upstreams get a chance to start.
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {}
            }
            self.check_all().await;
        }

        tracing::info!("Health checker stopped");
        Ok(())
    }

    /// One probe round over every registered instance.
    pub async fn check_all(&self) {
        for target in self.discovery.probe_targets(&self.config.path) {
            match self.check_instance(&target.url).await {
                Ok(true) => self.handle_success(&target),
                Ok(false) => self.handle_failure(&target, "instance reported unhealthy"),
                Err(e) => self.handle_failure(&target, &format!("{e:#}")),
            }
        }
        tracing::debug!("Health check cycle completed");
    }

    pub async fn check_instance(&self, url: &str) -> Result<bool> {
        self.http_client
            .health_check(url, Duration::from_secs(self.config.timeout_secs))
            .await
            .wrap_err_with(|| format!("Failed to check health of {url}"))
    }

    fn handle_success(&self, target: &ProbeTarget) {
        if let Some(HealthStatus::Healthy) = target.health.record_success(self.config.healthy_threshold) {
            tracing::info!(
                "Instance {} of '{}' is now HEALTHY (after {} consecutive successes)",
                target.health.address(),
                target.service,
                target.health.consecutive_successes()
            );
        }
    }

    fn handle_failure(&self, target: &ProbeTarget, reason: &str) {
        tracing::debug!(
            "Health check failed for {}: {} ({}/{})",
            target.url,
            reason,
            target.health.consecutive_failures() + 1,
            self.config.unhealthy_threshold
        );
        if let Some(HealthStatus::Unhealthy) =
            target.health.record_failure(self.config.unhealthy_threshold)
        {
            tracing::warn!(
                "Instance {} of '{}' is now UNHEALTHY (after {} consecutive failures): {}",
                target.health.address(),
                target.service,
                target.health.consecutive_failures(),
                reason
            );
        }
    }
}
