//! Static discovery registry built from the `services` configuration table.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    config::GatewayConfig,
    core::backend::{BackendResult, InstanceHealth, InstanceUrl, UpstreamInstance},
    ports::discovery::{Discovery, DiscoveryError, DiscoveryResult},
};

#[derive(Debug)]
struct ServiceEntry {
    health_path: Option<String>,
    instances: Vec<Arc<InstanceHealth>>,
}

/// One instance to probe.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub service: String,
    pub url: String,
    pub health: Arc<InstanceHealth>,
}

/// Service name -> instances, each carrying probe-driven health.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, ServiceEntry>,
}

impl StaticDiscovery {
    /// Build the registry. Instances also present in `previous` keep their
    /// health state, so a reload does not resurrect a dead instance.
    pub fn from_config(
        config: &GatewayConfig,
        previous: Option<&StaticDiscovery>,
    ) -> BackendResult<Self> {
        let mut services = HashMap::with_capacity(config.services.len());

        for (name, service) in &config.services {
            let mut instances = Vec::with_capacity(service.instances.len());
            for raw in &service.instances {
                let address = InstanceUrl::new(raw)?;
                let health = previous
                    .and_then(|p| p.find(name, &address))
                    .unwrap_or_else(|| Arc::new(InstanceHealth::new(address)));
                instances.push(health);
            }
            tracing::debug!("Registered service '{}' with {} instances", name, instances.len());
            services.insert(
                name.clone(),
                ServiceEntry {
                    health_path: service.health_path.clone(),
                    instances,
                },
            );
        }

        Ok(Self { services })
    }

    fn find(&self, service: &str, address: &InstanceUrl) -> Option<Arc<InstanceHealth>> {
        self.services
            .get(service)?
            .instances
            .iter()
            .find(|h| h.address() == address)
            .cloned()
    }

    /// Every instance with its probe URL (`default_path` unless the service
    /// overrides it).
    pub fn probe_targets(&self, default_path: &str) -> Vec<ProbeTarget> {
        let mut targets = Vec::new();
        for (name, entry) in &self.services {
            let path = entry.health_path.as_deref().unwrap_or(default_path);
            for health in &entry.instances {
                targets.push(ProbeTarget {
                    service: name.clone(),
                    url: health.address().join(path),
                    health: health.clone(),
                });
            }
        }
        targets
    }

    pub fn instance_count(&self) -> usize {
        self.services.values().map(|s| s.instances.len()).sum()
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve(&self, service: &str) -> DiscoveryResult<Vec<UpstreamInstance>> {
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| DiscoveryError::UnknownService(service.to_string()))?;

        Ok(entry
            .instances
            .iter()
            .map(|health| UpstreamInstance {
                service_name: service.to_string(),
                address: health.address().clone(),
                healthy: health.is_healthy(),
            })
            .collect())
    }

    fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn config(instances: &[&str]) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.services.insert(
            "customers".to_string(),
            ServiceConfig {
                instances: instances.iter().map(|s| s.to_string()).collect(),
                health_path: Some("/ping".to_string()),
                load_balance: Default::default(),
            },
        );
        config
    }

    #[tokio::test]
    async fn test_resolve_reports_health() {
        let discovery =
            StaticDiscovery::from_config(&config(&["http://127.0.0.1:1", "http://127.0.0.1:2"]), None)
                .unwrap();
        let targets = discovery.probe_targets("/health");
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.url.ends_with("/ping")));

        targets[0].health.mark_unhealthy();
        let instances = discovery.resolve("customers").await.unwrap();
        assert_eq!(instances.iter().filter(|i| i.healthy).count(), 1);

        assert!(matches!(
            discovery.resolve("orders").await,
            Err(DiscoveryError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_health_of_known_instances() {
        let first = StaticDiscovery::from_config(&config(&["http://127.0.0.1:1"]), None).unwrap();
        first.probe_targets("/health")[0].health.mark_unhealthy();

        let second = StaticDiscovery::from_config(
            &config(&["http://127.0.0.1:1", "http://127.0.0.1:3"]),
            Some(&first),
        )
        .unwrap();
        let instances = second.resolve("customers").await.unwrap();
        let by_address = |addr: &str| instances.iter().find(|i| i.address.as_str() == addr).unwrap().healthy;
        assert!(!by_address("http://127.0.0.1:1"));
        assert!(by_address("http://127.0.0.1:3"));
    }

    #[test]
    fn test_invalid_instance_url() {
        assert!(StaticDiscovery::from_config(&config(&["ftp://x"]), None).is_err());
    }
}
