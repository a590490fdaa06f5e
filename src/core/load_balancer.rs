use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::{
    config::{GatewayConfig, LoadBalanceStrategy},
    core::backend::UpstreamInstance,
    error::GatewayError,
    ports::discovery::Discovery,
};

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select one instance from a non-empty candidate list
    fn select<'a>(&self, instances: &'a [UpstreamInstance]) -> Option<&'a UpstreamInstance>;

    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy
#[derive(Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select<'a>(&self, instances: &'a [UpstreamInstance]) -> Option<&'a UpstreamInstance> {
        if instances.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        instances.get(count % instances.len())
    }
}

/// Uniform random selection
#[derive(Default)]
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select<'a>(&self, instances: &'a [UpstreamInstance]) -> Option<&'a UpstreamInstance> {
        if instances.is_empty() {
            return None;
        }
        instances.get(rand::rng().random_range(0..instances.len()))
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(strategy: &LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::Random => RandomStrategy.boxed(),
        }
    }
}

/// Picks one healthy instance of a logical service.
pub struct LoadBalancer {
    strategies: HashMap<String, Box<dyn LoadBalancingStrategy>>,
    fallback: Box<dyn LoadBalancingStrategy>,
}

impl LoadBalancer {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let strategies = config
            .services
            .iter()
            .map(|(name, service)| {
                (
                    name.clone(),
                    LoadBalancerFactory::create_strategy(&service.load_balance),
                )
            })
            .collect();
        Self {
            strategies,
            fallback: RoundRobinStrategy::new().boxed(),
        }
    }

    /// Resolve `service` and choose among its healthy instances. Unhealthy
    /// instances are never returned.
    pub async fn select(
        &self,
        discovery: &dyn Discovery,
        service: &str,
    ) -> Result<UpstreamInstance, GatewayError> {
        let instances = discovery.resolve(service).await.map_err(|e| {
            tracing::warn!("Discovery failed for '{}': {}", service, e);
            GatewayError::NoHealthyInstance(service.to_string())
        })?;

        let healthy: Vec<UpstreamInstance> =
            instances.into_iter().filter(|i| i.healthy).collect();

        let strategy = self.strategies.get(service).unwrap_or(&self.fallback);
        strategy
            .select(&healthy)
            .cloned()
            .ok_or_else(|| GatewayError::NoHealthyInstance(service.to_string()))
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("services", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::RouteConfig,
        core::backend::InstanceUrl,
        ports::discovery::{DiscoveryError, DiscoveryResult},
    };

    fn instance(port: u16, healthy: bool) -> UpstreamInstance {
        UpstreamInstance {
            service_name: "customers".to_string(),
            address: InstanceUrl::new(&format!("http://127.0.0.1:{port}")).unwrap(),
            healthy,
        }
    }

    struct FixedDiscovery(Vec<UpstreamInstance>);

    #[async_trait]
    impl Discovery for FixedDiscovery {
        async fn resolve(&self, service: &str) -> DiscoveryResult<Vec<UpstreamInstance>> {
            if service == "customers" {
                Ok(self.0.clone())
            } else {
                Err(DiscoveryError::UnknownService(service.to_string()))
            }
        }

        fn services(&self) -> Vec<String> {
            vec!["customers".to_string()]
        }
    }

    #[test]
    fn test_round_robin_wraps() {
        let strategy = RoundRobinStrategy::new();
        let instances = vec![instance(1, true), instance(2, true), instance(3, true)];
        let picks: Vec<_> = (0..4)
            .map(|_| strategy.select(&instances).unwrap().address.to_string())
            .collect();
        assert_eq!(
            picks,
            vec![
                "http://127.0.0.1:1",
                "http://127.0.0.1:2",
                "http://127.0.0.1:3",
                "http://127.0.0.1:1"
            ]
        );
        assert!(strategy.select(&[]).is_none());
    }

    #[test]
    fn test_random_picks_a_member() {
        let instances = vec![instance(1, true), instance(2, true)];
        let picked = RandomStrategy.select(&instances).unwrap();
        assert!(instances.contains(picked));
        assert!(RandomStrategy.select(&[]).is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_instances_are_never_selected() {
        let config = GatewayConfig::builder()
            .listen_addr("127.0.0.1:0")
            .service("customers", ["http://127.0.0.1:1"])
            .route(RouteConfig::new("customers", "/**", "lb://customers"))
            .build()
            .unwrap();
        let balancer = LoadBalancer::from_config(&config);
        let discovery = FixedDiscovery(vec![instance(1, false), instance(2, true), instance(3, false)]);

        for _ in 0..10 {
            let picked = balancer.select(&discovery, "customers").await.unwrap();
            assert_eq!(picked.address.as_str(), "http://127.0.0.1:2");
        }
    }

    #[tokio::test]
    async fn test_no_healthy_instance() {
        let balancer = LoadBalancer::from_config(&GatewayConfig::default());
        let discovery = FixedDiscovery(vec![instance(1, false)]);

        let err = balancer.select(&discovery, "customers").await.unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstance(ref s) if s == "customers"));

        let err = balancer.select(&discovery, "unknown").await.unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstance(_)));
    }
}
