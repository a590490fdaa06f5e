use async_trait::async_trait;
use thiserror::Error;

use crate::core::backend::UpstreamInstance;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DiscoveryError {
    #[error("Unknown service '{0}'")]
    UnknownService(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Source of upstream instances for logical service names.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Current instances of `service`, healthy or not.
    async fn resolve(&self, service: &str) -> DiscoveryResult<Vec<UpstreamInstance>>;

    /// Every known service name.
    fn services(&self) -> Vec<String>;
}
